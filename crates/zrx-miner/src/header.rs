//! Block template parsing and 140-byte header assembly.
//!
//! The node hands back hashes in "display" order (the order a block explorer
//! prints them in, which is the reverse of how they sit in the header) for
//! most fields, but the RandomX seed hash is already in header ("internal")
//! order. Mixing these up silently produces a header that never hashes to
//! a valid block, so the two orderings get distinct newtypes below rather
//! than a shared `[u8; 32]`.

use crate::error::TemplateError;
use serde_json::Value;

/// A 32-byte hash as received from RPC fields that print in reversed
/// (big-endian-looking) order. Call [`DisplayHash::to_internal`] before
/// writing it into a header.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DisplayHash(pub [u8; 32]);

/// A 32-byte hash already in the byte order the header stores it in.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct InternalHash(pub [u8; 32]);

impl DisplayHash {
    pub fn from_hex(field: &'static str, s: &str) -> Result<Self, TemplateError> {
        let bytes = decode_hex32(field, s)?;
        Ok(DisplayHash(bytes))
    }

    pub fn to_internal(self) -> InternalHash {
        let mut out = self.0;
        out.reverse();
        InternalHash(out)
    }
}

impl InternalHash {
    pub fn from_hex(field: &'static str, s: &str) -> Result<Self, TemplateError> {
        let bytes = decode_hex32(field, s)?;
        Ok(InternalHash(bytes))
    }
}

fn decode_hex32(field: &'static str, s: &str) -> Result<[u8; 32], TemplateError> {
    let v = hex::decode(s).map_err(|source| TemplateError::BadHex { field, source })?;
    if v.len() != 32 {
        return Err(TemplateError::WrongLength {
            field,
            expected: 32,
            got: v.len(),
        });
    }
    let mut out = [0u8; 32];
    out.copy_from_slice(&v);
    Ok(out)
}

/// A block template ready to mine: nonce-independent header bytes, the
/// target to beat, and the transaction bytes needed to assemble a
/// submittable block once a nonce is found.
#[derive(Debug, Clone)]
pub struct BlockTemplate {
    pub version: u32,
    pub time: u32,
    pub bits: u32,
    pub height: u64,
    pub seed_height: u64,
    pub seed_hash: [u8; 32],
    pub next_seed_hash: Option<[u8; 32]>,
    pub target: [u8; 32],
    /// First 108 bytes of the 140-byte header (everything but the nonce).
    pub header_prefix: [u8; 108],
    pub coinbase_txn_hex: String,
    pub other_txn_hex: Vec<String>,
}

impl BlockTemplate {
    /// Parse a `getblocktemplate` JSON response into a [`BlockTemplate`].
    pub fn from_rpc_value(v: &Value) -> Result<Self, TemplateError> {
        let version = get_u32(v, "version")?;
        let time = get_u32(v, "curtime")?;
        let bits_hex = get_str(v, "bits")?;
        let bits = u32::from_str_radix(bits_hex, 16)
            .map_err(|_| TemplateError::BadBits { value: bits_hex.to_string() })?;
        check_bits(bits)?;

        let height = get_u64(v, "height")?;
        let seed_height = get_u64(v, "randomxseedheight")?;

        let prev = DisplayHash::from_hex("previousblockhash", get_str(v, "previousblockhash")?)?
            .to_internal();

        let (merkle_str, commitments_str) = match v.get("defaultroots") {
            Some(roots) => (
                get_str(roots, "merkleroot")?,
                get_str(roots, "blockcommitmentshash")?,
            ),
            None => (
                get_str(v, "merkleroot")?,
                get_str(v, "blockcommitmentshash")?,
            ),
        };
        let merkle = DisplayHash::from_hex("merkleroot", merkle_str)?.to_internal();
        let commitments =
            DisplayHash::from_hex("blockcommitmentshash", commitments_str)?.to_internal();

        let seed_hash = InternalHash::from_hex("randomxseedhash", get_str(v, "randomxseedhash")?)?;
        let next_seed_hash = match v.get("randomxnextseedhash").and_then(Value::as_str) {
            Some(s) => Some(InternalHash::from_hex("randomxnextseedhash", s)?.0),
            None => None,
        };

        let target = match v.get("target").and_then(Value::as_str) {
            Some(s) => DisplayHash::from_hex("target", s)?.to_internal().0,
            None => crate::target::compact_to_target(bits)?,
        };

        let coinbase_txn_hex = v
            .get("coinbasetxn")
            .and_then(|c| c.get("data"))
            .and_then(Value::as_str)
            .ok_or(TemplateError::MissingField("coinbasetxn.data"))?
            .to_string();

        let other_txn_hex = v
            .get("transactions")
            .and_then(Value::as_array)
            .map(|txs| {
                txs.iter()
                    .filter_map(|t| t.get("data").and_then(Value::as_str))
                    .map(String::from)
                    .collect()
            })
            .unwrap_or_default();

        let mut header_prefix = [0u8; 108];
        header_prefix[0..4].copy_from_slice(&version.to_le_bytes());
        header_prefix[4..36].copy_from_slice(&prev.0);
        header_prefix[36..68].copy_from_slice(&merkle.0);
        header_prefix[68..100].copy_from_slice(&commitments.0);
        header_prefix[100..104].copy_from_slice(&time.to_le_bytes());
        header_prefix[104..108].copy_from_slice(&bits.to_le_bytes());

        Ok(BlockTemplate {
            version,
            time,
            bits,
            height,
            seed_height,
            seed_hash: seed_hash.0,
            next_seed_hash,
            target,
            header_prefix,
            coinbase_txn_hex,
            other_txn_hex,
        })
    }

    /// Build the full 140-byte header from this template's prefix and a nonce.
    pub fn build_header(&self, nonce: &[u8; 32]) -> [u8; 140] {
        let mut header = [0u8; 140];
        header[0..108].copy_from_slice(&self.header_prefix);
        header[108..140].copy_from_slice(nonce);
        header
    }
}

fn check_bits(bits: u32) -> Result<(), TemplateError> {
    let size = (bits >> 24) as u8;
    let mantissa = bits & 0x007f_ffff;
    if bits & 0x0080_0000 != 0 {
        return Err(TemplateError::BitsNegative { bits });
    }
    if size > 32 {
        return Err(TemplateError::BitsOverflow { bits, size });
    }
    let _ = mantissa;
    Ok(())
}

fn get_str<'a>(v: &'a Value, field: &'static str) -> Result<&'a str, TemplateError> {
    v.get(field)
        .and_then(Value::as_str)
        .ok_or(TemplateError::MissingField(field))
}

fn get_u32(v: &Value, field: &'static str) -> Result<u32, TemplateError> {
    v.get(field)
        .and_then(Value::as_u64)
        .map(|n| n as u32)
        .ok_or(TemplateError::MissingField(field))
}

fn get_u64(v: &Value, field: &'static str) -> Result<u64, TemplateError> {
    v.get(field)
        .and_then(Value::as_u64)
        .ok_or(TemplateError::MissingField(field))
}

/// Bitcoin-style compact-size length prefix.
pub fn write_varint(out: &mut Vec<u8>, n: u64) {
    if n < 0xfd {
        out.push(n as u8);
    } else if n <= 0xffff {
        out.push(0xfd);
        out.extend_from_slice(&(n as u16).to_le_bytes());
    } else if n <= 0xffff_ffff {
        out.push(0xfe);
        out.extend_from_slice(&(n as u32).to_le_bytes());
    } else {
        out.push(0xff);
        out.extend_from_slice(&n.to_le_bytes());
    }
}

/// Assemble the bytes submitted via `submitblock`: header, PoW solution,
/// and the transactions the template handed back.
pub fn assemble_submission(header: &[u8; 140], pow_hash: &[u8; 32], template: &BlockTemplate) -> Vec<u8> {
    let mut out = Vec::with_capacity(
        140 + 1 + 32 + template.coinbase_txn_hex.len() / 2 + template.other_txn_hex.len() * 64,
    );
    out.extend_from_slice(header);
    write_varint(&mut out, 32);
    out.extend_from_slice(pow_hash);
    write_varint(&mut out, 1 + template.other_txn_hex.len() as u64);
    if let Ok(bytes) = hex::decode(&template.coinbase_txn_hex) {
        out.extend_from_slice(&bytes);
    }
    for tx in &template.other_txn_hex {
        if let Ok(bytes) = hex::decode(tx) {
            out.extend_from_slice(&bytes);
        }
    }
    out
}

/// `seed_height(h)`: the height whose block hash seeds the RandomX epoch
/// containing height `h`. Exposed only for status-line display; the
/// engine uses the seed hash the node already hands back.
pub fn seed_height(h: u64) -> u64 {
    const SEEDHASH_EPOCH_BLOCKS: u64 = 2048;
    const SEEDHASH_EPOCH_LAG: u64 = 96;
    if h <= SEEDHASH_EPOCH_BLOCKS + SEEDHASH_EPOCH_LAG {
        0
    } else {
        (h - SEEDHASH_EPOCH_LAG - 1) & !(SEEDHASH_EPOCH_BLOCKS - 1)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn display_hash_reverses() {
        let h = DisplayHash([1u8; 32]).to_internal();
        assert_eq!(h.0, [1u8; 32]); // symmetric value, reversal is a no-op here
        let mut asym = [0u8; 32];
        asym[0] = 0xaa;
        asym[31] = 0xbb;
        let rev = DisplayHash(asym).to_internal();
        assert_eq!(rev.0[0], 0xbb);
        assert_eq!(rev.0[31], 0xaa);
    }

    #[test]
    fn bits_overflow_rejected() {
        assert!(matches!(
            check_bits(0x21_000000),
            Err(TemplateError::BitsOverflow { .. })
        ));
    }

    #[test]
    fn bits_in_range_ok() {
        assert!(check_bits(0x1f09daa8).is_ok());
    }

    #[test]
    fn varint_encoding() {
        let mut out = Vec::new();
        write_varint(&mut out, 0);
        assert_eq!(out, vec![0]);
        out.clear();
        write_varint(&mut out, 0xfc);
        assert_eq!(out, vec![0xfc]);
        out.clear();
        write_varint(&mut out, 0xfd);
        assert_eq!(out, vec![0xfd, 0xfd, 0x00]);
        out.clear();
        write_varint(&mut out, 0x1_0000);
        assert_eq!(out, vec![0xfe, 0x00, 0x00, 0x01, 0x00]);
    }

    #[test]
    fn seed_height_genesis_epoch() {
        assert_eq!(seed_height(0), 0);
        assert_eq!(seed_height(2048 + 96), 0);
        assert_eq!(seed_height(2048 + 97), 2048);
    }

    #[test]
    fn header_prefix_layout() {
        let template = BlockTemplate {
            version: 4,
            time: 1_760_323_089,
            bits: 0x1f09daa8,
            height: 1583,
            seed_height: 0,
            seed_hash: [0u8; 32],
            next_seed_hash: None,
            target: [0u8; 32],
            header_prefix: {
                let mut p = [0u8; 108];
                p[0..4].copy_from_slice(&4u32.to_le_bytes());
                p[100..104].copy_from_slice(&1_760_323_089u32.to_le_bytes());
                p[104..108].copy_from_slice(&0x1f09daa8u32.to_le_bytes());
                p
            },
            coinbase_txn_hex: String::new(),
            other_txn_hex: vec![],
        };
        let header = template.build_header(&[0u8; 32]);
        assert_eq!(u32::from_le_bytes(header[0..4].try_into().unwrap()), 4);
        assert_eq!(
            u32::from_le_bytes(header[100..104].try_into().unwrap()),
            1_760_323_089
        );
        assert_eq!(
            u32::from_le_bytes(header[104..108].try_into().unwrap()),
            0x1f09daa8
        );
    }
}
