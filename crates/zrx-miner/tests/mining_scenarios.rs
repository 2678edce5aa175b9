//! End-to-end scenario tests that don't require a live node or a
//! fully-initialized RandomX state (those are covered by `#[ignore]`d unit
//! tests colocated with the modules they exercise).

use zrx_miner::header::BlockTemplate;
use zrx_miner::numa::NumaTopology;
use zrx_miner::pool::VmPool;
use zrx_miner::target::{compact_to_target, hash_meets_target};

fn sample_template_json(height: u64, bits: &str, seed_hash: &str) -> serde_json::Value {
    serde_json::json!({
        "version": 4,
        "previousblockhash": "23d39ee3000000000000000000000000000000000000000000000000000017aa",
        "curtime": 1_760_323_089u32,
        "bits": bits,
        "height": height,
        "randomxseedheight": 0,
        "randomxseedhash": seed_hash,
        "defaultroots": {
            "merkleroot": "cf56010c00000000000000000000000000000000000000000000000000008e4f",
            "blockcommitmentshash": "bf9cd3880000000000000000000000000000000000000000000000000000f542",
        },
        "coinbasetxn": { "data": "" },
        "transactions": [],
    })
}

// S8 — malformed templates produce named errors, not panics.

#[test]
fn missing_bits_is_a_named_error() {
    let mut v = sample_template_json(1583, "1f09daa8", &"11".repeat(32));
    v.as_object_mut().unwrap().remove("bits");
    let err = BlockTemplate::from_rpc_value(&v).unwrap_err();
    assert!(matches!(err, zrx_miner::error::TemplateError::MissingField("bits")));
}

#[test]
fn missing_seed_hash_is_a_named_error() {
    let mut v = sample_template_json(1583, "1f09daa8", &"11".repeat(32));
    v.as_object_mut().unwrap().remove("randomxseedhash");
    let err = BlockTemplate::from_rpc_value(&v).unwrap_err();
    assert!(matches!(
        err,
        zrx_miner::error::TemplateError::MissingField("randomxseedhash")
    ));
}

#[test]
fn oversized_bits_exponent_is_a_named_error() {
    let v = sample_template_json(1583, "21000001", &"11".repeat(32));
    let err = BlockTemplate::from_rpc_value(&v).unwrap_err();
    assert!(matches!(
        err,
        zrx_miner::error::TemplateError::BitsOverflow { .. }
    ));
}

#[test]
fn well_formed_template_parses() {
    let v = sample_template_json(1583, "1f09daa8", &"11".repeat(32));
    let template = BlockTemplate::from_rpc_value(&v).expect("should parse");
    assert_eq!(template.height, 1583);
    assert_eq!(template.bits, 0x1f09daa8);
    let expected_target = compact_to_target(0x1f09daa8).unwrap();
    assert_eq!(template.target, expected_target);
}

// S1 — block 1583's known scalar/bits fields and display-order hashes
// reconstruct into the documented header layout. The published reference
// only gives `prev_hash`/`merkle`/`commitments`/`nonce` truncated
// (`23d39ee3...aa17` etc., the middle bytes elided), so a bit-exact
// reproduction of the published RandomX hash can't be built from it —
// only the reversal/placement rules are checked here; `random_key_header_hashes_deterministically`
// below exercises a real VM keyed the same way instead.
#[test]
fn block_1583_header_prefix_matches_known_fields() {
    let v = sample_template_json(1583, "1f09daa8", &"00".repeat(32));
    let template = BlockTemplate::from_rpc_value(&v).unwrap();
    assert_eq!(
        u32::from_le_bytes(template.header_prefix[0..4].try_into().unwrap()),
        4
    );
    assert_eq!(
        u32::from_le_bytes(template.header_prefix[100..104].try_into().unwrap()),
        1_760_323_089
    );
    assert_eq!(template.bits, 0x1f09daa8);
    // previousblockhash "23d39ee3...0017aa" (display order) reverses whole,
    // so its last two bytes ("17", "aa") land first in the header, swapped.
    assert_eq!(template.header_prefix[4], 0xaa);
    assert_eq!(template.header_prefix[5], 0x17);
}

// S1 (RandomX leg) — the published reference hash for block 1583 can't be
// reproduced bit-exact (see above), but the real hashing path it exercises
// can: a genuine `RandomXVM` keyed to the chain's actual RandomX key,
// hashing a header built through `BlockTemplate`/`build_header`, must
// still satisfy property 4 (determinism) end to end.
#[test]
#[ignore] // allocates a real RandomX cache and VM
fn random_key_header_hashes_deterministically() {
    use randomx_rs::{RandomXCache, RandomXFlag, RandomXVM};

    let v = sample_template_json(1583, "1f09daa8", &"11".repeat(32));
    let template = BlockTemplate::from_rpc_value(&v).unwrap();
    let header = template.build_header(&[0u8; 32]);

    let flags = RandomXFlag::get_recommended_flags();
    let cache = RandomXCache::new(flags, b"ZcashRandomXPoW").expect("cache alloc failed");
    let mut vm = RandomXVM::new(flags, Some(cache), None).expect("vm create failed");

    let h1 = vm.calculate_hash(&header).expect("hash failed");
    let h2 = vm.calculate_hash(&header).expect("hash failed");
    assert_eq!(h1, h2);
}

// S2/S3 — compact target decoding and the comparator agree across the
// full range of a template produced this way.

#[test]
fn template_target_matches_direct_decode_and_compares_consistently() {
    let v = sample_template_json(1583, "1f09daa8", &"22".repeat(32));
    let template = BlockTemplate::from_rpc_value(&v).unwrap();
    assert!(hash_meets_target(&template.target, &template.target));
    let mut just_above = template.target;
    just_above[31] = just_above[31].saturating_add(1);
    if just_above != template.target {
        assert!(!hash_meets_target(&just_above, &template.target));
    }
}

// S6 — nonce seeding spreads across the reserved 224-bit range (checked
// indirectly: a large sample of draws in that range never collides).

#[test]
fn nonce_space_draws_are_distinct_across_many_samples() {
    use rand::RngCore;
    use std::collections::HashSet;
    let mut seen = HashSet::new();
    for _ in 0..50_000 {
        let mut nonce = [0u8; 32];
        rand::rngs::OsRng.fill_bytes(&mut nonce[2..30]);
        assert!(seen.insert(nonce));
    }
}

// Topology assignment sanity check with a synthetic multi-node layout,
// exercising the same code path `VmPool::init` uses for NUMA placement.

#[test]
fn numa_assignment_balances_threads_across_nodes() {
    let topo = NumaTopology {
        enabled: true,
        nodes: vec![
            zrx_miner::numa::NumaNode { id: 0, cpu_ids: vec![0, 1, 2, 3] },
            zrx_miner::numa::NumaNode { id: 1, cpu_ids: vec![4, 5, 6, 7] },
        ],
    };
    let assignment = topo.assign(8);
    let node0_count = assignment.thread_to_node.iter().filter(|&&n| n == 0).count();
    let node1_count = assignment.thread_to_node.iter().filter(|&&n| n == 1).count();
    assert_eq!(node0_count, 4);
    assert_eq!(node1_count, 4);
}

// S4/S5 — seed transitions and thread resizes against live RandomX state
// are expensive (real cache/dataset allocation), so they're gated behind
// --ignored rather than run on every `cargo test`.

#[test]
#[ignore]
fn seed_transition_rekeys_without_losing_thread_count() {
    let mut pool = VmPool::init(2, [1u8; 32], false, false, false).expect("init failed");
    assert_eq!(pool.num_threads(), 2);
    pool.update_seed([2u8; 32]).expect("re-key failed");
    assert_eq!(pool.seed_hash(), [2u8; 32]);
    assert_eq!(pool.num_threads(), 2);
}

#[test]
#[ignore]
fn resize_preserves_current_seed() {
    let mut pool = VmPool::init(2, [3u8; 32], false, false, false).expect("init failed");
    pool.resize(4).expect("resize failed");
    assert_eq!(pool.num_threads(), 4);
    assert_eq!(pool.seed_hash(), [3u8; 32]);
}
