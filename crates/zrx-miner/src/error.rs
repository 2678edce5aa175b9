//! Error types for the miner's core and RPC layers.

use thiserror::Error;

/// Errors raised while turning an RPC block template into a [`crate::header::BlockTemplate`].
#[derive(Debug, Error)]
pub enum TemplateError {
    #[error("missing required field `{0}` in block template")]
    MissingField(&'static str),

    #[error("field `{field}` has wrong length: expected {expected} bytes, got {got}")]
    WrongLength {
        field: &'static str,
        expected: usize,
        got: usize,
    },

    #[error("field `{field}` is not valid hex: {source}")]
    BadHex {
        field: &'static str,
        #[source]
        source: hex::FromHexError,
    },

    #[error("bits 0x{bits:08x} has exponent {size} > 32, which this chain never produces")]
    BitsOverflow { bits: u32, size: u8 },

    #[error("bits 0x{bits:08x} has the sign bit set")]
    BitsNegative { bits: u32 },

    #[error("bits field `{value}` is not a valid 8-digit hex u32")]
    BadBits { value: String },
}

/// Errors raised while managing RandomX cache/dataset/VM state.
#[derive(Debug, Error)]
pub enum PoolError {
    #[error("failed to allocate RandomX cache")]
    CacheAlloc,

    #[error("failed to allocate RandomX dataset")]
    DatasetAlloc,

    #[error("failed to create RandomX VM for worker {worker_id}")]
    VmCreate { worker_id: u32 },

    #[error("thread count resize from {from} to {to} failed while {step}")]
    Resize {
        from: usize,
        to: usize,
        step: &'static str,
    },

    #[error("pool is not initialized")]
    NotInitialized,

    #[error("cannot re-key or resize while a mining session is active on this pool")]
    SessionActive,
}

/// Errors raised by the blocking JSON-RPC client.
#[derive(Debug, Error)]
pub enum RpcError {
    #[error("http error calling {method} at {url}: {source}")]
    Http {
        method: String,
        url: String,
        #[source]
        source: reqwest::Error,
    },

    #[error("http status {status} calling {method} at {url}: {body}")]
    HttpStatus {
        method: String,
        url: String,
        status: u16,
        body: String,
    },

    #[error("authentication failed against {url}")]
    AuthFailed { url: String },

    #[error("rpc error {code} calling {method}: {message}")]
    Rpc {
        code: i64,
        message: String,
        method: String,
    },

    #[error("no result in response to {context}")]
    NoResult { context: String },

    #[error("daemon busy (syncing) while calling {context}")]
    Busy { context: String },

    #[error("failed to decode json response from {method}: {source}")]
    Json {
        method: String,
        #[source]
        source: serde_json::Error,
    },
}

impl RpcError {
    /// Whether a retry might succeed: network hiccups and transient busy states are
    /// retried, auth failures and malformed-request errors are not.
    pub fn is_transient(&self) -> bool {
        match self {
            RpcError::Http { .. } | RpcError::Busy { .. } | RpcError::NoResult { .. } => true,
            RpcError::HttpStatus { status, .. } => *status >= 500,
            RpcError::AuthFailed { .. } | RpcError::Rpc { .. } | RpcError::Json { .. } => false,
        }
    }
}

/// What a submitted block's node response means.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SubmitOutcome {
    Accepted,
    Rejected(String),
}

/// Top-level errors the control loop treats as fatal to the process.
#[derive(Debug, Error)]
pub enum MinerError {
    #[error(transparent)]
    Template(#[from] TemplateError),

    #[error(transparent)]
    Pool(#[from] PoolError),

    #[error(transparent)]
    Rpc(#[from] RpcError),

    #[error("{0}")]
    Config(String),
}
