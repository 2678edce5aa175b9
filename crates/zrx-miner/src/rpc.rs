//! Blocking JSON-RPC 1.0 client with HTTP Basic auth, used to talk to the
//! node's `getblocktemplate`/`submitblock` surface.

use crate::error::{RpcError, SubmitOutcome};
use base64::Engine;
use reqwest::blocking::Client;
use reqwest::header::{HeaderMap, HeaderValue, AUTHORIZATION, CONTENT_TYPE};
use serde_json::{json, Value};
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

const LOG_TARGET: &str = "zrx_miner::rpc";

#[derive(Debug, Clone)]
pub struct RpcConfig {
    pub url: String,
    pub username: Option<String>,
    pub password: Option<String>,
    pub timeout: Duration,
    pub retries: u32,
    pub retry_delay: Duration,
}

impl Default for RpcConfig {
    fn default() -> Self {
        Self {
            url: "http://127.0.0.1:8232".to_string(),
            username: None,
            password: None,
            timeout: Duration::from_secs(30),
            retries: 2,
            retry_delay: Duration::from_millis(500),
        }
    }
}

pub struct RpcClient {
    client: Client,
    config: RpcConfig,
    request_id: AtomicU64,
}

impl RpcClient {
    pub fn new(config: RpcConfig) -> Self {
        let client = Client::builder()
            .timeout(config.timeout)
            .build()
            .expect("failed to build HTTP client");
        RpcClient {
            client,
            config,
            request_id: AtomicU64::new(0),
        }
    }

    fn next_id(&self) -> u64 {
        self.request_id.fetch_add(1, Ordering::Relaxed)
    }

    fn build_headers(&self) -> HeaderMap {
        let mut headers = HeaderMap::new();
        headers.insert(CONTENT_TYPE, HeaderValue::from_static("application/json"));
        if let (Some(user), Some(pass)) = (&self.config.username, &self.config.password) {
            let creds = format!("{}:{}", user, pass);
            let encoded = base64::engine::general_purpose::STANDARD.encode(creds);
            if let Ok(value) = HeaderValue::from_str(&format!("Basic {}", encoded)) {
                headers.insert(AUTHORIZATION, value);
            }
        }
        headers
    }

    /// Call a JSON-RPC 1.0 method, retrying transient failures with
    /// exponential backoff.
    pub fn call(&self, method: &str, params: Value) -> Result<Value, RpcError> {
        let attempts = self.config.retries + 1;
        let mut last_err = RpcError::NoResult {
            context: method.to_string(),
        };

        for attempt in 0..attempts {
            if attempt > 0 {
                let delay = self.config.retry_delay * 2u32.saturating_pow(attempt - 1);
                log::debug!(target: LOG_TARGET, "retrying {} in {:?} (attempt {})", method, delay, attempt + 1);
                std::thread::sleep(delay);
            }

            match self.do_call(method, &params) {
                Ok(val) => return Ok(val),
                Err(e) => {
                    let should_retry = e.is_transient() && attempt + 1 < attempts;
                    if !should_retry {
                        return Err(e);
                    }
                    last_err = e;
                }
            }
        }

        Err(last_err)
    }

    fn do_call(&self, method: &str, params: &Value) -> Result<Value, RpcError> {
        let body = json!({
            "jsonrpc": "1.0",
            "id": self.next_id().to_string(),
            "method": method,
            "params": params,
        });

        let resp = self
            .client
            .post(&self.config.url)
            .headers(self.build_headers())
            .json(&body)
            .send()
            .map_err(|source| RpcError::Http {
                method: method.to_string(),
                url: self.config.url.clone(),
                source,
            })?;

        let status = resp.status().as_u16();
        if status == 401 {
            return Err(RpcError::AuthFailed {
                url: self.config.url.clone(),
            });
        }
        if status >= 400 {
            let body = resp.text().unwrap_or_default();
            return Err(RpcError::HttpStatus {
                method: method.to_string(),
                url: self.config.url.clone(),
                status,
                body: body.chars().take(500).collect(),
            });
        }

        let text = resp.text().map_err(|source| RpcError::Http {
            method: method.to_string(),
            url: self.config.url.clone(),
            source,
        })?;
        let parsed: Value = serde_json::from_str(&text).map_err(|source| RpcError::Json {
            method: method.to_string(),
            source,
        })?;

        if let Some(err) = parsed.get("error").filter(|e| !e.is_null()) {
            let code = err.get("code").and_then(Value::as_i64).unwrap_or(0);
            let message = err
                .get("message")
                .and_then(Value::as_str)
                .unwrap_or("unknown error")
                .to_string();
            if message.eq_ignore_ascii_case("BUSY") {
                return Err(RpcError::Busy {
                    context: method.to_string(),
                });
            }
            return Err(RpcError::Rpc {
                code,
                message,
                method: method.to_string(),
            });
        }

        parsed
            .get("result")
            .cloned()
            .ok_or(RpcError::NoResult {
                context: method.to_string(),
            })
    }

    pub fn get_block_template(&self) -> Result<Value, RpcError> {
        self.call(
            "getblocktemplate",
            json!([{ "capabilities": ["coinbasetxn", "workid", "coinbase/append"] }]),
        )
    }

    pub fn submit_block(&self, block_hex: &str) -> Result<SubmitOutcome, RpcError> {
        let result = self.call("submitblock", json!([block_hex]))?;
        Ok(classify_submission(&result))
    }

    pub fn get_blockchain_info(&self) -> Result<Value, RpcError> {
        self.call("getblockchaininfo", json!([]))
    }

    pub fn get_mining_info(&self) -> Result<Value, RpcError> {
        self.call("getmininginfo", json!([]))
    }

    pub fn get_wallet_info(&self) -> Result<Value, RpcError> {
        self.call("getwalletinfo", json!([]))
    }

    pub fn is_connected(&self) -> bool {
        self.get_blockchain_info().is_ok()
    }
}

fn classify_submission(result: &Value) -> SubmitOutcome {
    match result {
        Value::Null => SubmitOutcome::Accepted,
        Value::String(s) => match s.as_str() {
            "duplicate" | "inconclusive" | "duplicate-inconclusive" => SubmitOutcome::Accepted,
            other => SubmitOutcome::Rejected(other.to_string()),
        },
        other => SubmitOutcome::Rejected(other.to_string()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn config_defaults() {
        let config = RpcConfig::default();
        assert_eq!(config.retries, 2);
        assert_eq!(config.timeout, Duration::from_secs(30));
    }

    #[test]
    fn request_ids_increment() {
        let client = RpcClient::new(RpcConfig::default());
        let a = client.next_id();
        let b = client.next_id();
        assert_eq!(b, a + 1);
    }

    #[test]
    fn submission_accepted_variants() {
        assert_eq!(classify_submission(&Value::Null), SubmitOutcome::Accepted);
        assert_eq!(
            classify_submission(&json!("duplicate")),
            SubmitOutcome::Accepted
        );
        assert_eq!(
            classify_submission(&json!("inconclusive")),
            SubmitOutcome::Accepted
        );
    }

    #[test]
    fn submission_rejected_for_unknown_status() {
        assert_eq!(
            classify_submission(&json!("bad-cb-amount")),
            SubmitOutcome::Rejected("bad-cb-amount".to_string())
        );
    }
}
