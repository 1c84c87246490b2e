//! JSON-RPC client for aria2 over HTTP

use super::{AddUriOptions, DaemonRpc, GlobalStat, JobSnapshot, STATUS_KEYS};
use crate::config::{RetryConfig, RpcConfig};
use crate::error::{Error, Result, RpcError};
use crate::retry::{is_undelivered, with_retry, with_retry_if};
use crate::types::{Endpoint, JobId};
use async_trait::async_trait;
use serde::Deserialize;
use serde::de::DeserializeOwned;
use serde_json::{Value, json};
use std::sync::atomic::{AtomicU64, Ordering};

/// HTTP JSON-RPC client bound to one daemon endpoint
///
/// Every call carries the mandatory transport timeout from [`RpcConfig`].
/// Transient failures are retried with the configured backoff. `addUri` is
/// only retried when the connection itself failed, so a lost reply never
/// submits the same job twice. The readiness check and `shutdown` go out
/// exactly once.
pub struct Aria2Client {
    http: reqwest::Client,
    url: String,
    token: Option<String>,
    retry: RetryConfig,
    next_id: AtomicU64,
}

#[derive(Debug, Deserialize)]
struct Envelope {
    #[serde(default)]
    result: Option<Value>,
    #[serde(default)]
    error: Option<Fault>,
}

#[derive(Debug, Deserialize)]
struct Fault {
    code: i64,
    #[serde(default)]
    message: String,
}

impl Aria2Client {
    /// Build a client for `endpoint`
    pub fn new(endpoint: &Endpoint, config: &RpcConfig) -> Result<Self> {
        // The daemon is always on loopback; a system proxy must never see RPC traffic
        let http = reqwest::Client::builder()
            .timeout(config.timeout)
            .no_proxy()
            .build()?;

        Ok(Self {
            http,
            url: endpoint.rpc_url(),
            token: endpoint.token(),
            retry: config.retry.clone(),
            next_id: AtomicU64::new(1),
        })
    }

    /// Single `aria2.getGlobalStat` call without retry, used by the readiness check
    pub async fn check_ready(&self) -> Result<GlobalStat> {
        self.call_once("aria2.getGlobalStat", &[]).await
    }

    async fn call<T: DeserializeOwned>(&self, method: &'static str, params: Vec<Value>) -> Result<T> {
        let params = params.as_slice();
        with_retry(&self.retry, move || self.call_once(method, params)).await
    }

    /// Like [`Self::call`], but retried only when the request never reached the daemon
    async fn call_unrepeated<T: DeserializeOwned>(
        &self,
        method: &'static str,
        params: Vec<Value>,
    ) -> Result<T> {
        let params = params.as_slice();
        with_retry_if(&self.retry, is_undelivered, move || self.call_once(method, params)).await
    }

    async fn call_once<T: DeserializeOwned>(&self, method: &'static str, params: &[Value]) -> Result<T> {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);

        let mut full_params = Vec::with_capacity(params.len() + 1);
        if let Some(token) = &self.token {
            full_params.push(Value::String(token.clone()));
        }
        full_params.extend_from_slice(params);

        let body = json!({
            "jsonrpc": "2.0",
            "id": id.to_string(),
            "method": method,
            "params": full_params,
        });

        tracing::trace!(method, id, "sending RPC call");

        let response = self.http.post(&self.url).json(&body).send().await?;
        let status = response.status();
        let bytes = response.bytes().await?;

        let envelope: Envelope = match serde_json::from_slice(&bytes) {
            Ok(envelope) => envelope,
            Err(e) if !status.is_success() => {
                tracing::debug!(method, status = status.as_u16(), error = %e, "non-JSON RPC response");
                return Err(RpcError::Http {
                    method: method.to_string(),
                    status: status.as_u16(),
                }
                .into());
            }
            Err(e) => {
                return Err(RpcError::Malformed {
                    method: method.to_string(),
                    reason: e.to_string(),
                }
                .into());
            }
        };

        // aria2 reports an auth failure as HTTP 400 with a regular error object
        if let Some(fault) = envelope.error {
            return Err(RpcError::Fault {
                method: method.to_string(),
                code: fault.code,
                message: fault.message,
            }
            .into());
        }

        if !status.is_success() {
            return Err(RpcError::Http {
                method: method.to_string(),
                status: status.as_u16(),
            }
            .into());
        }

        let result = envelope.result.ok_or_else(|| RpcError::Malformed {
            method: method.to_string(),
            reason: "response has neither result nor error".to_string(),
        })?;

        serde_json::from_value(result).map_err(|e| {
            Error::from(RpcError::Malformed {
                method: method.to_string(),
                reason: e.to_string(),
            })
        })
    }
}

impl std::fmt::Debug for Aria2Client {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Aria2Client")
            .field("url", &self.url)
            .field("token", &self.token.as_ref().map(|_| "<redacted>"))
            .finish()
    }
}

#[async_trait]
impl DaemonRpc for Aria2Client {
    async fn add_uri(&self, urls: &[String], options: &AddUriOptions) -> Result<JobId> {
        let gid: String = self
            .call_unrepeated("aria2.addUri", vec![json!(urls), options.to_value()])
            .await?;
        Ok(JobId::new(gid))
    }

    async fn tell_active(&self) -> Result<Vec<JobSnapshot>> {
        self.call("aria2.tellActive", vec![json!(STATUS_KEYS)]).await
    }

    async fn tell_waiting(&self, offset: i64, num: u32) -> Result<Vec<JobSnapshot>> {
        self.call(
            "aria2.tellWaiting",
            vec![json!(offset), json!(num), json!(STATUS_KEYS)],
        )
        .await
    }

    async fn tell_stopped(&self, offset: i64, num: u32) -> Result<Vec<JobSnapshot>> {
        self.call(
            "aria2.tellStopped",
            vec![json!(offset), json!(num), json!(STATUS_KEYS)],
        )
        .await
    }

    async fn get_global_stat(&self) -> Result<GlobalStat> {
        self.call("aria2.getGlobalStat", Vec::new()).await
    }

    async fn shutdown(&self) -> Result<()> {
        let _: String = self.call_once("aria2.shutdown", &[]).await?;
        Ok(())
    }
}
