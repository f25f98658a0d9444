//! JSON-RPC implementation of [`ChainReader`].
//!
//! Talks to any Ethereum-compatible node over HTTP using `eth_call`,
//! `eth_blockNumber` and `eth_getLogs`. The live subscription polls
//! `eth_getLogs` from the last seen block on a fixed interval, which
//! works against public endpoints that do not offer websocket filters.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use reqwest::Client;
use serde::Deserialize;
use serde_json::{json, Value};
use tokio::sync::mpsc;
use tracing::{debug, warn};

use teapoll_common::abi::{self, CAN_VOTE, GET_TOTALS, SECONDS_UNTIL_NEXT_VOTE, VOTED_EVENT};
use teapoll_common::{Address, Config, PollTotals, SequenceKey, VoteEvent, U256};

use crate::chain_reader::{ChainReader, RpcError, VoteSubscription};

#[derive(Debug, Deserialize)]
struct RpcResponse {
    result: Option<Value>,
    error: Option<RpcErrorObject>,
}

#[derive(Debug, Deserialize)]
struct RpcErrorObject {
    code: i64,
    message: String,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct RawLog {
    topics: Vec<String>,
    data: String,
    block_number: Option<String>,
    log_index: Option<String>,
    #[serde(default)]
    removed: bool,
}

struct RpcInner {
    url: String,
    contract: Address,
    client: Client,
    next_id: AtomicU64,
}

/// Poll contract reader over HTTP JSON-RPC.
#[derive(Clone)]
pub struct JsonRpcChainReader {
    inner: Arc<RpcInner>,
    poll_interval: Duration,
}

impl JsonRpcChainReader {
    /// Build a reader for `contract` at `url`.
    pub fn new(
        url: impl Into<String>,
        contract: Address,
        timeout: Duration,
        poll_interval: Duration,
    ) -> Result<Self, RpcError> {
        let client = Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| RpcError::Transport(format!("http client: {}", e)))?;
        Ok(Self {
            inner: Arc::new(RpcInner {
                url: url.into(),
                contract,
                client,
                next_id: AtomicU64::new(1),
            }),
            poll_interval,
        })
    }

    /// Build a reader from client configuration.
    pub fn from_config(cfg: &Config) -> Result<Self, RpcError> {
        Self::new(
            cfg.rpc_url.clone(),
            cfg.contract(),
            Duration::from_millis(cfg.rpc_timeout_ms),
            Duration::from_millis(cfg.event_poll_interval_ms),
        )
    }

    pub fn url(&self) -> &str {
        &self.inner.url
    }
}

impl RpcInner {
    async fn request(&self, method: &str, params: Value) -> Result<Value, RpcError> {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let body = json!({
            "jsonrpc": "2.0",
            "id": id,
            "method": method,
            "params": params,
        });
        let resp = self
            .client
            .post(&self.url)
            .json(&body)
            .send()
            .await
            .map_err(map_transport)?;
        let status = resp.status();
        if !status.is_success() {
            let t = resp.text().await.unwrap_or_default();
            return Err(RpcError::Transport(format!("{} failed {} {}", method, status, t)));
        }
        let parsed = resp.json::<RpcResponse>().await.map_err(map_transport)?;
        if let Some(err) = parsed.error {
            return Err(RpcError::Node {
                code: err.code,
                message: err.message,
            });
        }
        parsed
            .result
            .ok_or_else(|| RpcError::Decode(format!("{}: missing result", method)))
    }

    async fn eth_call(&self, data: Vec<u8>) -> Result<Vec<u8>, RpcError> {
        let params = json!([
            { "to": self.contract.as_str(), "data": abi::to_hex_data(&data) },
            "latest"
        ]);
        let result = self.request("eth_call", params).await?;
        let hex = result
            .as_str()
            .ok_or_else(|| RpcError::Decode("eth_call: result is not a string".to_string()))?;
        Ok(abi::parse_hex_data(hex)?)
    }

    async fn block_number(&self) -> Result<u64, RpcError> {
        let result = self.request("eth_blockNumber", json!([])).await?;
        let hex = result
            .as_str()
            .ok_or_else(|| RpcError::Decode("eth_blockNumber: result is not a string".to_string()))?;
        Ok(abi::parse_quantity(hex)?)
    }

    /// `Voted` logs in `[from, to]`, oldest first.
    async fn get_logs(&self, from: u64, to: u64) -> Result<Vec<VoteEvent>, RpcError> {
        let topic = abi::to_hex_data(&abi::event_topic(VOTED_EVENT));
        let params = json!([{
            "address": self.contract.as_str(),
            "topics": [topic],
            "fromBlock": abi::to_quantity(from),
            "toBlock": abi::to_quantity(to),
        }]);
        let result = self.request("eth_getLogs", params).await?;
        let raw: Vec<RawLog> = serde_json::from_value(result)
            .map_err(|e| RpcError::Decode(format!("eth_getLogs: {}", e)))?;

        let mut events = Vec::with_capacity(raw.len());
        for log in raw {
            if log.removed {
                continue;
            }
            match decode_log(&log) {
                Ok(event) => events.push(event),
                Err(e) => warn!("skipping undecodable Voted log: {}", e),
            }
        }
        events.sort_by_key(|e| e.sequence_key);
        Ok(events)
    }
}

fn decode_log(log: &RawLog) -> Result<VoteEvent, RpcError> {
    let block = log
        .block_number
        .as_deref()
        .ok_or_else(|| RpcError::Decode("log without blockNumber".to_string()))?;
    let index = log
        .log_index
        .as_deref()
        .ok_or_else(|| RpcError::Decode("log without logIndex".to_string()))?;
    let key = SequenceKey::new(abi::parse_quantity(block)?, abi::parse_quantity(index)?);
    let topics = log
        .topics
        .iter()
        .map(|t| abi::parse_hex_word(t))
        .collect::<Result<Vec<_>, _>>()?;
    let data = abi::parse_hex_data(&log.data)?;
    Ok(abi::decode_voted_log(&topics, &data, key)?)
}

fn map_transport(e: reqwest::Error) -> RpcError {
    if e.is_timeout() {
        RpcError::Timeout
    } else {
        RpcError::Transport(e.to_string())
    }
}

#[async_trait]
impl ChainReader for JsonRpcChainReader {
    async fn get_totals(&self) -> Result<PollTotals, RpcError> {
        let data = self.inner.eth_call(abi::encode_call(GET_TOTALS)).await?;
        let words = abi::decode_words(&data, 2)?;
        Ok(PollTotals::new(words[0], words[1]))
    }

    async fn can_vote(&self, account: &Address) -> Result<bool, RpcError> {
        let call = abi::encode_call_with_address(CAN_VOTE, account)?;
        let data = self.inner.eth_call(call).await?;
        Ok(abi::decode_bool(&data)?)
    }

    async fn get_cooldown_remaining(&self, account: &Address) -> Result<U256, RpcError> {
        let call = abi::encode_call_with_address(SECONDS_UNTIL_NEXT_VOTE, account)?;
        let data = self.inner.eth_call(call).await?;
        let words = abi::decode_words(&data, 1)?;
        Ok(words[0])
    }

    async fn query_recent_votes(&self, lookback_blocks: u64) -> Result<Vec<VoteEvent>, RpcError> {
        let latest = self.inner.block_number().await?;
        let from = latest.saturating_sub(lookback_blocks);
        self.inner.get_logs(from, latest).await
    }

    async fn subscribe_votes(&self) -> Result<VoteSubscription, RpcError> {
        let start = self.inner.block_number().await?;
        let (tx, rx) = mpsc::unbounded_channel();
        let inner = Arc::clone(&self.inner);
        let interval = self.poll_interval;

        let task = tokio::spawn(async move {
            let mut last_seen = start;
            debug!("vote log poller started at block {}", start);
            loop {
                tokio::time::sleep(interval).await;
                let latest = match inner.block_number().await {
                    Ok(n) => n,
                    Err(e) => {
                        warn!("vote log poller: block number failed: {}", e);
                        continue;
                    }
                };
                if latest <= last_seen {
                    continue;
                }
                match inner.get_logs(last_seen + 1, latest).await {
                    Ok(events) => {
                        for event in events {
                            if tx.send(event).is_err() {
                                return;
                            }
                        }
                        last_seen = latest;
                    }
                    Err(e) => warn!("vote log poller: getLogs {}..{} failed: {}", last_seen + 1, latest, e),
                }
            }
        });

        Ok(VoteSubscription::new(rx, move || task.abort()))
    }
}
