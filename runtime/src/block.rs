//! Read-only view over a NEAR lake streamer message.
use async_trait::async_trait;
use serde_json::{json, Map, Value};

const EVENT_LOG_PREFIX: &str = "EVENT_JSON:";

#[derive(Clone, Debug, PartialEq)]
pub struct Block {
    block_height: u64,
    streamer_message: Value,
}

fn text(value: &Value, pointer: &str) -> Value {
    value.pointer(pointer).cloned().unwrap_or(Value::Null)
}

fn array<'a>(value: &'a Value, pointer: &str) -> &'a [Value] {
    value
        .pointer(pointer)
        .and_then(Value::as_array)
        .map(Vec::as_slice)
        .unwrap_or(&[])
}

/// `{"Action": {...}}` becomes `("Action", {...})`; plain strings such as
/// `"CreateAccount"` come back with a null payload.
fn tagged(value: &Value) -> (String, Value) {
    match value {
        Value::Object(object) if object.len() == 1 => {
            let (tag, payload) = object.iter().next().map(|(k, v)| (k.clone(), v.clone())).unwrap_or_default();
            (tag, payload)
        }
        Value::String(tag) => (tag.clone(), Value::Null),
        other => (String::new(), other.clone()),
    }
}

impl Block {
    pub fn new(block_height: u64, streamer_message: Value) -> Self {
        Block {
            block_height,
            streamer_message,
        }
    }

    /// Takes the height from the message header.
    pub fn from_streamer_message(streamer_message: Value) -> Option<Self> {
        let block_height = streamer_message.pointer("/block/header/height")?.as_u64()?;
        Some(Block::new(block_height, streamer_message))
    }

    pub fn block_height(&self) -> u64 {
        self.block_height
    }

    pub fn block_hash(&self) -> Option<String> {
        self.streamer_message
            .pointer("/block/header/hash")
            .and_then(Value::as_str)
            .map(str::to_string)
    }

    /// Nanoseconds since the epoch. Lake serializes the value as a string.
    pub fn timestamp_nanosec(&self) -> Option<u128> {
        match self.streamer_message.pointer("/block/header/timestamp_nanosec")? {
            Value::String(s) => s.parse().ok(),
            Value::Number(n) => n.as_u64().map(u128::from),
            _ => None,
        }
    }

    pub fn streamer_message(&self) -> &Value {
        &self.streamer_message
    }

    pub fn header(&self) -> Value {
        let header = text(&self.streamer_message, "/block/header");
        json!({
            "height": self.block_height,
            "hash": text(&header, "/hash"),
            "prevHash": text(&header, "/prev_hash"),
            "author": text(&self.streamer_message, "/block/author"),
            "timestampNanosec": self.timestamp_nanosec().map(|t| t.to_string()),
            "epochId": text(&header, "/epoch_id"),
            "chunksIncluded": text(&header, "/chunks_included"),
        })
    }

    fn shards(&self) -> &[Value] {
        array(&self.streamer_message, "/shards")
    }

    fn execution_outcomes(&self) -> impl Iterator<Item = &Value> {
        self.shards()
            .iter()
            .flat_map(|shard| array(shard, "/receipt_execution_outcomes").iter())
    }

    /// Receipts executed in this block, with their outcome.
    pub fn receipts(&self) -> Vec<Value> {
        self.execution_outcomes()
            .map(|outcome| {
                let receipt = text(outcome, "/receipt");
                let (kind, _) = tagged(&text(&receipt, "/receipt"));
                let (status, _) = tagged(&text(outcome, "/execution_outcome/outcome/status"));
                json!({
                    "receiptKind": kind,
                    "receiptId": text(&receipt, "/receipt_id"),
                    "receiverId": text(&receipt, "/receiver_id"),
                    "predecessorId": text(&receipt, "/predecessor_id"),
                    "status": status,
                    "executionOutcomeId": text(outcome, "/execution_outcome/id"),
                    "logs": text(outcome, "/execution_outcome/outcome/logs"),
                })
            })
            .collect()
    }

    /// Action receipts executed in this block with their operations.
    pub fn actions(&self) -> Vec<Value> {
        self.execution_outcomes()
            .filter_map(|outcome| {
                let receipt = text(outcome, "/receipt");
                let (kind, action) = tagged(&text(&receipt, "/receipt"));
                if kind != "Action" {
                    return None;
                }
                let operations: Vec<Value> = array(&action, "/actions")
                    .iter()
                    .map(|operation| {
                        let (name, payload) = tagged(operation);
                        let mut object = Map::new();
                        object.insert(name, payload);
                        Value::Object(object)
                    })
                    .collect();
                Some(json!({
                    "receiptId": text(&receipt, "/receipt_id"),
                    "predecessorId": text(&receipt, "/predecessor_id"),
                    "receiverId": text(&receipt, "/receiver_id"),
                    "signerId": text(&action, "/signer_id"),
                    "signerPublicKey": text(&action, "/signer_public_key"),
                    "operations": operations,
                }))
            })
            .collect()
    }

    /// NEP-297 events emitted through `EVENT_JSON:` logs.
    pub fn events(&self) -> Vec<Value> {
        self.execution_outcomes()
            .flat_map(|outcome| {
                let receipt_id = text(outcome, "/receipt/receipt_id");
                let receiver_id = text(outcome, "/receipt/receiver_id");
                let predecessor_id = text(outcome, "/receipt/predecessor_id");
                array(outcome, "/execution_outcome/outcome/logs")
                    .iter()
                    .filter_map(Value::as_str)
                    .filter_map(parse_event_log)
                    .map(|raw_event| {
                        json!({
                            "relatedReceiptId": receipt_id,
                            "receiverId": receiver_id,
                            "predecessorId": predecessor_id,
                            "standard": text(&raw_event, "/standard"),
                            "version": text(&raw_event, "/version"),
                            "event": text(&raw_event, "/event"),
                            "data": text(&raw_event, "/data"),
                        })
                    })
                    .collect::<Vec<_>>()
            })
            .collect()
    }

    pub fn transactions(&self) -> Vec<Value> {
        self.shards()
            .iter()
            .flat_map(|shard| array(shard, "/chunk/transactions").iter())
            .map(|transaction| {
                let (status, _) = tagged(&text(transaction, "/outcome/execution_outcome/outcome/status"));
                json!({
                    "transactionHash": text(transaction, "/transaction/hash"),
                    "signerId": text(transaction, "/transaction/signer_id"),
                    "signerPublicKey": text(transaction, "/transaction/public_key"),
                    "signature": text(transaction, "/transaction/signature"),
                    "receiverId": text(transaction, "/transaction/receiver_id"),
                    "status": status,
                    "operations": text(transaction, "/transaction/actions"),
                })
            })
            .collect()
    }
}

/// Source of blocks whose stream entry carries only the height.
#[async_trait]
pub trait BlockFetcher: Send + Sync {
    async fn fetch(&self, block_height: u64) -> anyhow::Result<Block>;
}

/// The JSON payload of an `EVENT_JSON:` log line.
pub fn parse_event_log(log: &str) -> Option<Value> {
    let raw = log.trim_start().strip_prefix(EVENT_LOG_PREFIX)?;
    serde_json::from_str(raw.trim()).ok()
}
