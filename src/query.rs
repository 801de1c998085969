//! JSON views of a group for the UI layer.
//!
//! Supported query types:
//! - `"members"`: every member with role and status
//! - `"messages"`: the decrypted timeline messages
//! - `"messages_after"`: cursor page, params `{"after_lamport": N, "limit": 50}`
//! - `"metadata"`: name, topic and icon
//! - `"heads"`: DAG heads and per-author lamport
//! - `"state_hash"`: BLAKE3 convergence hash
//! - `"limit_status"`: op count and limit status
use base64::engine::general_purpose::STANDARD as B64;
use base64::Engine;
use serde::Deserialize;
use serde_json::{json, Map, Value};
use thiserror::Error;

use crate::crdt::conversation::{ConversationEntry, EntryKind, MessageBody, MetadataValue};
use crate::crdt::ops::MetadataKey;
use crate::engine::group::GroupEngine;

const DEFAULT_PAGE: usize = 50;

#[derive(Error, Debug)]
pub enum QueryError {
    #[error("Unknown query type: {0}")]
    UnknownQuery(String),

    #[error("Bad query params: {0}")]
    Params(#[from] serde_json::Error),
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Query {
    Members,
    Messages,
    MessagesAfter { after_lamport: u64, limit: usize },
    Metadata,
    Heads,
    StateHash,
    LimitStatus,
}

#[derive(Deserialize)]
#[serde(default)]
struct CursorParams {
    after_lamport: u64,
    limit: usize,
}

impl Default for CursorParams {
    fn default() -> Self {
        CursorParams {
            after_lamport: 0,
            limit: DEFAULT_PAGE,
        }
    }
}

impl Query {
    /// Parse a query type and its JSON params. Empty params mean defaults.
    pub fn parse(query_type: &str, params_json: &str) -> Result<Self, QueryError> {
        Ok(match query_type {
            "members" => Query::Members,
            "messages" => Query::Messages,
            "messages_after" => {
                let params: CursorParams = if params_json.trim().is_empty() {
                    CursorParams::default()
                } else {
                    serde_json::from_str(params_json)?
                };
                Query::MessagesAfter {
                    after_lamport: params.after_lamport,
                    limit: params.limit,
                }
            }
            "metadata" => Query::Metadata,
            "heads" => Query::Heads,
            "state_hash" => Query::StateHash,
            "limit_status" => Query::LimitStatus,
            other => return Err(QueryError::UnknownQuery(other.to_string())),
        })
    }
}

pub fn run(engine: &GroupEngine, query: &Query) -> Value {
    match query {
        Query::Members => members(engine),
        Query::Messages => messages(&engine.conversation()),
        Query::MessagesAfter {
            after_lamport,
            limit,
        } => messages(&engine.messages_after(*after_lamport, *limit)),
        Query::Metadata => metadata(engine),
        Query::Heads => heads(engine),
        Query::StateHash => json!({ "hash": hex::encode(engine.state().state_hash()) }),
        Query::LimitStatus => json!({
            "status": format!("{:?}", engine.state().limit_status()),
            "op_count": engine.state().op_count,
        }),
    }
}

fn members(engine: &GroupEngine) -> Value {
    engine
        .members()
        .iter()
        .map(|m| {
            json!({
                "device_id": m.device_id.to_hex(),
                "pubkey_hex": hex::encode(m.pubkey),
                "role": m.role.as_str(),
                "accepted": m.accepted,
                "removed": m.removed,
                "muted": m.muted,
                "rekey_required": m.rekey_required,
                "invited_by_op_id": m.invited_by.to_hex(),
            })
        })
        .collect()
}

fn messages(entries: &[ConversationEntry]) -> Value {
    entries
        .iter()
        .filter_map(|entry| {
            let EntryKind::Message {
                msg_id,
                author,
                body,
                edited,
                reactions,
            } = &entry.kind
            else {
                return None;
            };
            let reactions: Vec<Value> = reactions
                .iter()
                .flat_map(|(emoji, reactors)| {
                    reactors
                        .iter()
                        .map(move |r| json!({ "reactor": r.to_hex(), "emoji": emoji }))
                })
                .collect();
            let (text, status) = match body {
                MessageBody::Text(t) => (Value::String(t.clone()), "ok"),
                MessageBody::Undecryptable { .. } => (Value::Null, "undecryptable"),
                MessageBody::Corrupt => (Value::Null, "corrupt"),
            };
            Some(json!({
                "msg_id": hex::encode(msg_id),
                "op_id": entry.op_id.to_hex(),
                "author": author.to_hex(),
                "timestamp_ms": entry.timestamp_ms,
                "lamport": entry.op_id.lamport,
                "text": text,
                "status": status,
                "edited": edited,
                "reactions": reactions,
            }))
        })
        .collect()
}

fn metadata(engine: &GroupEngine) -> Value {
    let mut obj = Map::new();
    for (key, value) in engine.metadata() {
        let MetadataValue::Value(bytes) = value else {
            continue;
        };
        match key {
            MetadataKey::Icon => {
                obj.insert("icon_b64".into(), Value::String(B64.encode(&bytes)));
            }
            MetadataKey::Name | MetadataKey::Topic => {
                let text = String::from_utf8_lossy(&bytes).into_owned();
                obj.insert(key.as_str().into(), Value::String(text));
            }
        }
    }
    Value::Object(obj)
}

fn heads(engine: &GroupEngine) -> Value {
    let state = engine.state();
    let heads: Vec<String> = state.heads.iter().map(|h| h.to_hex()).collect();
    let per_author: Map<String, Value> = state
        .max_lamport
        .iter()
        .map(|(device, lamport)| (device.to_hex(), Value::from(*lamport)))
        .collect();
    json!({
        "heads": heads,
        "per_author_lamport": per_author,
    })
}
