//! Wire protocol: newline-delimited UTF-8 frames.
//!
//! A frame is either the heartbeat `h:<n>` or `<channel-index>:<payload>`.
//! Channel payloads are `<cmd>:<body>` with commands `init`, `auth`, `i`,
//! `c`, `e`, `cv`, and `log`. Entity responses are the one exception to
//! one-frame-per-line: the server sends `<chan>:e:<id>.<version>` followed by
//! a bare JSON (or `?`) line, which [`FrameReader`] reassembles before
//! routing.

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::{Result, SyncError};

/// Index page size requested during the initial download.
pub const INDEX_PAGE_SIZE: usize = 500;

// ── Frames ────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq)]
pub enum Frame {
    Heartbeat(u64),
    Channel { channel: usize, body: String },
}

/// Stateful inbound frame decoder; carries the pending entity header between
/// the two lines of an entity response.
#[derive(Debug, Default)]
pub struct FrameReader {
    entity: Option<(usize, String)>,
}

impl FrameReader {
    /// Decode one wire line. Returns `None` when the line was an entity
    /// header and the payload line is still outstanding.
    pub fn decode(&mut self, line: &str) -> Result<Option<Frame>> {
        if let Some((channel, header)) = self.entity.take() {
            return Ok(Some(Frame::Channel {
                channel,
                body: format!("{header}\n{line}"),
            }));
        }
        if let Some(rest) = line.strip_prefix("h:") {
            let n = rest
                .parse()
                .map_err(|_| SyncError::Protocol(format!("bad heartbeat {line:?}")))?;
            return Ok(Some(Frame::Heartbeat(n)));
        }
        let (prefix, body) = line
            .split_once(':')
            .ok_or_else(|| SyncError::Protocol(format!("frame without channel prefix {line:?}")))?;
        let channel: usize = prefix
            .parse()
            .map_err(|_| SyncError::Protocol(format!("bad channel index {prefix:?}")))?;
        if body.starts_with("e:") {
            self.entity = Some((channel, body.to_string()));
            return Ok(None);
        }
        Ok(Some(Frame::Channel {
            channel,
            body: body.to_string(),
        }))
    }
}

pub fn heartbeat_frame(count: u64) -> String {
    format!("h:{count}")
}

pub fn channel_frame(channel: usize, body: &str) -> String {
    format!("{channel}:{body}")
}

// ── Channel payloads ──────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq)]
pub enum ChannelMessage {
    /// Authenticated username, or `expired`.
    Auth(String),
    Index(IndexPage),
    Changes(Vec<RemoteChange>),
    /// `c:?` — the server rejected the last change outright.
    ChangeError,
    Entity {
        id: String,
        version: u64,
        /// `None` when the server answered `?` (unknown object/version).
        data: Option<Value>,
    },
    /// Body of an inbound `cv:` frame; `?` means the checkpoint is unknown.
    ChangeVersion(String),
    Log(u8),
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct IndexPage {
    #[serde(default)]
    pub index: Vec<IndexEntry>,
    #[serde(default)]
    pub mark: Option<String>,
    #[serde(default)]
    pub current: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct IndexEntry {
    pub id: String,
    pub v: u64,
    #[serde(default)]
    pub d: Option<Value>,
}

/// An inbound change, either a broadcast of another client's edit or the
/// acknowledgment of one of ours (matched by `ccid`).
#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct RemoteChange {
    #[serde(default)]
    pub clientid: Option<String>,
    pub id: String,
    #[serde(default)]
    pub o: Option<String>,
    /// The operation set, present for `o == "M"`.
    #[serde(default)]
    pub v: Option<Value>,
    #[serde(default)]
    pub sv: Option<u64>,
    #[serde(default)]
    pub ev: Option<u64>,
    #[serde(default)]
    pub ccid: Option<String>,
    #[serde(default)]
    pub cv: Option<String>,
    #[serde(default)]
    pub d: Option<Value>,
    #[serde(default)]
    pub error: Option<i64>,
}

/// An outbound change frame body.
#[derive(Debug, Clone, Serialize)]
pub struct ChangeRequest {
    pub clientid: String,
    pub id: String,
    pub o: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub v: Option<Value>,
    pub sv: u64,
    pub ccid: String,
}

/// The handshake sent when a channel (re)connects.
#[derive(Debug, Clone, Serialize)]
pub struct InitMessage {
    pub clientid: String,
    pub api: String,
    pub app_id: String,
    pub token: String,
    pub name: String,
    pub library: String,
    pub version: String,
}

/// Parse one channel payload into a message.
pub fn parse_channel_message(body: &str) -> Result<ChannelMessage> {
    let (cmd, rest) = match body.split_once(':') {
        Some((cmd, rest)) => (cmd, rest),
        None => (body, ""),
    };
    match cmd {
        "auth" => Ok(ChannelMessage::Auth(rest.to_string())),
        "i" => {
            let page: IndexPage = serde_json::from_str(rest)
                .map_err(|e| SyncError::Protocol(format!("bad index payload: {e}")))?;
            Ok(ChannelMessage::Index(page))
        }
        "c" => {
            if rest == "?" {
                return Ok(ChannelMessage::ChangeError);
            }
            let value: Value = serde_json::from_str(rest)
                .map_err(|e| SyncError::Protocol(format!("bad change payload: {e}")))?;
            let changes = match value {
                Value::Array(items) => items,
                single => vec![single],
            };
            let changes = changes
                .into_iter()
                .map(|c| {
                    serde_json::from_value(c)
                        .map_err(|e| SyncError::Protocol(format!("bad change object: {e}")))
                })
                .collect::<Result<Vec<RemoteChange>>>()?;
            Ok(ChannelMessage::Changes(changes))
        }
        "e" => {
            let (header, payload) = rest
                .split_once('\n')
                .ok_or_else(|| SyncError::Protocol("entity response without payload".into()))?;
            let (id, version) = header
                .rsplit_once('.')
                .ok_or_else(|| SyncError::Protocol(format!("bad entity header {header:?}")))?;
            let version: u64 = version
                .parse()
                .map_err(|_| SyncError::Protocol(format!("bad entity version {header:?}")))?;
            let data = if payload == "?" {
                None
            } else {
                Some(
                    serde_json::from_str(payload)
                        .map_err(|e| SyncError::Protocol(format!("bad entity payload: {e}")))?,
                )
            };
            Ok(ChannelMessage::Entity {
                id: id.to_string(),
                version,
                data,
            })
        }
        "cv" => Ok(ChannelMessage::ChangeVersion(rest.to_string())),
        "log" => {
            let level: u8 = rest
                .parse()
                .map_err(|_| SyncError::Protocol(format!("bad log level {rest:?}")))?;
            Ok(ChannelMessage::Log(level))
        }
        other => Err(SyncError::Protocol(format!(
            "unknown channel command {other:?}"
        ))),
    }
}

// ── Request builders ──────────────────────────────────────────────────────

/// Index request body: `<offset>:<mark>:<limit>:<since>`. The engine pages
/// from offset 1 via `mark` and leaves `since` empty to pull the full index.
pub fn index_request(mark: Option<&str>, limit: usize) -> String {
    format!("i:1:{}:{}:", mark.unwrap_or(""), limit)
}

pub fn entity_request(id: &str, version: u64) -> String {
    format!("e:{id}.{version}")
}

pub fn change_version_request(cv: &str) -> String {
    format!("cv:{cv}")
}
