//! Wire envelope and framing.
//!
//! Every message is a 4-byte big-endian length prefix followed by a UTF-8
//! JSON object:
//!
//! ```text
//! [u32 BE: len][UTF-8 JSON bytes of len]
//! ```
//!
//! The JSON object is a flat [`Envelope`]; which fields are present decides
//! the message kind:
//!
//! | kind     | fields                                         |
//! |----------|------------------------------------------------|
//! | request  | `r`, `action`, `ffid`, `key`, `args`, `kwargs?` |
//! | response | `r`, `key` (tag), `val`, `sig?`, `error?`      |
//! | pre      | `r`, `pre: {token: handle}`                    |
//! | free     | `action: "free"`, `args: [handle, ...]`        |

use crate::config::WireConfig;
use crate::error::{BridgeError, Result};
use crate::value::PathKey;
use serde::{Deserialize, Serialize};
use serde_json::Value as Json;
use std::collections::BTreeMap;
use tokio::io::{AsyncReadExt, AsyncWriteExt};

/// Response discriminator.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Tag {
    String,
    Number,
    Void,
    Class,
    Fn,
    Obj,
    List,
    Inst,
    Serialized,
    Error,
}

impl Tag {
    pub fn as_str(&self) -> &'static str {
        match self {
            Tag::String => "string",
            Tag::Number => "number",
            Tag::Void => "void",
            Tag::Class => "class",
            Tag::Fn => "fn",
            Tag::Obj => "obj",
            Tag::List => "list",
            Tag::Inst => "inst",
            Tag::Serialized => "serialized",
            Tag::Error => "error",
        }
    }

    pub fn parse(s: &str) -> Option<Tag> {
        Some(match s {
            "string" => Tag::String,
            "number" => Tag::Number,
            "void" => Tag::Void,
            "class" => Tag::Class,
            "fn" => Tag::Fn,
            "obj" => Tag::Obj,
            "list" => Tag::List,
            "inst" => Tag::Inst,
            "serialized" => Tag::Serialized,
            "error" => Tag::Error,
            _ => return None,
        })
    }

    /// Tags whose value is a handle in the responder's table.
    pub fn is_reference(&self) -> bool {
        matches!(self, Tag::Class | Tag::Fn | Tag::Obj | Tag::List | Tag::Inst)
    }
}

/// Request action.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Action {
    Get,
    Call,
    Init,
    Set,
    Length,
    Inspect,
    Value,
    Keys,
    MakeClass,
    Free,
}

impl Action {
    pub fn as_str(&self) -> &'static str {
        match self {
            Action::Get => "get",
            Action::Call => "call",
            Action::Init => "init",
            Action::Set => "set",
            Action::Length => "length",
            Action::Inspect => "inspect",
            Action::Value => "value",
            Action::Keys => "keys",
            Action::MakeClass => "makeClass",
            Action::Free => "free",
        }
    }

    pub fn parse(s: &str) -> Option<Action> {
        Some(match s {
            "get" => Action::Get,
            "call" => Action::Call,
            "init" => Action::Init,
            "set" => Action::Set,
            "length" => Action::Length,
            "inspect" => Action::Inspect,
            "value" => Action::Value,
            "keys" => Action::Keys,
            "makeClass" => Action::MakeClass,
            "free" => Action::Free,
            _ => return None,
        })
    }
}

/// Flat JSON envelope as it appears on the wire.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Envelope {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub r: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub action: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ffid: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub key: Option<Json>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub args: Option<Json>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub kwargs: Option<Json>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub val: Option<Json>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sig: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pre: Option<BTreeMap<String, u64>>,
}

impl Envelope {
    /// Parse an envelope from a frame payload.
    pub fn decode(payload: &[u8]) -> Result<Envelope> {
        Ok(serde_json::from_slice(payload)?)
    }

    /// Correlation id an error response should carry if this envelope turns
    /// out to be a malformed request.
    pub fn reply_target(&self) -> Option<u64> {
        match self.action.as_deref() {
            Some("free") | None => None,
            Some(_) => self.r,
        }
    }
}

/// Decoded request.
#[derive(Debug, Clone)]
pub struct Request {
    pub id: u64,
    pub action: Action,
    pub handle: u64,
    pub path: Vec<PathKey>,
    pub args: Vec<Json>,
    pub kwargs: serde_json::Map<String, Json>,
}

/// Decoded response.
#[derive(Debug, Clone, PartialEq)]
pub struct Response {
    pub id: u64,
    pub tag: Tag,
    pub value: Json,
    pub signature: Option<String>,
    pub error: Option<String>,
}

impl Response {
    pub fn new(id: u64, tag: Tag, value: Json, signature: Option<String>) -> Self {
        Self {
            id,
            tag,
            value,
            signature,
            error: None,
        }
    }

    pub fn error(id: u64, message: String) -> Self {
        Self {
            id,
            tag: Tag::Error,
            value: Json::Null,
            signature: None,
            error: Some(message),
        }
    }
}

/// Any message that can travel in either direction.
#[derive(Debug, Clone)]
pub enum Message {
    Request(Request),
    Response(Response),
    /// Handles the receiver created for the sender's argument tokens.
    Pre { id: u64, handles: Vec<(u64, u64)> },
    Free(Vec<u64>),
}

impl Message {
    pub fn encode(self) -> Result<Vec<u8>> {
        Ok(serde_json::to_vec(&Envelope::from(self))?)
    }
}

impl From<Message> for Envelope {
    fn from(message: Message) -> Self {
        match message {
            Message::Request(req) => Envelope {
                r: Some(req.id),
                action: Some(req.action.as_str().to_string()),
                ffid: Some(req.handle),
                key: Some(encode_path(&req.path)),
                args: Some(Json::Array(req.args)),
                kwargs: if req.kwargs.is_empty() {
                    None
                } else {
                    Some(Json::Object(req.kwargs))
                },
                ..Default::default()
            },
            Message::Response(resp) => Envelope {
                r: Some(resp.id),
                key: Some(Json::String(resp.tag.as_str().to_string())),
                val: Some(resp.value),
                sig: resp.signature,
                error: resp.error,
                ..Default::default()
            },
            Message::Pre { id, handles } => Envelope {
                r: Some(id),
                pre: Some(
                    handles
                        .into_iter()
                        .map(|(token, handle)| (token.to_string(), handle))
                        .collect(),
                ),
                ..Default::default()
            },
            Message::Free(handles) => Envelope {
                action: Some(Action::Free.as_str().to_string()),
                args: Some(Json::Array(handles.into_iter().map(Json::from).collect())),
                ..Default::default()
            },
        }
    }
}

impl TryFrom<Envelope> for Message {
    type Error = BridgeError;

    fn try_from(env: Envelope) -> Result<Message> {
        if let Some(action) = env.action.as_deref() {
            let action = Action::parse(action)
                .ok_or_else(|| BridgeError::invalid(format!("unknown action '{}'", action)))?;
            if action == Action::Free {
                return Ok(Message::Free(decode_handles(env.args)?));
            }
            let id = env.r.ok_or_else(|| BridgeError::invalid("request without 'r'"))?;
            let handle = env
                .ffid
                .ok_or_else(|| BridgeError::invalid("request without 'ffid'"))?;
            let args = match env.args {
                None | Some(Json::Null) => Vec::new(),
                Some(Json::Array(args)) => args,
                Some(_) => return Err(BridgeError::invalid("'args' must be an array")),
            };
            let kwargs = match env.kwargs {
                None | Some(Json::Null) => serde_json::Map::new(),
                Some(Json::Object(kwargs)) => kwargs,
                Some(_) => return Err(BridgeError::invalid("'kwargs' must be an object")),
            };
            return Ok(Message::Request(Request {
                id,
                action,
                handle,
                path: decode_path(env.key)?,
                args,
                kwargs,
            }));
        }

        let id = env.r.ok_or_else(|| BridgeError::invalid("message without 'r'"))?;

        if let Some(pre) = env.pre {
            let handles = pre
                .into_iter()
                .map(|(token, handle)| {
                    token
                        .parse::<u64>()
                        .map(|token| (token, handle))
                        .map_err(|_| BridgeError::invalid(format!("bad pre token '{}'", token)))
                })
                .collect::<Result<Vec<_>>>()?;
            return Ok(Message::Pre { id, handles });
        }

        if let Some(error) = env.error {
            return Ok(Message::Response(Response::error(id, error)));
        }

        let tag = match env.key {
            Some(Json::String(tag)) => {
                Tag::parse(&tag).ok_or_else(|| BridgeError::invalid(format!("unknown tag '{}'", tag)))?
            }
            _ => return Err(BridgeError::invalid("response without tag")),
        };
        Ok(Message::Response(Response::new(
            id,
            tag,
            env.val.unwrap_or(Json::Null),
            env.sig,
        )))
    }
}

fn encode_path(path: &[PathKey]) -> Json {
    Json::Array(
        path.iter()
            .map(|key| match key {
                PathKey::Index(i) => Json::from(*i),
                PathKey::Name(s) => Json::String(s.clone()),
            })
            .collect(),
    )
}

fn decode_path(key: Option<Json>) -> Result<Vec<PathKey>> {
    match key {
        None | Some(Json::Null) => Ok(Vec::new()),
        Some(Json::String(s)) if s.is_empty() => Ok(Vec::new()),
        Some(Json::String(s)) => Ok(vec![PathKey::Name(s)]),
        Some(Json::Number(n)) => n
            .as_i64()
            .map(|i| vec![PathKey::Index(i)])
            .ok_or_else(|| BridgeError::invalid("path index must be an integer")),
        Some(Json::Array(items)) => items
            .into_iter()
            .map(|item| match item {
                Json::String(s) => Ok(PathKey::Name(s)),
                Json::Number(n) => n
                    .as_i64()
                    .map(PathKey::Index)
                    .ok_or_else(|| BridgeError::invalid("path index must be an integer")),
                other => Err(BridgeError::invalid(format!("bad path segment {}", other))),
            })
            .collect(),
        Some(other) => Err(BridgeError::invalid(format!("bad path {}", other))),
    }
}

fn decode_handles(args: Option<Json>) -> Result<Vec<u64>> {
    match args {
        None | Some(Json::Null) => Ok(Vec::new()),
        Some(Json::Array(items)) => items
            .iter()
            .map(|item| {
                item.as_u64()
                    .ok_or_else(|| BridgeError::invalid(format!("bad handle {}", item)))
            })
            .collect(),
        Some(other) => Ok(vec![other
            .as_u64()
            .ok_or_else(|| BridgeError::invalid(format!("bad handle {}", other)))?]),
    }
}

/// Read a length-prefixed frame from an async reader.
///
/// Frame format: `[4-byte BE u32 length][payload bytes]`
///
/// Returns `None` on clean EOF (peer closed connection).
pub async fn read_frame<R: AsyncReadExt + Unpin>(reader: &mut R) -> Result<Option<Vec<u8>>> {
    let mut len_buf = [0u8; 4];
    match reader.read_exact(&mut len_buf).await {
        Ok(_) => {}
        Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => return Ok(None),
        Err(e) => return Err(e.into()),
    }

    let len = u32::from_be_bytes(len_buf) as usize;

    if len > WireConfig::MAX_MESSAGE_SIZE {
        return Err(BridgeError::invalid(format!(
            "frame size {} exceeds maximum {}",
            len,
            WireConfig::MAX_MESSAGE_SIZE
        )));
    }

    let mut payload = vec![0u8; len];
    reader.read_exact(&mut payload).await?;

    Ok(Some(payload))
}

/// Write a length-prefixed frame to an async writer.
pub async fn write_frame<W: AsyncWriteExt + Unpin>(writer: &mut W, payload: &[u8]) -> Result<()> {
    if payload.len() > WireConfig::MAX_MESSAGE_SIZE {
        return Err(BridgeError::invalid(format!(
            "frame size {} exceeds maximum {}",
            payload.len(),
            WireConfig::MAX_MESSAGE_SIZE
        )));
    }
    let len = payload.len() as u32;
    writer.write_all(&len.to_be_bytes()).await?;
    writer.write_all(payload).await?;
    writer.flush().await?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn parse(json: Json) -> Result<Message> {
        let env: Envelope = serde_json::from_value(json).unwrap();
        Message::try_from(env)
    }

    #[test]
    fn test_request_encoding() {
        let req = Message::Request(Request {
            id: 3,
            action: Action::Call,
            handle: 0,
            path: vec![PathKey::from("items"), PathKey::Index(2)],
            args: vec![json!(1)],
            kwargs: serde_json::Map::new(),
        });
        let bytes = req.encode().unwrap();
        let wire: Json = serde_json::from_slice(&bytes).unwrap();
        assert_eq!(
            wire,
            json!({"r": 3, "action": "call", "ffid": 0, "key": ["items", 2], "args": [1]})
        );
    }

    #[test]
    fn test_decode_request_with_string_key() {
        let msg = parse(json!({"r": 1, "action": "get", "ffid": 4, "key": "name"})).unwrap();
        match msg {
            Message::Request(req) => {
                assert_eq!(req.action, Action::Get);
                assert_eq!(req.handle, 4);
                assert_eq!(req.path, vec![PathKey::from("name")]);
                assert!(req.args.is_empty());
            }
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn test_decode_response_and_error() {
        let ok = parse(json!({"r": 2, "key": "fn", "val": 17, "sig": "<function f>"})).unwrap();
        match ok {
            Message::Response(resp) => {
                assert_eq!(resp.tag, Tag::Fn);
                assert_eq!(resp.value, json!(17));
                assert_eq!(resp.signature.as_deref(), Some("<function f>"));
            }
            other => panic!("unexpected {:?}", other),
        }

        let err = parse(json!({"r": 2, "key": "error", "error": "boom"})).unwrap();
        assert!(matches!(err, Message::Response(Response { tag: Tag::Error, .. })));
    }

    #[test]
    fn test_decode_pre_and_free() {
        let pre = parse(json!({"r": 9, "pre": {"0": 12, "1": 13}})).unwrap();
        assert!(matches!(pre, Message::Pre { id: 9, ref handles } if handles == &vec![(0, 12), (1, 13)]));

        let free = parse(json!({"action": "free", "args": [5, 6]})).unwrap();
        assert!(matches!(free, Message::Free(ref h) if h == &vec![5, 6]));
    }

    #[test]
    fn test_unknown_action_is_invalid() {
        let env: Envelope =
            serde_json::from_value(json!({"r": 1, "action": "explode", "ffid": 0})).unwrap();
        assert_eq!(env.reply_target(), Some(1));
        assert!(matches!(Message::try_from(env), Err(BridgeError::InvalidMessage { .. })));
    }

    #[test]
    fn test_tag_serialization() {
        assert_eq!(serde_json::to_value(Tag::Serialized).unwrap(), json!("serialized"));
        assert!(Tag::Inst.is_reference());
        assert!(!Tag::Void.is_reference());
        assert_eq!(Tag::parse(Tag::Obj.as_str()), Some(Tag::Obj));
    }

    #[tokio::test]
    async fn test_frame_read_write_roundtrip() {
        let payload = b"{\"r\":1}";
        let mut buf = Vec::new();

        write_frame(&mut buf, payload).await.unwrap();

        let mut cursor = std::io::Cursor::new(buf);
        let read_back = read_frame(&mut cursor).await.unwrap();

        assert_eq!(read_back, Some(payload.to_vec()));
    }

    #[tokio::test]
    async fn test_frame_read_empty_stream_returns_none() {
        let mut cursor = std::io::Cursor::new(Vec::<u8>::new());
        let result = read_frame(&mut cursor).await.unwrap();
        assert!(result.is_none());
    }

    #[tokio::test]
    async fn test_frame_read_oversized_returns_error() {
        let huge_len: u32 = (WireConfig::MAX_MESSAGE_SIZE + 1) as u32;
        let mut buf = Vec::new();
        buf.extend_from_slice(&huge_len.to_be_bytes());
        buf.extend_from_slice(&[0u8; 8]);

        let mut cursor = std::io::Cursor::new(buf);
        let result = read_frame(&mut cursor).await;
        assert!(result.is_err());
    }
}
