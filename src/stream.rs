//! Streaming chat over the node's WebSocket surface.
//!
//! One request per connection: connect, send a `chat.request` frame, then
//! pull typed events until a `chat.done` arrives. Real nodes sometimes
//! close the socket cleanly without a done frame, so the stream applies a
//! completion heuristic on close: a turn that streamed tool calls is
//! treated as complete, anything else surfaces as a closed-stream error.

use std::collections::{BTreeMap, VecDeque};
use std::time::Duration;

use futures_util::{SinkExt, StreamExt};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::net::TcpStream;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};
use tokio_util::sync::CancellationToken;

use crate::errors::LinkError;

const CHAT_STREAM_PATH: &str = "/v1/chat/stream";

/// One message in the conversation being sent to the node.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChatMessage {
    pub role: String,
    pub content: String,
}

/// Payload of the `chat.request` frame.
#[derive(Debug, Clone, Serialize)]
pub struct ChatRequest {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub model: Option<String>,
    pub messages: Vec<ChatMessage>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tools: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub temperature: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub max_tokens: Option<u32>,
}

impl ChatRequest {
    pub fn new(messages: Vec<ChatMessage>) -> Self {
        Self {
            model: None,
            messages,
            tools: None,
            temperature: None,
            max_tokens: None,
        }
    }
}

/// A fully assembled tool invocation requested by the model.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ToolCall {
    pub index: u32,
    pub id: String,
    pub name: String,
    pub arguments: String,
}

/// Events yielded by [`ChatStream::next_event`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StreamEvent {
    /// A chunk of assistant text.
    Token(String),
    /// Raw per-frame tool-call fragment, in arrival order.
    ToolCallDelta {
        index: u32,
        id: Option<String>,
        name: Option<String>,
        arguments: String,
    },
    /// A tool call whose fragments have all arrived. Emitted before `Done`.
    ToolCallComplete(ToolCall),
    /// Turn finished. Always the last event of a successful stream.
    Done { finish_reason: String },
    /// Server-reported failure; terminal.
    Error { message: String },
}

/// Timeouts and cancellation for one streaming call.
#[derive(Debug, Clone)]
pub struct StreamOptions {
    /// Budget for connect + sending the request frame.
    pub handshake_timeout: Duration,
    /// Maximum silence between server frames once streaming.
    pub idle_timeout: Duration,
    pub cancel: Option<CancellationToken>,
}

impl Default for StreamOptions {
    fn default() -> Self {
        Self {
            handshake_timeout: Duration::from_secs(5),
            idle_timeout: Duration::from_secs(120),
            cancel: None,
        }
    }
}

/// Open a chat stream against `host:port`. Fails fast on a pre-aborted
/// token and converts a slow handshake into `HandshakeTimeout`.
pub async fn stream_chat(
    host: &str,
    port: u16,
    request: &ChatRequest,
    opts: StreamOptions,
) -> Result<ChatStream, LinkError> {
    let cancel = opts.cancel.clone().unwrap_or_default();
    if cancel.is_cancelled() {
        return Err(LinkError::Cancelled);
    }

    let url = format!("ws://{}:{}{}", host, port, CHAT_STREAM_PATH);
    let handshake_ms = opts.handshake_timeout.as_millis() as u64;

    let handshake = async {
        let (mut ws, _) = connect_async(url.as_str())
            .await
            .map_err(|e| LinkError::Transport(e.to_string()))?;

        let mut frame = serde_json::to_value(request)
            .map_err(|e| LinkError::Protocol(e.to_string()))?;
        frame["type"] = Value::String("chat.request".to_string());
        ws.send(Message::Text(frame.to_string()))
            .await
            .map_err(|e| LinkError::Transport(e.to_string()))?;
        Ok::<_, LinkError>(ws)
    };

    let ws = tokio::select! {
        _ = cancel.cancelled() => return Err(LinkError::Cancelled),
        res = tokio::time::timeout(opts.handshake_timeout, handshake) => {
            res.map_err(|_| LinkError::HandshakeTimeout(handshake_ms))??
        }
    };
    tracing::debug!(url = %url, "chat_stream_open");

    Ok(ChatStream {
        ws,
        idle_timeout: opts.idle_timeout,
        cancel,
        pending: VecDeque::new(),
        partial_calls: BTreeMap::new(),
        payload_frames: 0,
        tool_frames: 0,
        finished: false,
    })
}

/// An open chat stream. Pull events with [`next_event`] until it returns
/// `Ok(None)`.
///
/// [`next_event`]: ChatStream::next_event
#[derive(Debug)]
pub struct ChatStream {
    ws: WebSocketStream<MaybeTlsStream<TcpStream>>,
    idle_timeout: Duration,
    cancel: CancellationToken,
    pending: VecDeque<StreamEvent>,
    partial_calls: BTreeMap<u32, ToolCall>,
    payload_frames: u64,
    tool_frames: u64,
    finished: bool,
}

impl ChatStream {
    /// Next event, `Ok(None)` once the turn has ended. `Done` (or `Error`)
    /// is always the final `Some`.
    pub async fn next_event(&mut self) -> Result<Option<StreamEvent>, LinkError> {
        loop {
            if let Some(ev) = self.pending.pop_front() {
                if matches!(ev, StreamEvent::Done { .. } | StreamEvent::Error { .. }) {
                    self.finished = true;
                }
                return Ok(Some(ev));
            }
            if self.finished {
                return Ok(None);
            }

            let frame = tokio::select! {
                _ = self.cancel.cancelled() => return Err(LinkError::Cancelled),
                recv = tokio::time::timeout(self.idle_timeout, self.ws.next()) => {
                    recv.map_err(|_| LinkError::IdleTimeout(self.idle_timeout.as_millis() as u64))?
                }
            };

            match frame {
                Some(Ok(Message::Text(text))) => self.handle_text(&text)?,
                Some(Ok(Message::Close(_))) | None => self.handle_close()?,
                Some(Ok(_)) => {} // ping/pong/binary, not payload
                Some(Err(e)) => {
                    // Abrupt transport death gets the same heuristic as a
                    // clean close when tool calls already streamed.
                    tracing::debug!(error = %e, "chat_stream_transport_error");
                    self.handle_close()?;
                }
            }
        }
    }

    fn handle_text(&mut self, text: &str) -> Result<(), LinkError> {
        let frame: Value = serde_json::from_str(text)
            .map_err(|e| LinkError::Protocol(format!("bad frame: {e}")))?;
        let kind = frame
            .get("type")
            .and_then(Value::as_str)
            .ok_or_else(|| LinkError::Protocol("frame missing type".into()))?;
        self.payload_frames += 1;

        match kind {
            "chat.token" => {
                let content = frame
                    .get("content")
                    .and_then(Value::as_str)
                    .unwrap_or_default()
                    .to_string();
                self.pending.push_back(StreamEvent::Token(content));
            }
            "chat.tool_call" => {
                self.tool_frames += 1;
                self.handle_tool_frame(&frame)?;
            }
            "chat.done" => {
                let finish_reason = frame
                    .get("finish_reason")
                    .and_then(Value::as_str)
                    .unwrap_or("stop")
                    .to_string();
                self.flush_tool_calls();
                self.pending.push_back(StreamEvent::Done { finish_reason });
            }
            "chat.error" => {
                let message = frame
                    .get("error")
                    .and_then(Value::as_str)
                    .unwrap_or("unknown server error")
                    .to_string();
                tracing::warn!(error = %message, "chat_stream_server_error");
                self.pending.push_back(StreamEvent::Error { message });
            }
            other => {
                // Unknown frame types are skipped, not fatal; the protocol
                // grows additive frame kinds.
                tracing::debug!(kind = other, "chat_stream_unknown_frame");
            }
        }
        Ok(())
    }

    fn handle_tool_frame(&mut self, frame: &Value) -> Result<(), LinkError> {
        let tc = frame
            .get("tool_call")
            .ok_or_else(|| LinkError::Protocol("tool_call frame without payload".into()))?;
        let index = tc.get("index").and_then(Value::as_u64).unwrap_or(0) as u32;
        let id = tc.get("id").and_then(Value::as_str).map(|s| s.to_string());
        let name = tc.get("name").and_then(Value::as_str).map(|s| s.to_string());
        let arguments = tc
            .get("arguments")
            .and_then(Value::as_str)
            .unwrap_or_default()
            .to_string();

        let partial = self.partial_calls.entry(index).or_insert_with(|| ToolCall {
            index,
            id: String::new(),
            name: String::new(),
            arguments: String::new(),
        });
        if let Some(id) = &id {
            partial.id = id.clone();
        }
        if let Some(name) = &name {
            partial.name = name.clone();
        }
        partial.arguments.push_str(&arguments);

        self.pending.push_back(StreamEvent::ToolCallDelta {
            index,
            id,
            name,
            arguments,
        });
        Ok(())
    }

    /// Emit accumulated tool calls as complete, in index order.
    fn flush_tool_calls(&mut self) {
        for (_, call) in std::mem::take(&mut self.partial_calls) {
            self.pending.push_back(StreamEvent::ToolCallComplete(call));
        }
    }

    /// Close (or transport loss) before `chat.done`: decide whether the
    /// turn completed implicitly.
    fn handle_close(&mut self) -> Result<(), LinkError> {
        if self.tool_frames > 0 {
            // Nodes that hand off to tool execution close without a done
            // frame; the streamed calls are the result.
            self.flush_tool_calls();
            self.pending.push_back(StreamEvent::Done {
                finish_reason: "tool_calls".to_string(),
            });
            return Ok(());
        }
        if self.payload_frames == 0 {
            return Err(LinkError::StreamClosed(
                "connection closed before any response".into(),
            ));
        }
        Err(LinkError::StreamClosed(
            "connection closed mid-response".into(),
        ))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    // handle_text / handle_close are exercised through a ChatStream in the
    // integration tests; the pure frame maths are checked here.

    #[test]
    fn test_chat_request_serializes_without_empty_fields() {
        let req = ChatRequest::new(vec![ChatMessage {
            role: "user".into(),
            content: "hi".into(),
        }]);
        let v = serde_json::to_value(&req).unwrap();
        assert!(v.get("model").is_none());
        assert!(v.get("tools").is_none());
        assert_eq!(v["messages"][0]["role"], "user");
    }

    #[test]
    fn test_chat_request_frame_gains_type_tag() {
        let req = ChatRequest::new(vec![]);
        let mut frame = serde_json::to_value(&req).unwrap();
        frame["type"] = Value::String("chat.request".to_string());
        assert_eq!(frame["type"], "chat.request");
    }

    #[test]
    fn test_tool_call_fragments_accumulate_in_index_order() {
        let mut calls: BTreeMap<u32, ToolCall> = BTreeMap::new();
        for (idx, args) in [(1u32, "{\"b\""), (0u32, "{\"a\""), (1u32, ":2}"), (0u32, ":1}")] {
            let partial = calls.entry(idx).or_insert_with(|| ToolCall {
                index: idx,
                id: format!("call-{idx}"),
                name: String::new(),
                arguments: String::new(),
            });
            partial.arguments.push_str(args);
        }
        let flushed: Vec<ToolCall> = calls.into_values().collect();
        assert_eq!(flushed[0].index, 0);
        assert_eq!(flushed[0].arguments, "{\"a\":1}");
        assert_eq!(flushed[1].index, 1);
        assert_eq!(flushed[1].arguments, "{\"b\":2}");
    }

    #[tokio::test]
    async fn test_pre_cancelled_token_rejects_before_connect() {
        let cancel = CancellationToken::new();
        cancel.cancel();
        let opts = StreamOptions {
            cancel: Some(cancel),
            ..Default::default()
        };
        let err = stream_chat("127.0.0.1", 59_980, &ChatRequest::new(vec![]), opts)
            .await
            .unwrap_err();
        assert!(matches!(err, LinkError::Cancelled));
    }
}
