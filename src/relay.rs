//! Re-framing of upstream text increments as client-format SSE events.

use crate::conversion::{completion_id, message_id, unix_now};
use crate::models::anthropic::{
    AnthropicUsage, ContentBlock, MessagesResponse, StreamEvent, TextDelta,
};
use crate::models::chat::{ChatCompletionChunk, ChunkChoice, ChunkDelta};
use crate::models::ClientFormat;
use crate::sse::TextStream;
use bytes::Bytes;
use futures_util::stream::Stream;
use futures_util::StreamExt;
use serde::Serialize;

pub const DONE_SENTINEL: &str = "data: [DONE]\n\n";

/// Per-call streaming context. Lives exactly as long as the relay.
#[derive(Debug)]
pub struct StreamState {
    pub id: String,
    pub created: u64,
    pub model: String,
    pub format: ClientFormat,
    finished: bool,
}

impl StreamState {
    pub fn new(format: ClientFormat, client_model: &str) -> Self {
        let id = match format {
            ClientFormat::OpenAi => completion_id(),
            ClientFormat::Anthropic => message_id(),
        };
        Self {
            id,
            created: unix_now(),
            model: client_model.to_string(),
            format,
            finished: false,
        }
    }

    /// Events sent once before any text.
    pub fn preamble(&self) -> Vec<Bytes> {
        match self.format {
            ClientFormat::OpenAi => Vec::new(),
            ClientFormat::Anthropic => vec![
                sse_event(&StreamEvent::MessageStart {
                    message: MessagesResponse {
                        id: self.id.clone(),
                        object_type: "message".to_string(),
                        role: "assistant".to_string(),
                        content: Vec::new(),
                        model: self.model.clone(),
                        stop_reason: None,
                        stop_sequence: None,
                        usage: AnthropicUsage::default(),
                    },
                }),
                sse_event(&StreamEvent::ContentBlockStart {
                    index: 0,
                    content_block: ContentBlock::Text {
                        text: String::new(),
                    },
                }),
            ],
        }
    }

    pub fn increment(&self, text: &str) -> Bytes {
        match self.format {
            ClientFormat::OpenAi => sse_event(&self.chunk(
                ChunkDelta {
                    role: None,
                    content: Some(text.to_string()),
                },
                None,
            )),
            ClientFormat::Anthropic => sse_event(&StreamEvent::ContentBlockDelta {
                index: 0,
                delta: TextDelta::TextDelta {
                    text: text.to_string(),
                },
            }),
        }
    }

    /// Terminal event followed by the sentinel.
    pub fn terminal(&self) -> Vec<Bytes> {
        let last = match self.format {
            ClientFormat::OpenAi => {
                sse_event(&self.chunk(ChunkDelta::default(), Some("stop".to_string())))
            }
            ClientFormat::Anthropic => sse_event(&StreamEvent::MessageStop),
        };
        vec![last, Bytes::from_static(DONE_SENTINEL.as_bytes())]
    }

    /// Mark the stream as fully delivered.
    fn complete(&mut self) {
        self.finished = true;
        tracing::debug!(id = %self.id, "Stream completed");
    }

    fn chunk(&self, delta: ChunkDelta, finish_reason: Option<String>) -> ChatCompletionChunk {
        ChatCompletionChunk {
            id: self.id.clone(),
            object: "chat.completion.chunk".to_string(),
            created: self.created,
            model: self.model.clone(),
            choices: vec![ChunkChoice {
                index: 0,
                delta,
                finish_reason,
            }],
        }
    }
}

impl Drop for StreamState {
    fn drop(&mut self) {
        if !self.finished {
            tracing::debug!(id = %self.id, "Stream closed before completion");
        }
    }
}

fn sse_event<T: Serialize>(event: &T) -> Bytes {
    match serde_json::to_string(event) {
        Ok(json) => Bytes::from(format!("data: {json}\n\n")),
        Err(err) => {
            tracing::error!(error = %err, "Failed to serialize stream event");
            Bytes::new()
        }
    }
}

/// Drive `increments` to the client as SSE frames in `state.format`.
///
/// An upstream error ends the stream with an `Err` item so the connection is
/// aborted without a terminal event. Dropping the returned stream drops
/// `increments` with it.
pub fn relay_stream(
    mut increments: TextStream,
    mut state: StreamState,
) -> impl Stream<Item = Result<Bytes, std::io::Error>> + Send + 'static {
    async_stream::stream! {
        for event in state.preamble() {
            yield Ok(event);
        }

        let mut failure = None;
        while let Some(item) = increments.next().await {
            match item {
                Ok(text) if text.is_empty() => {}
                Ok(text) => {
                    yield Ok(state.increment(&text));
                }
                Err(err) => {
                    failure = Some(err);
                    break;
                }
            }
        }

        match failure {
            Some(err) => {
                tracing::warn!(id = %state.id, error = %err, "Upstream stream failed mid-response");
                yield Err(std::io::Error::other(err.to_string()));
            }
            None => {
                for event in state.terminal() {
                    yield Ok(event);
                }
                state.complete();
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ProxyError;
    use futures_util::stream;
    use serde_json::Value;
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::sync::Arc;

    /// Sets its flag when dropped.
    struct DropFlag(Arc<AtomicBool>);

    impl Drop for DropFlag {
        fn drop(&mut self) {
            self.0.store(true, Ordering::SeqCst);
        }
    }

    fn increments(items: Vec<crate::error::Result<&str>>) -> TextStream {
        stream::iter(
            items
                .into_iter()
                .map(|r| r.map(str::to_string))
                .collect::<Vec<_>>(),
        )
        .boxed()
    }

    async fn frames(
        s: impl Stream<Item = Result<Bytes, std::io::Error>>,
    ) -> (Vec<String>, bool) {
        let items: Vec<_> = s.collect().await;
        let errored = items.iter().any(|r| r.is_err());
        let frames = items
            .into_iter()
            .filter_map(|r| r.ok())
            .map(|b| String::from_utf8(b.to_vec()).unwrap())
            .collect();
        (frames, errored)
    }

    fn payload(frame: &str) -> Value {
        let json = frame
            .strip_prefix("data: ")
            .and_then(|f| f.strip_suffix("\n\n"))
            .unwrap();
        serde_json::from_str(json).unwrap()
    }

    #[tokio::test]
    async fn openai_stream_emits_deltas_then_stop_and_sentinel() {
        let state = StreamState::new(ClientFormat::OpenAi, "gpt-4o");
        let (out, errored) = frames(relay_stream(
            increments(vec![Ok("Hi"), Ok(""), Ok(" there")]),
            state,
        ))
        .await;
        assert!(!errored);
        assert_eq!(out.len(), 4);

        let first = payload(&out[0]);
        assert_eq!(first["object"], "chat.completion.chunk");
        assert_eq!(first["model"], "gpt-4o");
        assert_eq!(first["choices"][0]["delta"]["content"], "Hi");
        assert!(first["choices"][0]["finish_reason"].is_null());
        assert_eq!(payload(&out[1])["choices"][0]["delta"]["content"], " there");

        let last = payload(&out[2]);
        assert_eq!(last["choices"][0]["delta"], serde_json::json!({}));
        assert_eq!(last["choices"][0]["finish_reason"], "stop");
        assert_eq!(last["id"], first["id"]);
        assert_eq!(out[3], DONE_SENTINEL);
    }

    #[tokio::test]
    async fn anthropic_stream_has_single_preamble() {
        let state = StreamState::new(ClientFormat::Anthropic, "claude-3-haiku");
        let (out, _) = frames(relay_stream(increments(vec![Ok("a"), Ok("b")]), state)).await;
        let types: Vec<String> = out[..out.len() - 1]
            .iter()
            .map(|f| payload(f)["type"].as_str().unwrap().to_string())
            .collect();
        assert_eq!(
            types,
            vec![
                "message_start",
                "content_block_start",
                "content_block_delta",
                "content_block_delta",
                "message_stop"
            ]
        );
        let start = payload(&out[0]);
        assert_eq!(start["message"]["model"], "claude-3-haiku");
        assert_eq!(start["message"]["content"], serde_json::json!([]));
        assert!(start["message"]["stop_reason"].is_null());
        assert_eq!(payload(&out[1])["content_block"], serde_json::json!({"type": "text", "text": ""}));
        assert_eq!(
            payload(&out[3])["delta"],
            serde_json::json!({"type": "text_delta", "text": "b"})
        );
        assert_eq!(out.last().unwrap(), DONE_SENTINEL);
    }

    #[tokio::test]
    async fn upstream_error_aborts_without_terminal_event() {
        let state = StreamState::new(ClientFormat::OpenAi, "m");
        let (out, errored) = frames(relay_stream(
            increments(vec![Ok("partial"), Err(ProxyError::Upstream("reset".into())), Ok("never")]),
            state,
        ))
        .await;
        assert!(errored);
        assert_eq!(out.len(), 1);
        assert_eq!(payload(&out[0])["choices"][0]["delta"]["content"], "partial");
    }

    #[tokio::test]
    async fn empty_upstream_still_terminates_cleanly() {
        let state = StreamState::new(ClientFormat::Anthropic, "m");
        let (out, errored) = frames(relay_stream(increments(vec![]), state)).await;
        assert!(!errored);
        assert_eq!(out.len(), 4);
        assert_eq!(payload(&out[2])["type"], "message_stop");
    }

    #[tokio::test]
    async fn dropping_relay_releases_upstream() {
        let released = Arc::new(AtomicBool::new(false));
        let flag = DropFlag(released.clone());
        let upstream: TextStream = stream::iter(vec![Ok("first".to_string())])
            .chain(stream::pending())
            .map(move |item| {
                let _held = &flag;
                item
            })
            .boxed();

        let mut relay = Box::pin(relay_stream(
            upstream,
            StreamState::new(ClientFormat::OpenAi, "m"),
        ));
        let first = relay.next().await.unwrap().unwrap();
        assert_eq!(
            payload(std::str::from_utf8(&first).unwrap())["choices"][0]["delta"]["content"],
            "first"
        );
        assert!(!released.load(Ordering::SeqCst));

        drop(relay);
        assert!(released.load(Ordering::SeqCst));
    }
}
