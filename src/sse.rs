//! Decoding of the upstream `alt=sse` stream into text fragments.
//!
//! The upstream sends one `data: <json>` line per update. Chunk boundaries
//! from the transport are arbitrary, so lines are reassembled here before
//! parsing. Lines that fail to parse are skipped; the rest of the stream
//! still flows.

use crate::error::{ProxyError, Result};
use crate::models::gemini::GeminiResponse;
use bytes::Bytes;
use futures_util::stream::Stream;
use futures_util::StreamExt;
use std::collections::VecDeque;
use std::pin::Pin;
use std::task::{Context, Poll};

/// Boxed stream of text fragments as produced by an upstream client.
pub type TextStream = Pin<Box<dyn Stream<Item = Result<String>> + Send>>;

pub struct GeminiSseDecoder<S> {
    inner: S,
    buffer: Vec<u8>,
    ready: VecDeque<String>,
    done: bool,
}

impl<S, E> GeminiSseDecoder<S>
where
    S: Stream<Item = std::result::Result<Bytes, E>> + Unpin,
    E: Into<ProxyError>,
{
    pub fn new(inner: S) -> Self {
        Self {
            inner,
            buffer: Vec::new(),
            ready: VecDeque::new(),
            done: false,
        }
    }

    fn drain_lines(&mut self) {
        while let Some(pos) = self.buffer.iter().position(|b| *b == b'\n') {
            let line: Vec<u8> = self.buffer.drain(..=pos).collect();
            self.accept_line(&line[..line.len() - 1]);
        }
    }

    fn accept_line(&mut self, line: &[u8]) {
        if let Some(text) = parse_data_line(line) {
            self.ready.push_back(text);
        }
    }
}

/// Text carried by a single SSE line, if it is a well-formed data line.
fn parse_data_line(line: &[u8]) -> Option<String> {
    let line = line.strip_suffix(b"\r").unwrap_or(line);
    let payload = line.strip_prefix(b"data:")?;
    let payload = String::from_utf8_lossy(payload);
    let payload = payload.trim();
    if payload.is_empty() || payload == "[DONE]" {
        return None;
    }
    match serde_json::from_str::<GeminiResponse>(payload) {
        Ok(doc) => doc.first_text().map(str::to_string),
        Err(err) => {
            tracing::debug!(error = %err, "Skipping malformed upstream SSE line");
            None
        }
    }
}

impl<S, E> Stream for GeminiSseDecoder<S>
where
    S: Stream<Item = std::result::Result<Bytes, E>> + Unpin,
    E: Into<ProxyError>,
{
    type Item = Result<String>;

    fn poll_next(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        let this = self.get_mut();

        loop {
            if let Some(text) = this.ready.pop_front() {
                return Poll::Ready(Some(Ok(text)));
            }

            if this.done {
                if this.buffer.is_empty() {
                    return Poll::Ready(None);
                }
                // Final line without a terminator.
                let rest = std::mem::take(&mut this.buffer);
                this.accept_line(&rest);
                continue;
            }

            match Pin::new(&mut this.inner).poll_next(cx) {
                Poll::Ready(Some(Ok(chunk))) => {
                    this.buffer.extend_from_slice(&chunk);
                    this.drain_lines();
                }
                Poll::Ready(Some(Err(err))) => {
                    this.done = true;
                    this.buffer.clear();
                    return Poll::Ready(Some(Err(err.into())));
                }
                Poll::Ready(None) => this.done = true,
                Poll::Pending => return Poll::Pending,
            }
        }
    }
}

/// Turns cumulative snapshots into increments.
#[derive(Debug, Default)]
pub struct SnapshotDiffer {
    accumulated: String,
}

impl SnapshotDiffer {
    pub fn new() -> Self {
        Self::default()
    }

    /// New text since the last snapshot.
    ///
    /// A snapshot that does not extend the accumulated text is taken as a
    /// fresh increment and appended whole.
    pub fn delta(&mut self, snapshot: &str) -> String {
        if let Some(suffix) = snapshot.strip_prefix(self.accumulated.as_str()) {
            let suffix = suffix.to_string();
            self.accumulated.clear();
            self.accumulated.push_str(snapshot);
            suffix
        } else {
            self.accumulated.push_str(snapshot);
            snapshot.to_string()
        }
    }

    pub fn accumulated(&self) -> &str {
        &self.accumulated
    }
}

pub fn snapshots_to_increments(snapshots: TextStream) -> TextStream {
    let mut differ = SnapshotDiffer::new();
    snapshots
        .map(move |item| item.map(|snapshot| differ.delta(&snapshot)))
        .boxed()
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures_util::stream;

    fn frame(text: &str) -> String {
        format!(
            "data: {}\n\n",
            serde_json::json!({"candidates": [{"content": {"parts": [{"text": text}]}}]})
        )
    }

    fn chunks(parts: Vec<String>) -> impl Stream<Item = std::result::Result<Bytes, ProxyError>> + Unpin {
        stream::iter(parts.into_iter().map(|p| Ok(Bytes::from(p))))
    }

    async fn collect(decoder: GeminiSseDecoder<impl Stream<Item = std::result::Result<Bytes, ProxyError>> + Unpin>) -> Vec<String> {
        decoder
            .map(|r| r.unwrap())
            .collect::<Vec<_>>()
            .await
    }

    #[test]
    fn cumulative_snapshots_yield_suffixes() {
        let mut d = SnapshotDiffer::new();
        assert_eq!(d.delta("Hi"), "Hi");
        assert_eq!(d.delta("Hi there"), " there");
        assert_eq!(d.delta("Hi there!"), "!");
        assert_eq!(d.delta("Hi there!"), "");
        assert_eq!(d.accumulated(), "Hi there!");
    }

    #[test]
    fn non_extending_snapshot_is_a_fresh_increment() {
        let mut d = SnapshotDiffer::new();
        assert_eq!(d.delta("héllo"), "héllo");
        assert_eq!(d.delta("wörld"), "wörld");
        assert_eq!(d.accumulated(), "héllowörld");
        assert_eq!(d.delta("héllowörld!"), "!");
    }

    #[tokio::test]
    async fn decodes_lines_split_across_chunks() {
        let whole = format!("{}{}", frame("Hi"), frame("Hi there"));
        let (a, b) = whole.split_at(17);
        let out = collect(GeminiSseDecoder::new(chunks(vec![a.to_string(), b.to_string()]))).await;
        assert_eq!(out, vec!["Hi", "Hi there"]);
    }

    #[tokio::test]
    async fn skips_malformed_lines_and_accepts_crlf() {
        let body = format!(
            "data: {{\"candidates\": [\r\n\r\n{}data: [DONE]\r\n",
            frame("ok").replace('\n', "\r\n")
        );
        let out = collect(GeminiSseDecoder::new(chunks(vec![body]))).await;
        assert_eq!(out, vec!["ok"]);
    }

    #[tokio::test]
    async fn unterminated_final_line_is_decoded() {
        let body = frame("tail").trim_end().to_string();
        let out = collect(GeminiSseDecoder::new(chunks(vec![body]))).await;
        assert_eq!(out, vec!["tail"]);
    }

    #[tokio::test]
    async fn transport_error_is_surfaced() {
        let items = vec![
            Ok(Bytes::from(frame("a"))),
            Err(ProxyError::Upstream("reset".into())),
        ];
        let mut decoder = GeminiSseDecoder::new(stream::iter(items));
        assert_eq!(decoder.next().await.unwrap().unwrap(), "a");
        assert!(matches!(decoder.next().await, Some(Err(ProxyError::Upstream(_)))));
        assert!(decoder.next().await.is_none());
    }

    #[tokio::test]
    async fn snapshot_stream_becomes_increments() {
        let snaps: TextStream = stream::iter(vec![
            Ok("Hi".to_string()),
            Ok("Hi there".to_string()),
            Ok("Hi there!".to_string()),
        ])
        .boxed();
        let out: Vec<String> = snapshots_to_increments(snaps)
            .map(|r| r.unwrap())
            .collect()
            .await;
        assert_eq!(out, vec!["Hi", " there", "!"]);
    }
}
