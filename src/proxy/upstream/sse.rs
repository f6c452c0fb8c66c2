use std::collections::VecDeque;

use bytes::Bytes;
use futures::{Stream, StreamExt};
use serde_json::Value;

use crate::error::{AppError, AppResult};

// One decoded server-sent event. `event_type` is the discriminator the
// executor keys on; the payload itself is opaque to the core.
#[derive(Debug, Clone, PartialEq, serde::Serialize)]
pub struct StreamEvent {
    #[serde(rename = "type")]
    pub event_type: String,
    pub data: Value,
}

impl StreamEvent {
    pub fn new(event_type: impl Into<String>, data: Value) -> Self {
        Self {
            event_type: event_type.into(),
            data,
        }
    }

    // Whether this event carries generated content. Covers both the
    // Anthropic-shaped events produced by the translation layer and raw
    // Cloud Code chunks with candidate parts.
    pub fn is_content(&self) -> bool {
        matches!(
            self.event_type.as_str(),
            "content_block_start" | "content_block_delta"
        ) || self
            .data
            .pointer("/candidates/0/content/parts/0")
            .is_some()
    }
}

struct SseDecoder<S> {
    upstream: std::pin::Pin<Box<S>>,
    buffer: String,
    pending: VecDeque<StreamEvent>,
    done: bool,
}

impl<S> SseDecoder<S> {
    // Split complete frames off the front of the buffer, keeping any partial
    // tail for the next chunk.
    fn drain_frames(&mut self) {
        while let Some(pos) = self.buffer.find("\n\n") {
            let frame: String = self.buffer.drain(..pos + 2).collect();
            if let Some(event) = parse_frame(&frame) {
                self.pending.push_back(event);
            }
        }
    }

    fn flush_tail(&mut self) {
        let tail = std::mem::take(&mut self.buffer);
        if let Some(event) = parse_frame(&tail) {
            self.pending.push_back(event);
        }
    }
}

fn parse_frame(frame: &str) -> Option<StreamEvent> {
    let mut event_name: Option<String> = None;
    let mut data_lines: Vec<&str> = Vec::new();

    for line in frame.lines() {
        let line = line.trim_end_matches('\r');
        if line.starts_with(':') {
            // heartbeat comment
            continue;
        }
        if let Some(rest) = line.strip_prefix("event:") {
            event_name = Some(rest.trim().to_string());
        } else if let Some(rest) = line.strip_prefix("data:") {
            data_lines.push(rest.trim_start());
        }
    }

    if data_lines.is_empty() {
        return None;
    }
    let data_str = data_lines.join("\n");
    if data_str == "[DONE]" {
        return None;
    }

    let data: Value = serde_json::from_str(&data_str)
        .unwrap_or_else(|_| Value::String(data_str.clone()));
    let event_type = event_name
        .or_else(|| {
            data.get("type")
                .and_then(|t| t.as_str())
                .map(|t| t.to_string())
        })
        .unwrap_or_else(|| "message".to_string());

    Some(StreamEvent::new(event_type, data))
}

// Decode an upstream SSE byte stream into events, lazily. Transport errors
// surface once and terminate the stream.
pub fn decode_sse_stream<S>(upstream: S) -> impl Stream<Item = AppResult<StreamEvent>> + Send + 'static
where
    S: Stream<Item = Result<Bytes, reqwest::Error>> + Send + 'static,
{
    let decoder = SseDecoder {
        upstream: Box::pin(upstream),
        buffer: String::new(),
        pending: VecDeque::new(),
        done: false,
    };

    futures::stream::unfold(decoder, |mut decoder| async move {
        loop {
            if let Some(event) = decoder.pending.pop_front() {
                return Some((Ok(event), decoder));
            }
            if decoder.done {
                return None;
            }
            match decoder.upstream.next().await {
                Some(Ok(bytes)) => {
                    decoder.buffer.push_str(&String::from_utf8_lossy(&bytes));
                    decoder.drain_frames();
                }
                Some(Err(e)) => {
                    decoder.done = true;
                    return Some((Err(AppError::Network(e)), decoder));
                }
                None => {
                    decoder.done = true;
                    decoder.flush_tail();
                }
            }
        }
    })
}
