use std::pin::Pin;

use futures::{Stream, StreamExt};
use serde_json::json;
use tokio_util::sync::CancellationToken;

use crate::error::{AppError, AppResult};
use crate::proxy::upstream::StreamEvent;

pub type EventStream = Pin<Box<dyn Stream<Item = AppResult<StreamEvent>> + Send>>;

// Result of reading one streaming body up to its first content event.
pub enum StreamProbe {
    // Content arrived: `buffered` holds the preamble events in order, `rest`
    // is the live remainder.
    Content {
        buffered: Vec<StreamEvent>,
        rest: EventStream,
    },
    // The body completed without a single content event.
    Empty,
    // Transport died before any content was seen.
    Failed(AppError),
}

// Consume a decoded event stream until the first content event. Preamble
// events (message_start and friends) are buffered so nothing is lost or
// reordered; an empty body is detected without ever leaking a half
// response to the client.
pub async fn probe_stream<S>(events: S) -> StreamProbe
where
    S: Stream<Item = AppResult<StreamEvent>> + Send + 'static,
{
    let mut events = Box::pin(events);
    let mut buffered: Vec<StreamEvent> = Vec::new();

    loop {
        match events.next().await {
            Some(Ok(event)) => {
                if event.is_content() {
                    buffered.push(event);
                    return StreamProbe::Content {
                        buffered,
                        rest: events,
                    };
                }
                buffered.push(event);
            }
            Some(Err(e)) => return StreamProbe::Failed(e),
            None => return StreamProbe::Empty,
        }
    }
}

// Synthetic Anthropic-shaped message sequence emitted when every
// empty-response refetch came back hollow. Exactly one such sequence per
// call, and the call still counts as a success.
pub fn empty_response_fallback_sequence(model: &str) -> Vec<StreamEvent> {
    let message_id = format!(
        "msg_fallback_{}",
        chrono::Utc::now().timestamp_millis()
    );
    let notice = "The upstream model returned an empty response repeatedly. \
                  Please retry, rephrase the request, or switch models.";

    vec![
        StreamEvent::new(
            "message_start",
            json!({
                "type": "message_start",
                "message": {
                    "id": message_id,
                    "type": "message",
                    "role": "assistant",
                    "content": [],
                    "model": model,
                    "stop_reason": null,
                    "stop_sequence": null,
                    "usage": {"input_tokens": 0, "output_tokens": 0}
                }
            }),
        ),
        StreamEvent::new(
            "content_block_start",
            json!({
                "type": "content_block_start",
                "index": 0,
                "content_block": {"type": "text", "text": ""}
            }),
        ),
        StreamEvent::new(
            "content_block_delta",
            json!({
                "type": "content_block_delta",
                "index": 0,
                "delta": {"type": "text_delta", "text": notice}
            }),
        ),
        StreamEvent::new(
            "content_block_stop",
            json!({"type": "content_block_stop", "index": 0}),
        ),
        StreamEvent::new(
            "message_delta",
            json!({
                "type": "message_delta",
                "delta": {"stop_reason": "end_turn", "stop_sequence": null},
                "usage": {"output_tokens": 0}
            }),
        ),
        StreamEvent::new("message_stop", json!({"type": "message_stop"})),
    ]
}

// Buffered preamble + live remainder as one stream, terminated early when
// the caller cancels. Dropping the stream aborts the upstream transfer.
pub fn assemble_stream(
    buffered: Vec<StreamEvent>,
    rest: EventStream,
    cancel: CancellationToken,
) -> EventStream {
    let combined = futures::stream::iter(buffered.into_iter().map(Ok)).chain(rest);
    Box::pin(combined.take_until(Box::pin(cancel.cancelled_owned())))
}

pub fn stream_from_events(events: Vec<StreamEvent>) -> EventStream {
    Box::pin(futures::stream::iter(events.into_iter().map(Ok)))
}

// Collapse a finished event stream into one message object, for clients that
// asked for a plain JSON reply while the upstream was driven in streaming
// mode (thinking-class models).
pub async fn collect_stream_to_json(mut stream: EventStream, model: &str) -> AppResult<serde_json::Value> {
    let mut text = String::new();
    let mut message_id: Option<String> = None;
    let mut stop_reason = json!(null);
    let mut usage = json!({"input_tokens": 0, "output_tokens": 0});

    while let Some(event) = stream.next().await {
        let event = event?;
        match event.event_type.as_str() {
            "message_start" => {
                if let Some(id) = event.data.pointer("/message/id").and_then(|v| v.as_str()) {
                    message_id = Some(id.to_string());
                }
                if let Some(u) = event.data.pointer("/message/usage") {
                    usage = u.clone();
                }
            }
            "content_block_delta" => {
                if let Some(delta) = event.data.pointer("/delta/text").and_then(|v| v.as_str()) {
                    text.push_str(delta);
                }
            }
            "message_delta" => {
                if let Some(reason) = event.data.pointer("/delta/stop_reason") {
                    stop_reason = reason.clone();
                }
                if let Some(out) = event.data.pointer("/usage/output_tokens") {
                    usage["output_tokens"] = out.clone();
                }
            }
            _ => {
                // Raw Cloud Code chunks carry their text under candidates.
                if let Some(part) = event
                    .data
                    .pointer("/candidates/0/content/parts/0/text")
                    .and_then(|v| v.as_str())
                {
                    text.push_str(part);
                }
            }
        }
    }

    Ok(json!({
        "id": message_id.unwrap_or_else(|| format!(
            "msg_{}",
            chrono::Utc::now().timestamp_millis()
        )),
        "type": "message",
        "role": "assistant",
        "content": [{"type": "text", "text": text}],
        "model": model,
        "stop_reason": stop_reason,
        "stop_sequence": null,
        "usage": usage,
    }))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn event(event_type: &str) -> StreamEvent {
        StreamEvent::new(event_type, json!({"type": event_type}))
    }

    #[tokio::test]
    async fn probe_buffers_preamble_until_first_content() {
        let events = vec![
            Ok(event("message_start")),
            Ok(event("content_block_start")),
            Ok(event("content_block_delta")),
            Ok(event("message_stop")),
        ];
        match probe_stream(futures::stream::iter(events)).await {
            StreamProbe::Content { buffered, rest } => {
                // content_block_start is itself a content event, so the probe
                // stops right there.
                assert_eq!(buffered.len(), 2);
                assert_eq!(buffered[1].event_type, "content_block_start");
                let remaining: Vec<_> = rest.map(|r| r.expect("event")).collect().await;
                assert_eq!(remaining.len(), 2);
            }
            _ => panic!("expected content probe"),
        }
    }

    #[tokio::test]
    async fn probe_reports_empty_for_content_free_bodies() {
        let events = vec![Ok(event("message_start")), Ok(event("message_stop"))];
        assert!(matches!(
            probe_stream(futures::stream::iter(events)).await,
            StreamProbe::Empty
        ));

        let no_events: Vec<AppResult<StreamEvent>> = vec![];
        assert!(matches!(
            probe_stream(futures::stream::iter(no_events)).await,
            StreamProbe::Empty
        ));
    }

    #[tokio::test]
    async fn probe_surfaces_transport_errors() {
        let events: Vec<AppResult<StreamEvent>> = vec![
            Ok(event("message_start")),
            Err(AppError::Unknown("boom".to_string())),
        ];
        assert!(matches!(
            probe_stream(futures::stream::iter(events)).await,
            StreamProbe::Failed(_)
        ));
    }

    #[test]
    fn fallback_sequence_is_a_complete_message() {
        let events = empty_response_fallback_sequence("gemini-2.5-pro");
        let types: Vec<&str> = events.iter().map(|e| e.event_type.as_str()).collect();
        assert_eq!(
            types,
            vec![
                "message_start",
                "content_block_start",
                "content_block_delta",
                "content_block_stop",
                "message_delta",
                "message_stop"
            ]
        );
        assert_eq!(
            events[0].data["message"]["model"],
            json!("gemini-2.5-pro")
        );
        assert_eq!(
            events[4].data["delta"]["stop_reason"],
            json!("end_turn")
        );
    }

    #[tokio::test]
    async fn collected_stream_concatenates_text_deltas() {
        let events = vec![
            StreamEvent::new(
                "message_start",
                json!({"type":"message_start","message":{"id":"msg_1","usage":{"input_tokens":7,"output_tokens":0}}}),
            ),
            StreamEvent::new(
                "content_block_delta",
                json!({"type":"content_block_delta","delta":{"type":"text_delta","text":"Hello, "}}),
            ),
            StreamEvent::new(
                "content_block_delta",
                json!({"type":"content_block_delta","delta":{"type":"text_delta","text":"world"}}),
            ),
            StreamEvent::new(
                "message_delta",
                json!({"type":"message_delta","delta":{"stop_reason":"end_turn"},"usage":{"output_tokens":2}}),
            ),
        ];
        let value = collect_stream_to_json(stream_from_events(events), "gemini-2.5-pro")
            .await
            .expect("collect");
        assert_eq!(value["id"], "msg_1");
        assert_eq!(value["content"][0]["text"], "Hello, world");
        assert_eq!(value["stop_reason"], "end_turn");
        assert_eq!(value["usage"]["output_tokens"], 2);
        assert_eq!(value["usage"]["input_tokens"], 7);
    }

    #[tokio::test]
    async fn cancellation_cuts_the_assembled_stream_short() {
        let cancel = CancellationToken::new();
        let rest: EventStream = Box::pin(futures::stream::pending());
        let mut stream = assemble_stream(vec![event("message_start")], rest, cancel.clone());

        let first = stream.next().await.expect("buffered event").expect("ok");
        assert_eq!(first.event_type, "message_start");

        cancel.cancel();
        assert!(stream.next().await.is_none());
    }
}
