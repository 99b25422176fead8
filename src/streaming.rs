//! Server-sent event stream of denoising frames.
//!
//! Each manager [`GenerationEvent`] becomes one SSE message whose `event:`
//! name matches the JSON `type` tag:
//!
//! ```text
//! event: step
//! data: {"type":"step","step":3,"total_steps":15,"image":"<b64 png>"}
//!
//! event: complete
//! data: {"type":"complete","image":"<b64 png>","image_url":"/images/<f>.png"}
//! ```
//!
//! A stream always ends with exactly one `complete` or `error`. Dropping the
//! stream drops the manager receiver, which stops the generation at its next
//! step.
//!
//! [`SseDecoder`] is the client side: it reassembles messages from arbitrary
//! byte chunks.

use std::time::Duration;

use axum::response::sse::{Event, KeepAlive, Sse};
use futures::{Stream, StreamExt};
use image::RgbImage;
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;

use crate::manager::GenerationEvent;
use crate::storage::ImageStore;
use crate::{Error, Result, vae};

/// JSON payload of one SSE message.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum StreamEvent {
    Step {
        step: usize,
        total_steps: usize,
        /// Base64 PNG, no data-URL prefix.
        image: String,
    },
    Complete {
        image: String,
        image_url: String,
    },
    Error {
        message: String,
    },
}

impl StreamEvent {
    /// SSE `event:` name, identical to the `type` tag.
    pub fn name(&self) -> &'static str {
        match self {
            Self::Step { .. } => "step",
            Self::Complete { .. } => "complete",
            Self::Error { .. } => "error",
        }
    }

    pub fn is_terminal(&self) -> bool {
        !matches!(self, Self::Step { .. })
    }

    pub fn to_sse(&self) -> std::result::Result<Event, axum::Error> {
        Event::default().event(self.name()).json_data(self)
    }

    /// Parse the `data:` payload of a received message.
    pub fn from_data(data: &str) -> Result<Self> {
        Ok(serde_json::from_str(data)?)
    }
}

/// Convert manager events into payloads, saving the final image on completion.
pub fn event_stream(
    rx: mpsc::Receiver<GenerationEvent>,
    store: ImageStore,
) -> impl Stream<Item = StreamEvent> + Send + 'static {
    futures::stream::unfold(Some((rx, store)), |state| async move {
        let (mut rx, store) = state?;
        let event = match rx.recv().await {
            Some(GenerationEvent::Step(frame)) => match encode_off_thread(frame.image).await {
                Ok(png) => {
                    tracing::debug!(step = frame.step, total_steps = frame.total_steps, "frame sent");
                    StreamEvent::Step {
                        step: frame.step,
                        total_steps: frame.total_steps,
                        image: vae::to_base64(&png),
                    }
                }
                Err(error) => StreamEvent::Error {
                    message: error.to_string(),
                },
            },
            Some(GenerationEvent::Complete(generated)) => {
                match finish(&store, generated.image).await {
                    Ok(event) => event,
                    Err(error) => StreamEvent::Error {
                        message: error.to_string(),
                    },
                }
            }
            Some(GenerationEvent::Failed(message)) => StreamEvent::Error { message },
            None => StreamEvent::Error {
                message: "generation ended without a result".to_string(),
            },
        };

        if let StreamEvent::Error { message } = &event {
            tracing::warn!(%message, "image stream failed");
        }
        let next = if event.is_terminal() {
            None
        } else {
            Some((rx, store))
        };
        Some((event, next))
    })
}

/// Wrap [`event_stream`] as an SSE response body with keep-alive comments.
pub fn sse_from_generation(
    rx: mpsc::Receiver<GenerationEvent>,
    store: ImageStore,
    keep_alive_ms: u64,
) -> Sse<impl Stream<Item = std::result::Result<Event, axum::Error>>> {
    let stream = event_stream(rx, store).map(|event| event.to_sse());
    Sse::new(stream).keep_alive(KeepAlive::new().interval(Duration::from_millis(keep_alive_ms)))
}

async fn finish(store: &ImageStore, image: RgbImage) -> Result<StreamEvent> {
    let png = encode_off_thread(image).await?;
    let saved = store.save_png(&png).await?;
    Ok(StreamEvent::Complete {
        image: vae::to_base64(&png),
        image_url: saved.url,
    })
}

/// PNG encoding is CPU-bound; keep it off the async workers.
pub async fn encode_off_thread(image: RgbImage) -> Result<Vec<u8>> {
    tokio::task::spawn_blocking(move || vae::encode_png(&image))
        .await
        .map_err(|join_error| Error::Image(format!("encoder task panicked: {join_error}")))?
}

/// One dispatched SSE message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SseMessage {
    pub event: Option<String>,
    pub data: String,
}

/// Incremental `text/event-stream` parser.
#[derive(Debug, Default)]
pub struct SseDecoder {
    buffer: Vec<u8>,
    event: Option<String>,
    data: Vec<String>,
}

impl SseDecoder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Feed raw bytes, returning every message completed by them.
    pub fn push(&mut self, chunk: &[u8]) -> Vec<SseMessage> {
        self.buffer.extend_from_slice(chunk);
        let mut messages = Vec::new();
        while let Some(newline_idx) = self.buffer.iter().position(|&b| b == b'\n') {
            let raw: Vec<u8> = self.buffer.drain(..=newline_idx).collect();
            let line = String::from_utf8_lossy(&raw[..newline_idx]);
            let line = line.trim_end_matches('\r');
            if let Some(message) = self.feed_line(line) {
                messages.push(message);
            }
        }
        messages
    }

    fn feed_line(&mut self, line: &str) -> Option<SseMessage> {
        if line.is_empty() {
            if self.data.is_empty() {
                self.event = None;
                return None;
            }
            return Some(SseMessage {
                event: self.event.take(),
                data: std::mem::take(&mut self.data).join("\n"),
            });
        }
        // Comment, used for keep-alives.
        if line.starts_with(':') {
            return None;
        }

        let (field, value) = line.split_once(':').unwrap_or((line, ""));
        let value = value.strip_prefix(' ').unwrap_or(value);
        match field {
            "event" => self.event = Some(value.to_string()),
            "data" => self.data.push(value.to_string()),
            _ => {}
        }
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pipeline::{GeneratedImage, StepFrame};
    use image::Rgb;

    fn frame(step: usize, total_steps: usize) -> StepFrame {
        StepFrame {
            step,
            total_steps,
            image: RgbImage::from_pixel(4, 4, Rgb([step as u8, 0, 0])),
        }
    }

    fn generated() -> GeneratedImage {
        GeneratedImage {
            image: RgbImage::from_pixel(4, 4, Rgb([255, 255, 255])),
            steps: 2,
            seed: 42,
        }
    }

    async fn collect(events: Vec<GenerationEvent>, close: bool) -> (Vec<StreamEvent>, tempfile::TempDir) {
        let dir = tempfile::tempdir().unwrap();
        let store = ImageStore::create(dir.path()).unwrap();
        let (tx, rx) = mpsc::channel(events.len().max(1));
        for event in events {
            tx.send(event).await.unwrap();
        }
        // Dropping the sender closes the channel after the queued events.
        let _sender = (!close).then_some(tx);
        let out = event_stream(rx, store).collect::<Vec<_>>().await;
        (out, dir)
    }

    #[test]
    fn test_step_payload_shape() {
        let event = StreamEvent::Step {
            step: 3,
            total_steps: 15,
            image: "AAAA".to_string(),
        };
        let json: serde_json::Value = serde_json::to_value(&event).unwrap();
        assert_eq!(
            json,
            serde_json::json!({"type": "step", "step": 3, "total_steps": 15, "image": "AAAA"})
        );
        assert_eq!(event.name(), "step");
        assert!(!event.is_terminal());
    }

    #[test]
    fn test_terminal_payload_shapes() {
        let complete = StreamEvent::Complete {
            image: "AAAA".to_string(),
            image_url: "/images/x.png".to_string(),
        };
        let json = serde_json::to_value(&complete).unwrap();
        assert_eq!(json["type"], "complete");
        assert_eq!(json["image_url"], "/images/x.png");
        assert!(complete.is_terminal());

        let error = StreamEvent::Error {
            message: "boom".to_string(),
        };
        assert_eq!(
            serde_json::to_value(&error).unwrap(),
            serde_json::json!({"type": "error", "message": "boom"})
        );
        assert_eq!(StreamEvent::from_data(r#"{"type":"error","message":"boom"}"#).unwrap(), error);
    }

    #[tokio::test]
    async fn test_steps_then_complete_saves_image() {
        let (events, dir) = collect(
            vec![
                GenerationEvent::Step(frame(1, 2)),
                GenerationEvent::Step(frame(2, 2)),
                GenerationEvent::Complete(generated()),
            ],
            false,
        )
        .await;

        assert_eq!(events.len(), 3);
        assert!(matches!(&events[0], StreamEvent::Step { step: 1, total_steps: 2, .. }));
        assert!(matches!(&events[1], StreamEvent::Step { step: 2, total_steps: 2, .. }));
        let StreamEvent::Complete { image, image_url } = &events[2] else {
            panic!("expected complete, got {:?}", events[2]);
        };
        let filename = image_url.strip_prefix("/images/").unwrap();
        let saved = std::fs::read(dir.path().join(filename)).unwrap();
        assert_eq!(vae::from_base64(image).unwrap(), saved);
    }

    #[tokio::test]
    async fn test_step_image_is_png() {
        let (events, _dir) = collect(vec![GenerationEvent::Step(frame(1, 1))], true).await;
        let StreamEvent::Step { image, .. } = &events[0] else {
            panic!("expected step");
        };
        let bytes = vae::from_base64(image).unwrap();
        let decoded = image::load_from_memory(&bytes).unwrap().to_rgb8();
        assert_eq!(decoded.get_pixel(0, 0).0, [1, 0, 0]);
    }

    #[tokio::test]
    async fn test_failure_ends_stream() {
        let (events, _dir) = collect(
            vec![
                GenerationEvent::Step(frame(1, 3)),
                GenerationEvent::Failed("CUDA out of memory".to_string()),
                GenerationEvent::Step(frame(2, 3)),
            ],
            false,
        )
        .await;
        assert_eq!(events.len(), 2);
        assert_eq!(
            events[1],
            StreamEvent::Error {
                message: "CUDA out of memory".to_string()
            }
        );
    }

    #[tokio::test]
    async fn test_closed_channel_reports_error() {
        let (events, _dir) = collect(vec![GenerationEvent::Step(frame(1, 3))], true).await;
        assert_eq!(events.len(), 2);
        assert!(matches!(&events[1], StreamEvent::Error { message } if message.contains("without a result")));
    }

    #[test]
    fn test_decoder_handles_split_chunks() {
        let mut decoder = SseDecoder::new();
        let wire = "event: step\ndata: {\"type\":\"step\"}\n\n: keep-alive\n\nevent: complete\r\ndata: a\r\ndata: b\r\n\r\n";
        let (first, second) = wire.as_bytes().split_at(17);

        let mut messages = decoder.push(first);
        assert!(messages.is_empty());
        messages.extend(decoder.push(second));

        assert_eq!(
            messages,
            vec![
                SseMessage {
                    event: Some("step".to_string()),
                    data: "{\"type\":\"step\"}".to_string(),
                },
                SseMessage {
                    event: Some("complete".to_string()),
                    data: "a\nb".to_string(),
                },
            ]
        );
    }

    #[test]
    fn test_decoder_multibyte_split() {
        let mut decoder = SseDecoder::new();
        let wire = "data: café\n\n".as_bytes();
        // Split inside the two-byte 'é'.
        let split = wire.iter().position(|&b| b == 0xC3).unwrap() + 1;
        assert!(decoder.push(&wire[..split]).is_empty());
        let messages = decoder.push(&wire[split..]);
        assert_eq!(messages[0].data, "café");
        assert_eq!(messages[0].event, None);
    }
}
