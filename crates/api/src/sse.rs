//! Server-sent events.
//!
//! [`Context::sse`](crate::Context::sse) commits an event-stream response and hands back an
//! [`SseWriter`]. Every event sent through the writer becomes one body frame; dropping or closing
//! the writer ends the stream.
//!
//! The queue between the writer and the connection is bounded, so `send` waits while the client
//! is behind. Long-lived streams should move the writer into a spawned task and return from the
//! handler, as the response is only handed to the connection once the handler finishes.

use crate::body::ResponseBody;
use bytes::Bytes;
use futures::channel::mpsc::{Sender, channel as bounded};
use futures::{SinkExt, StreamExt};
use http_body::Frame;
use http_body_util::StreamBody;
use std::convert::Infallible;
use std::fmt::Write;
use std::time::Duration;
use thiserror::Error;

/// Frames queued ahead of a slow client before `send` starts waiting.
pub(crate) const SSE_BUFFER: usize = 32;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Event {
    Retry(Duration),
    Message(Message),
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Message {
    // https://html.spec.whatwg.org/multipage/server-sent-events.html#concept-event-stream-last-event-id
    pub id: Option<String>,
    pub name: Option<String>,
    pub retry: Option<Duration>,
    // the message data
    pub data: String,
}

impl Event {
    pub fn message(data: impl Into<String>, id: Option<String>, name: Option<String>) -> Event {
        Event::Message(Message { id, name, retry: None, data: data.into() })
    }

    pub fn from_data(data: impl Into<String>) -> Event {
        Event::Message(Message { data: data.into(), ..Message::default() })
    }

    pub fn named(name: impl Into<String>, data: impl Into<String>) -> Event {
        Event::Message(Message { name: Some(name.into()), data: data.into(), ..Message::default() })
    }

    pub fn retry(duration: impl Into<Duration>) -> Event {
        Event::Retry(duration.into())
    }

    /// Encodes the event in the `text/event-stream` line format.
    ///
    /// Messages without an id get a fresh UUID.
    pub fn encode(&self) -> Bytes {
        let mut frame = String::new();
        match self {
            Event::Retry(duration) => {
                let _ = write!(frame, "retry: {}\n\n", duration.as_millis());
            }
            Event::Message(Message { id, name, retry, data }) => {
                frame.reserve(data.len() + 64);
                match id {
                    Some(id) => {
                        let _ = writeln!(frame, "id: {id}");
                    }
                    None => {
                        let _ = writeln!(frame, "id: {}", uuid::Uuid::new_v4());
                    }
                }
                if let Some(name) = name {
                    let _ = writeln!(frame, "event: {name}");
                }
                if let Some(retry) = retry {
                    let _ = writeln!(frame, "retry: {}", retry.as_millis());
                }
                for line in data.split('\n') {
                    let _ = writeln!(frame, "data: {}", line.strip_suffix('\r').unwrap_or(line));
                }
                frame.push('\n');
            }
        }
        Bytes::from(frame)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
#[error("event stream closed")]
pub struct SseClosed;

/// Sending half of an event stream.
#[derive(Debug, Clone)]
pub struct SseWriter {
    sender: Sender<Bytes>,
}

impl SseWriter {
    /// Sends one event as one frame, waiting while the queue is full. Fails once the client went
    /// away or the writer was closed.
    pub async fn send(&mut self, event: Event) -> Result<(), SseClosed> {
        self.sender.send(event.encode()).await.map_err(|_| SseClosed)
    }

    /// Sends a named event with a generated id.
    pub async fn event(&mut self, name: impl Into<String>, data: impl Into<String>) -> Result<(), SseClosed> {
        self.send(Event::named(name, data)).await
    }

    pub async fn data(&mut self, data: impl Into<String>) -> Result<(), SseClosed> {
        self.send(Event::from_data(data)).await
    }

    pub fn is_closed(&self) -> bool {
        self.sender.is_closed()
    }

    /// Ends the stream for every clone of this writer.
    pub fn close(mut self) {
        self.sender.close_channel();
    }
}

/// A writer and the response body it feeds, with room for `buffer` queued frames.
pub(crate) fn channel(buffer: usize) -> (SseWriter, ResponseBody) {
    let (sender, receiver) = bounded::<Bytes>(buffer);
    let frames = receiver.map(|bytes| Ok::<_, Infallible>(Frame::data(bytes)));
    (SseWriter { sender }, ResponseBody::stream(StreamBody::new(frames)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use http_body_util::BodyExt;

    #[test]
    fn test_line_order() {
        let event = Event::Message(Message {
            id: Some("7".into()),
            name: Some("tick".into()),
            retry: Some(Duration::from_millis(1500)),
            data: "a\r\nb\nc".into(),
        });
        assert_eq!(event.encode(), "id: 7\nevent: tick\nretry: 1500\ndata: a\ndata: b\ndata: c\n\n");
    }

    #[test]
    fn test_generated_id() {
        let frame = Event::from_data("x").encode();
        let text = std::str::from_utf8(&frame).unwrap();
        let id = text.lines().next().unwrap().strip_prefix("id: ").unwrap();
        assert!(uuid::Uuid::parse_str(id).is_ok());
        assert!(text.ends_with("data: x\n\n"));
    }

    #[test]
    fn test_retry_event() {
        assert_eq!(Event::retry(Duration::from_secs(3)).encode(), "retry: 3000\n\n");
    }

    #[tokio::test]
    async fn test_each_event_is_one_frame() {
        let (mut writer, mut body) = channel(SSE_BUFFER);
        writer.send(Event::message("1", Some("a".into()), None)).await.unwrap();
        writer.send(Event::message("2", Some("b".into()), None)).await.unwrap();
        drop(writer);

        let first = body.frame().await.unwrap().unwrap().into_data().unwrap();
        assert_eq!(first, "id: a\ndata: 1\n\n");
        let second = body.frame().await.unwrap().unwrap().into_data().unwrap();
        assert_eq!(second, "id: b\ndata: 2\n\n");
        assert!(body.frame().await.is_none());
    }

    #[tokio::test]
    async fn test_send_after_close_fails() {
        let (writer, _body) = channel(SSE_BUFFER);
        let mut clone = writer.clone();
        writer.close();
        assert_eq!(clone.data("late").await, Err(SseClosed));
    }

    #[tokio::test]
    async fn test_send_waits_for_slow_reader() {
        let (mut writer, mut body) = channel(0);
        writer.data("1").await.unwrap();

        let blocked = tokio::time::timeout(Duration::from_millis(50), writer.data("2")).await;
        assert!(blocked.is_err());

        let first = body.frame().await.unwrap().unwrap().into_data().unwrap();
        assert!(first.ends_with(b"data: 1\n\n"));

        tokio::time::timeout(Duration::from_secs(1), writer.data("3")).await.unwrap().unwrap();
        let next = body.frame().await.unwrap().unwrap().into_data().unwrap();
        assert!(next.ends_with(b"data: 3\n\n"));
    }

    #[tokio::test]
    async fn test_send_fails_when_reader_is_gone() {
        let (mut writer, body) = channel(SSE_BUFFER);
        drop(body);
        assert!(writer.is_closed());
        assert_eq!(writer.data("x").await, Err(SseClosed));
    }
}
