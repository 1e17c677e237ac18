//! WebSocket adapter for tunnel connections
//!
//! Wraps the two halves of an upgraded axum [`WebSocket`] so the control
//! plane sees them as a [`FrameSink`] and a [`FrameSource`].

use async_trait::async_trait;
use axum::extract::ws::{CloseFrame, Message, WebSocket};
use burrow_transport::{Frame, FrameSink, FrameSource, TransportError, TransportResult};
use futures_util::stream::{SplitSink, SplitStream};
use futures_util::{SinkExt, StreamExt};

/// Close code sent when the relay tears a tunnel down
const CLOSE_NORMAL: u16 = 1000;

pub struct WsSink(SplitSink<WebSocket, Message>);

pub struct WsSource(SplitStream<WebSocket>);

/// Split an upgraded socket into its relay-side halves
pub fn split(socket: WebSocket) -> (WsSink, WsSource) {
    let (sink, stream) = socket.split();
    (WsSink(sink), WsSource(stream))
}

fn to_message(frame: Frame) -> Message {
    match frame {
        Frame::Text(text) => Message::Text(text.into()),
        Frame::Binary(data) => Message::Binary(data),
        Frame::Ping(data) => Message::Ping(data),
        Frame::Pong(data) => Message::Pong(data),
        Frame::Close(reason) => Message::Close(Some(CloseFrame {
            code: CLOSE_NORMAL,
            reason: reason.unwrap_or_default().into(),
        })),
    }
}

fn from_message(message: Message) -> Frame {
    match message {
        Message::Text(text) => Frame::Text(text.as_str().to_owned()),
        Message::Binary(data) => Frame::Binary(data),
        Message::Ping(data) => Frame::Ping(data),
        Message::Pong(data) => Frame::Pong(data),
        Message::Close(close) => Frame::Close(close.map(|c| c.reason.as_str().to_owned())),
    }
}

#[async_trait]
impl FrameSink for WsSink {
    async fn send(&mut self, frame: Frame) -> TransportResult<()> {
        self.0
            .send(to_message(frame))
            .await
            .map_err(|e| TransportError::ConnectionError(e.to_string()))
    }

    async fn close(&mut self) -> TransportResult<()> {
        let _ = self.0.send(to_message(Frame::Close(None))).await;
        self.0
            .close()
            .await
            .map_err(|e| TransportError::ConnectionError(e.to_string()))
    }
}

#[async_trait]
impl FrameSource for WsSource {
    async fn recv(&mut self) -> TransportResult<Option<Frame>> {
        match self.0.next().await {
            Some(Ok(message)) => Ok(Some(from_message(message))),
            Some(Err(e)) => Err(TransportError::ConnectionError(e.to_string())),
            None => Ok(None),
        }
    }
}

/// Whether a browser `Origin` may open a tunnel
///
/// No origin at all is accepted: tunnel clients are not browsers. Otherwise
/// the origin's host must be `domain` or a subdomain of it.
pub fn origin_allowed(origin: Option<&str>, domain: &str) -> bool {
    let Some(origin) = origin else {
        return true;
    };

    let host = origin
        .split_once("://")
        .map(|(_, rest)| rest)
        .unwrap_or(origin);
    let host = host.split(['/', ':']).next().unwrap_or_default();
    let host = host.to_ascii_lowercase();
    let domain = domain.to_ascii_lowercase();

    host == domain
        || host
            .strip_suffix(domain.as_str())
            .is_some_and(|prefix| prefix.ends_with('.') && prefix.len() > 1)
}

#[cfg(test)]
mod tests {
    use super::*;
    use bytes::Bytes;

    #[test]
    fn test_origin_allowed() {
        assert!(origin_allowed(None, "servit.app"));
        assert!(origin_allowed(Some("https://servit.app"), "servit.app"));
        assert!(origin_allowed(Some("https://abc.servit.app"), "servit.app"));
        assert!(origin_allowed(Some("http://abc.servit.app:8080"), "servit.app"));
        assert!(origin_allowed(Some("https://A.Servit.App"), "servit.app"));

        assert!(!origin_allowed(Some("https://evil.com"), "servit.app"));
        assert!(!origin_allowed(Some("https://notservit.app"), "servit.app"));
        assert!(!origin_allowed(Some("https://servit.app.evil.com"), "servit.app"));
        assert!(!origin_allowed(Some("null"), "servit.app"));
    }

    #[test]
    fn test_frame_message_mapping() {
        assert_eq!(
            from_message(to_message(Frame::text("hello"))),
            Frame::text("hello")
        );
        assert_eq!(
            from_message(to_message(Frame::Ping(Bytes::from_static(b"p")))),
            Frame::Ping(Bytes::from_static(b"p"))
        );
        assert_eq!(
            from_message(to_message(Frame::Close(Some("bye".to_string())))),
            Frame::Close(Some("bye".to_string()))
        );
        assert!(matches!(
            to_message(Frame::Close(None)),
            Message::Close(Some(CloseFrame { code: CLOSE_NORMAL, .. }))
        ));
    }
}
