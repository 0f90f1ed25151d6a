//! Upstream WebSocket connections from HQ to remotes.

use async_trait::async_trait;
use bytes::Bytes;
use futures::{SinkExt, StreamExt};
use termhub_core::SessionId;
use termhub_hq::RemoteServer;
use tokio::sync::mpsc;
use tokio_tungstenite::{
    connect_async,
    tungstenite::{
        Message,
        client::IntoClientRequest,
        http::{HeaderValue, header::AUTHORIZATION},
    },
};

use crate::{aggregator::AggregatorError, protocol::ServerMessage};

/// Something a remote sent back over an upstream connection.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum UpstreamEvent {
    /// A binary buffer frame.
    Frame(Bytes),
    /// The remote refused or lost one session.
    SessionError { session_id: SessionId, message: String },
}

impl UpstreamEvent {
    /// Interpret a JSON text message from a remote. Only per-session errors
    /// matter upstream; everything else yields `None`.
    #[must_use]
    pub fn from_text(text: &str) -> Option<Self> {
        match serde_json::from_str(text).ok()? {
            ServerMessage::Error {
                session_id: Some(session_id),
                message,
            } => Some(Self::SessionError {
                session_id,
                message,
            }),
            _ => None,
        }
    }
}

/// An open upstream connection.
///
/// Dropping `control` closes the connection. `events` ends when the remote
/// goes away.
#[derive(Debug)]
pub struct UpstreamLink {
    /// JSON control messages to send to the remote.
    pub control: mpsc::UnboundedSender<String>,
    /// Frames and session errors received from the remote.
    pub events: mpsc::UnboundedReceiver<UpstreamEvent>,
}

/// Opens upstream connections. Swappable so the aggregator can be tested
/// without sockets.
#[async_trait]
pub trait UpstreamConnector: Send + Sync {
    /// Connect to a remote's buffer endpoint.
    async fn connect(&self, remote: &RemoteServer) -> Result<UpstreamLink, AggregatorError>;
}

/// `ws://` (or `wss://`) URL of a remote's buffer endpoint.
#[must_use]
pub fn buffers_url(remote_url: &str) -> String {
    let base = remote_url.trim_end_matches('/');
    let ws = if let Some(rest) = base.strip_prefix("https://") {
        format!("wss://{rest}")
    } else if let Some(rest) = base.strip_prefix("http://") {
        format!("ws://{rest}")
    } else {
        base.to_string()
    };
    format!("{ws}/buffers")
}

/// Connector speaking real WebSockets, authenticated with the remote's
/// bearer token.
#[derive(Debug, Default, Clone, Copy)]
pub struct WsUpstreamConnector;

#[async_trait]
impl UpstreamConnector for WsUpstreamConnector {
    async fn connect(&self, remote: &RemoteServer) -> Result<UpstreamLink, AggregatorError> {
        let url = buffers_url(&remote.url);
        let unavailable = |reason: String| AggregatorError::UpstreamUnavailable {
            remote: remote.name.clone(),
            reason,
        };

        let mut request = url
            .as_str()
            .into_client_request()
            .map_err(|e| unavailable(e.to_string()))?;
        let bearer = HeaderValue::from_str(&format!("Bearer {}", remote.token))
            .map_err(|e| unavailable(e.to_string()))?;
        request.headers_mut().insert(AUTHORIZATION, bearer);

        let (stream, _) = connect_async(request)
            .await
            .map_err(|e| unavailable(e.to_string()))?;
        tracing::info!(remote_id = %remote.id, %url, "Connected upstream");

        let (mut sink, mut source) = stream.split();
        let (control_tx, mut control_rx) = mpsc::unbounded_channel::<String>();
        let (events_tx, events_rx) = mpsc::unbounded_channel::<UpstreamEvent>();
        let remote_id = remote.id.clone();

        tokio::spawn(async move {
            loop {
                tokio::select! {
                    outgoing = control_rx.recv() => {
                        let Some(text) = outgoing else {
                            let _ = sink.send(Message::Close(None)).await;
                            break;
                        };
                        if let Err(e) = sink.send(Message::Text(text.into())).await {
                            tracing::warn!(remote_id = %remote_id, "Upstream send failed: {e}");
                            break;
                        }
                    }
                    incoming = source.next() => match incoming {
                        Some(Ok(Message::Binary(data))) => {
                            if events_tx.send(UpstreamEvent::Frame(data)).is_err() {
                                break;
                            }
                        }
                        Some(Ok(Message::Text(text))) => {
                            let Some(event) = UpstreamEvent::from_text(text.as_str()) else {
                                tracing::trace!(remote_id = %remote_id, message = %text, "Upstream control message");
                                continue;
                            };
                            if events_tx.send(event).is_err() {
                                break;
                            }
                        }
                        Some(Ok(Message::Close(_))) | None => break,
                        Some(Ok(_)) => {}
                        Some(Err(e)) => {
                            tracing::warn!(remote_id = %remote_id, "Upstream connection error: {e}");
                            break;
                        }
                    }
                }
            }
            tracing::debug!(remote_id = %remote_id, "Upstream connection closed");
        });

        Ok(UpstreamLink {
            control: control_tx,
            events: events_rx,
        })
    }
}

#[cfg(test)]
mod tests {
    use std::{collections::BTreeSet, time::Duration};

    use chrono::Utc;
    use tokio_tungstenite::accept_async;

    use super::*;
    use crate::protocol::encode_frame;

    fn remote_at(url: String) -> RemoteServer {
        RemoteServer {
            id: "r1".to_string(),
            name: "one".to_string(),
            url,
            token: "t".to_string(),
            registered_at: Utc::now(),
            last_heartbeat: Utc::now(),
            session_ids: BTreeSet::new(),
        }
    }

    #[test]
    fn test_event_from_text() {
        assert_eq!(
            UpstreamEvent::from_text(r#"{"type":"error","sessionId":"ghost","message":"Session not found: ghost"}"#),
            Some(UpstreamEvent::SessionError {
                session_id: "ghost".to_string(),
                message: "Session not found: ghost".to_string(),
            })
        );
        assert_eq!(UpstreamEvent::from_text(r#"{"type":"error","message":"Invalid message"}"#), None);
        assert_eq!(UpstreamEvent::from_text(r#"{"type":"subscribed","sessionId":"s1"}"#), None);
        assert_eq!(UpstreamEvent::from_text("not json"), None);
    }

    #[tokio::test]
    async fn test_remote_errors_and_frames_arrive_as_events() {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let url = format!("http://{}", listener.local_addr().unwrap());
        let frame = encode_frame("s1", b"screen");
        let sent = frame.clone();

        let server = tokio::spawn(async move {
            let (stream, _) = listener.accept().await.unwrap();
            let mut ws = accept_async(stream).await.unwrap();
            let Some(Ok(Message::Text(request))) = ws.next().await else {
                panic!("expected a subscribe request");
            };
            assert_eq!(request.as_str(), r#"{"action":"subscribe","sessionId":"ghost"}"#);
            ws.send(Message::Text(
                r#"{"type":"error","sessionId":"ghost","message":"Session not found: ghost"}"#.into(),
            ))
            .await
            .unwrap();
            ws.send(Message::Binary(sent)).await.unwrap();
            let _ = ws.next().await;
        });

        let mut link = WsUpstreamConnector.connect(&remote_at(url)).await.unwrap();
        link.control
            .send(r#"{"action":"subscribe","sessionId":"ghost"}"#.to_string())
            .unwrap();

        let first = tokio::time::timeout(Duration::from_secs(2), link.events.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(
            first,
            UpstreamEvent::SessionError {
                session_id: "ghost".to_string(),
                message: "Session not found: ghost".to_string(),
            }
        );
        let second = tokio::time::timeout(Duration::from_secs(2), link.events.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(second, UpstreamEvent::Frame(frame));

        drop(link);
        server.await.unwrap();
    }

    #[test]
    fn test_buffers_url() {
        assert_eq!(buffers_url("http://10.0.0.2:4020"), "ws://10.0.0.2:4020/buffers");
        assert_eq!(buffers_url("https://remote.example/"), "wss://remote.example/buffers");
    }

    #[tokio::test]
    async fn test_refused_connection_fails_fast() {
        let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        let url = format!("http://{}", listener.local_addr().unwrap());
        drop(listener);

        let err = WsUpstreamConnector.connect(&remote_at(url)).await.unwrap_err();
        assert!(matches!(err, AggregatorError::UpstreamUnavailable { .. }));
    }
}
