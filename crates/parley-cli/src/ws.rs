use async_trait::async_trait;
use axum::extract::ws::{CloseFrame, Message, WebSocket};
use parley_core::protocol::ConnectionClosed;
use parley_core::{AskFrame, AskRequest, ClientConnection, CloseCode};

/// A chat WebSocket as seen by the session handler: JSON requests in, JSON
/// frames out.
pub struct WsConnection {
    socket: WebSocket,
}

impl WsConnection {
    pub fn new(socket: WebSocket) -> Self {
        Self { socket }
    }
}

#[async_trait]
impl ClientConnection for WsConnection {
    async fn recv(&mut self) -> Option<Result<AskRequest, String>> {
        loop {
            let message = match self.socket.recv().await? {
                Ok(message) => message,
                Err(e) => {
                    tracing::debug!(error = %e, "websocket receive failed");
                    return None;
                }
            };
            let parsed = match message {
                Message::Text(text) => serde_json::from_str(text.as_str()),
                Message::Binary(bytes) => serde_json::from_slice(&bytes),
                Message::Close(_) => return None,
                Message::Ping(_) | Message::Pong(_) => continue,
            };
            return Some(parsed.map_err(|e| e.to_string()));
        }
    }

    async fn send(&mut self, frame: &AskFrame) -> Result<(), ConnectionClosed> {
        let text = serde_json::to_string(frame).map_err(|e| {
            tracing::error!(error = %e, "could not encode frame");
            ConnectionClosed
        })?;
        self.socket
            .send(Message::Text(text.into()))
            .await
            .map_err(|_| ConnectionClosed)
    }

    async fn close(&mut self, code: CloseCode) {
        let frame = CloseFrame {
            code: code.code(),
            reason: code.reason().into(),
        };
        if let Err(e) = self.socket.send(Message::Close(Some(frame))).await {
            tracing::debug!(error = %e, "close frame not delivered");
        }
    }
}
