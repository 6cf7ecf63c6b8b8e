//! Adapts `axum`'s split WebSocket halves to [`tunnel_protocol::conn::WsSink`]/
//! [`tunnel_protocol::conn::WsSource`], so the manager's WebSocket listener
//! can share [`tunnel_protocol::conn::WsConn`] with the agent's
//! `tokio-tungstenite` side.

use async_trait::async_trait;
use axum::extract::ws::{Message, WebSocket};
use futures_util::stream::{SplitSink, SplitStream};
use futures_util::{SinkExt, StreamExt};
use tunnel_protocol::conn::{WsSink, WsSource};
use tunnel_protocol::TunnelError;

pub struct AxumWsSink(pub SplitSink<WebSocket, Message>);
pub struct AxumWsSource(pub SplitStream<WebSocket>);

#[async_trait]
impl WsSink for AxumWsSink {
    async fn send_text(&mut self, text: String) -> Result<(), TunnelError> {
        self.0
            .send(Message::Text(text.into()))
            .await
            .map_err(|e| TunnelError::TransportError(e.to_string()))
    }

    async fn close(&mut self) -> Result<(), TunnelError> {
        let _ = self.0.send(Message::Close(None)).await;
        Ok(())
    }
}

#[async_trait]
impl WsSource for AxumWsSource {
    async fn recv_text(&mut self) -> Result<Option<String>, TunnelError> {
        loop {
            return match self.0.next().await {
                None => Ok(None),
                Some(Ok(Message::Text(t))) => Ok(Some(t.to_string())),
                Some(Ok(Message::Close(_))) => Ok(None),
                Some(Ok(_)) => continue,
                Some(Err(e)) => Err(TunnelError::TransportError(e.to_string())),
            };
        }
    }
}
