//! Adapts `tokio-tungstenite`'s split WebSocket halves to
//! [`tunnel_protocol::conn::WsSink`]/[`tunnel_protocol::conn::WsSource`],
//! mirroring the manager's `axum` adapter so both sides share
//! [`tunnel_protocol::conn::WsConn`].

use async_trait::async_trait;
use futures_util::stream::{SplitSink, SplitStream};
use futures_util::{SinkExt, StreamExt};
use tokio::net::TcpStream;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream};
use tunnel_protocol::conn::{WsSink, WsSource};
use tunnel_protocol::TunnelError;

type Socket = WebSocketStream<MaybeTlsStream<TcpStream>>;

pub struct TungsteniteWsSink(pub SplitSink<Socket, Message>);
pub struct TungsteniteWsSource(pub SplitStream<Socket>);

#[async_trait]
impl WsSink for TungsteniteWsSink {
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
impl WsSource for TungsteniteWsSource {
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
