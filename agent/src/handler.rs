//! Forwards a tunneled `request` frame to the agent's local service and
//! turns its response back into either a single `response` frame or a
//! `stream_data`*/`stream_end` sequence. Grounded on the upstream-execution
//! shape of a forward proxy's stream handler: parse method, attach headers,
//! attach body, enforce a timeout, and translate whatever comes back.

use std::collections::HashMap;

use futures_util::StreamExt;
use tunnel_protocol::{framed::checked_i32, MessageType, TunnelError, TunnelMessage};

use crate::state::AgentClient;

/// Local response bodies up to this size are buffered and sent as one
/// `response` frame; anything larger switches to a `stream_data`*/
/// `stream_end` sequence instead of holding the whole body in memory.
const STREAM_THRESHOLD_BYTES: usize = 64 * 1024;

pub async fn handle_request(client: &AgentClient, msg: TunnelMessage) {
    let id = msg.id.clone();
    if let Err(e) = forward(client, msg).await {
        client.report_error(e.clone());
        let response = error_response(&id, e);
        if let Err(e) = client.send(response).await {
            client.report_error(e.clone());
            tracing::warn!(error = %e, "failed to send response");
        }
    }
}

async fn forward(client: &AgentClient, msg: TunnelMessage) -> Result<(), TunnelError> {
    let mut url = format!(
        "{}{}",
        client.config.local_base_url.trim_end_matches('/'),
        msg.path
    );
    if !msg.query.is_empty() {
        url.push('?');
        url.push_str(&msg.query);
    }

    let method: reqwest::Method = msg
        .method
        .parse()
        .map_err(|_| TunnelError::ProtocolError(format!("invalid method {}", msg.method)))?;

    let mut req = client.http_client.request(method, &url);
    for (k, v) in msg.headers.iter() {
        req = req.header(k.as_str(), v.as_str());
    }
    if !msg.body.is_empty() {
        req = req.body(msg.body);
    }
    req = req.timeout(client.config.request_timeout);

    let response = req.send().await.map_err(|e| {
        if e.is_timeout() {
            TunnelError::Timeout
        } else {
            TunnelError::LocalHandlerError(e.to_string())
        }
    })?;

    let status = checked_i32(response.status().as_u16() as i64)?;
    let mut headers = HashMap::new();
    for (k, v) in response.headers() {
        if let Ok(v) = v.to_str() {
            headers.insert(k.as_str().to_string(), v.to_string());
        }
    }

    // Read up to the threshold before deciding the reply's shape. A body
    // that fits goes out as one buffered `response`, carrying the real
    // status and headers; a body that doesn't switches to streaming, which
    // (per the manager's default-200 handling of a headerless stream) drops
    // them — a local service that needs custom headers on a large response
    // has no way to carry them across this tunnel today.
    let mut buffered = Vec::new();
    let mut body_stream = response.bytes_stream();
    let mut body_complete = false;
    while buffered.len() < STREAM_THRESHOLD_BYTES {
        match body_stream.next().await {
            Some(Ok(chunk)) => buffered.extend_from_slice(&chunk),
            Some(Err(e)) => return Err(TunnelError::LocalHandlerError(e.to_string())),
            None => {
                body_complete = true;
                break;
            }
        }
    }

    if body_complete {
        return client
            .send(TunnelMessage {
                id: msg.id,
                message_type: Some(MessageType::Response),
                status,
                headers,
                body: buffered,
                ..Default::default()
            })
            .await;
    }

    if !buffered.is_empty() {
        client
            .send(TunnelMessage {
                id: msg.id.clone(),
                message_type: Some(MessageType::StreamData),
                body: buffered,
                ..Default::default()
            })
            .await?;
    }

    loop {
        match body_stream.next().await {
            Some(Ok(chunk)) if chunk.is_empty() => continue,
            Some(Ok(chunk)) => {
                client
                    .send(TunnelMessage {
                        id: msg.id.clone(),
                        message_type: Some(MessageType::StreamData),
                        body: chunk.to_vec(),
                        ..Default::default()
                    })
                    .await?;
            }
            Some(Err(e)) => {
                // The reply already committed to a streamed 200 once the
                // first chunk went out; there is no frame to carry a
                // mid-body error, so end the stream early, log it, and
                // publish it on the error channel.
                let err = TunnelError::LocalHandlerError(e.to_string());
                client.report_error(err.clone());
                tracing::warn!(id = %msg.id, error = %err, "local response stream failed mid-body");
                break;
            }
            None => break,
        }
    }

    client
        .send(TunnelMessage {
            id: msg.id,
            message_type: Some(MessageType::StreamEnd),
            ..Default::default()
        })
        .await
}

fn error_response(id: &str, err: TunnelError) -> TunnelMessage {
    TunnelMessage {
        id: id.to_string(),
        message_type: Some(MessageType::Response),
        status: err.http_status() as i32,
        body: err.to_string().into_bytes(),
        ..Default::default()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn error_response_carries_the_mapped_status_and_message() {
        let resp = error_response("req-1", TunnelError::NotConnected("env-a".into()));
        assert_eq!(resp.id, "req-1");
        assert_eq!(resp.status, TunnelError::NotConnected("env-a".into()).http_status() as i32);
        assert!(!resp.body.is_empty());
    }
}
