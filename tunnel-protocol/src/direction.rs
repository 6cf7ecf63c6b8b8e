//! Direction legality, canonical-path normalization, and tunnel-traffic
//! detection (§4.2, §4.4, §6 of the spec).
//!
//! Direction legality lives here rather than on [`crate::message::MessageType`]
//! itself, per the design note in §9: "direction legality is enforced in the
//! encoder, not in the type."

use crate::message::MessageType;

/// Who originated a message.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    ManagerOrigin,
    AgentOrigin,
}

/// Returns whether `tag` is legal for a message originating from `dir`.
///
/// `websocket_data` and `websocket_close` are legal in both directions;
/// everything else belongs to exactly one side.
pub fn is_legal(dir: Direction, tag: MessageType) -> bool {
    use MessageType::*;
    match tag {
        WebsocketData | WebsocketClose => true,
        Request | WebsocketStart | HeartbeatAck | RegisterResponse => dir == Direction::ManagerOrigin,
        Response | Heartbeat | StreamData | StreamEnd | Register | Event => {
            dir == Direction::AgentOrigin
        }
    }
}

/// The canonical path the manager's framed-RPC upgrade endpoint is served
/// at. Agents should dial this path directly; the constants below exist
/// only to keep old agents and misconfigured proxies working.
pub const CANONICAL_TUNNEL_PATH: &str = "/edge/tunnel.Tunnel/Connect";

/// Legacy path kept for backward compatibility with older agents.
pub const LEGACY_TUNNEL_PATH: &str = "/api/tunnel/connect";

/// Normalize a request path to the canonical tunnel path if it refers to
/// the tunnel connect endpoint under any of the accepted forms:
/// the canonical path itself, the legacy path, or either of those with an
/// arbitrary reverse-proxy prefix prepended (detected by suffix match).
///
/// Returns `None` if `path` does not refer to the tunnel endpoint at all,
/// leaving the caller's identity/routing untouched (§8.6: "an unprefixed
/// canonical path is returned unchanged with identity preserved").
pub fn normalize_tunnel_path(path: &str) -> Option<&'static str> {
    if path == CANONICAL_TUNNEL_PATH {
        return Some(CANONICAL_TUNNEL_PATH);
    }
    if path == LEGACY_TUNNEL_PATH {
        return Some(CANONICAL_TUNNEL_PATH);
    }
    if path.ends_with(CANONICAL_TUNNEL_PATH) || path.ends_with(LEGACY_TUNNEL_PATH) {
        return Some(CANONICAL_TUNNEL_PATH);
    }
    None
}

/// Minimal view of an inbound request needed to classify it as tunnel
/// traffic vs. ordinary HTTP, per §4.4's `isTunnelRequest`.
pub struct RequestClassifyInput<'a> {
    pub method: &'a str,
    pub path: &'a str,
    pub content_type: Option<&'a str>,
    pub http2: bool,
    pub te_header: Option<&'a str>,
}

/// `isTunnelRequest` from §4.4: true when the request should be dispatched
/// to the framed-RPC server instead of the ordinary HTTP router.
///
/// gRPC and gRPC-web traffic is always POST, so every branch besides the
/// canonical-path check is gated on method too — a `GET` can never be
/// tunnel traffic no matter what content-type or `te` header it carries
/// (§8.7).
pub fn is_tunnel_request(req: &RequestClassifyInput<'_>) -> bool {
    if !req.method.eq_ignore_ascii_case("POST") {
        return false;
    }
    if normalize_tunnel_path(req.path).is_some() {
        return true;
    }
    if let Some(ct) = req.content_type {
        if ct.starts_with("application/grpc") {
            return true;
        }
    }
    if req.http2 {
        if let Some(te) = req.te_header {
            if te.contains("trailers") {
                return true;
            }
        }
    }
    false
}
