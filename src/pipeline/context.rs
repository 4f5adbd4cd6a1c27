//! Per-request context threaded through the pipeline.

use std::net::SocketAddr;
use std::time::Duration;

use axum::extract::ConnectInfo;
use chrono::{DateTime, Utc};
use http::{HeaderMap, Method, Request};
use tokio::time::Instant;
use uuid::Uuid;

use crate::ratelimit::ClientIdentity;

/// Header carrying the original client address through proxies.
pub const X_FORWARDED_FOR: &str = "x-forwarded-for";

/// Identifier of an in-flight request.
///
/// Inserted into the request extensions before the downstream handler runs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct RequestId(pub Uuid);

impl std::fmt::Display for RequestId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        std::fmt::Display::fmt(&self.0, f)
    }
}

/// An authenticated caller, as decided by an upstream authentication layer.
///
/// The pipeline only reads this request extension; it never creates one.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Principal(pub String);

/// Everything the pipeline knows about one request.
///
/// Owned by the request's task and dropped when the response is produced.
#[derive(Debug, Clone)]
pub struct RequestContext {
    pub request_id: RequestId,
    /// Monotonic start, used for latency
    pub started_at: Instant,
    /// Wall-clock start, used for log timestamps
    pub received_at: DateTime<Utc>,
    pub method: Method,
    pub path: String,
    pub client_identity: ClientIdentity,
    pub principal: Option<String>,
}

impl RequestContext {
    /// Capture the context of an inbound request.
    pub fn begin<B>(request: &Request<B>, trust_forwarded_for: bool) -> Self {
        let peer = request
            .extensions()
            .get::<ConnectInfo<SocketAddr>>()
            .map(|ConnectInfo(addr)| *addr);

        Self {
            request_id: RequestId(Uuid::new_v4()),
            started_at: Instant::now(),
            received_at: Utc::now(),
            method: request.method().clone(),
            path: request.uri().path().to_string(),
            client_identity: resolve_client_identity(request.headers(), peer, trust_forwarded_for),
            principal: request
                .extensions()
                .get::<Principal>()
                .map(|Principal(name)| name.clone()),
        }
    }

    /// Time elapsed since the request entered the pipeline.
    pub fn elapsed(&self) -> Duration {
        self.started_at.elapsed()
    }
}

/// Resolve the identity used to partition rate limit state.
///
/// The socket address wins unless `trust_forwarded_for` is set; the first
/// `x-forwarded-for` entry is used otherwise, and `"unknown"` when neither
/// is available.
pub fn resolve_client_identity(
    headers: &HeaderMap,
    peer: Option<SocketAddr>,
    trust_forwarded_for: bool,
) -> ClientIdentity {
    let forwarded = forwarded_for(headers);
    let peer_ip = peer.map(|addr| addr.ip().to_string());

    let resolved = if trust_forwarded_for {
        forwarded.or(peer_ip)
    } else {
        peer_ip.or(forwarded)
    };

    resolved.map(ClientIdentity::new).unwrap_or_else(ClientIdentity::unknown)
}

fn forwarded_for(headers: &HeaderMap) -> Option<String> {
    headers
        .get(X_FORWARDED_FOR)
        .and_then(|value| value.to_str().ok())
        .and_then(|value| value.split(',').next())
        .map(str::trim)
        .filter(|value| !value.is_empty())
        .map(str::to_string)
}
