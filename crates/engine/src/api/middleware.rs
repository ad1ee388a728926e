//! HTTP middleware and auth helpers

use axum::{extract::Request, http::StatusCode, middleware::Next, response::Response};
use governor::{
    clock::DefaultClock,
    state::{InMemoryState, NotKeyed},
    Quota, RateLimiter,
};
use std::{
    net::IpAddr,
    num::NonZeroU32,
    sync::{Arc, OnceLock},
};
use subtle::ConstantTimeEq;

use dashmap::DashMap;

/// Global rate limiter store for per-IP rate limiting
type IpRateLimiter = Arc<RateLimiter<NotKeyed, InMemoryState, DefaultClock>>;
static RATE_LIMITERS: OnceLock<DashMap<IpAddr, IpRateLimiter>> = OnceLock::new();

fn get_rate_limiter_for_ip(ip: IpAddr) -> IpRateLimiter {
    let limiters = RATE_LIMITERS.get_or_init(DashMap::new);
    if let Some(limiter) = limiters.get(&ip) {
        Arc::clone(&limiter)
    } else {
        // 100 requests per minute per client IP.
        let quota = Quota::per_minute(NonZeroU32::new(100).expect("nonzero"));
        let limiter = Arc::new(RateLimiter::direct(quota));
        limiters.insert(ip, Arc::clone(&limiter));
        limiter
    }
}

/// Extract client IP from proxy headers, falling back to loopback.
fn extract_client_ip(request: &Request) -> IpAddr {
    if let Some(forwarded_for) = request.headers().get("x-forwarded-for") {
        if let Ok(forwarded_str) = forwarded_for.to_str() {
            // Rightmost entry is the one appended by our trusted proxy.
            if let Some(last_ip) = forwarded_str.split(',').next_back() {
                if let Ok(ip) = last_ip.trim().parse::<IpAddr>() {
                    return ip;
                }
            }
        }
    }
    if let Some(real_ip) = request.headers().get("x-real-ip") {
        if let Ok(real_ip_str) = real_ip.to_str() {
            if let Ok(ip) = real_ip_str.parse::<IpAddr>() {
                return ip;
            }
        }
    }
    "127.0.0.1".parse().expect("loopback parses")
}

/// Per-IP token-bucket rate limiting middleware.
pub async fn rate_limit_middleware(request: Request, next: Next) -> Result<Response, StatusCode> {
    let client_ip = extract_client_ip(&request);
    let rate_limiter = get_rate_limiter_for_ip(client_ip);
    match rate_limiter.check() {
        Ok(_) => Ok(next.run(request).await),
        Err(_) => {
            tracing::warn!(client_ip = %client_ip, "rate limit exceeded");
            Err(StatusCode::TOO_MANY_REQUESTS)
        }
    }
}

/// Structured request logging middleware.
pub async fn logging_middleware(request: Request, next: Next) -> Result<Response, StatusCode> {
    use std::time::Instant;

    let method = request.method().clone();
    let uri = request.uri().clone();
    let span = tracing::info_span!(
        "http_request",
        method = %method,
        uri = %uri,
        status_code = tracing::field::Empty,
        latency_ms = tracing::field::Empty,
    );
    let _guard = span.enter();
    let start_time = Instant::now();

    let response = next.run(request).await;

    let latency_ms = start_time.elapsed().as_millis() as u64;
    let status_code = response.status();
    span.record("status_code", status_code.as_u16());
    span.record("latency_ms", latency_ms);
    tracing::info!(
        status_code = status_code.as_u16(),
        latency_ms,
        "request completed"
    );
    Ok(response)
}

/// Constant-time comparison of a presented secret against the expected one.
pub fn secrets_match(presented: &str, expected: &str) -> bool {
    bool::from(presented.as_bytes().ct_eq(expected.as_bytes()))
}

/// Validate a `Bearer <token>` authorization header value.
pub fn verify_bearer(header_value: Option<&str>, expected: Option<&str>) -> bool {
    let (Some(value), Some(expected)) = (header_value, expected) else {
        return false;
    };
    match value.strip_prefix("Bearer ") {
        Some(token) => secrets_match(token, expected),
        None => false,
    }
}
