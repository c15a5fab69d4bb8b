// Couches HTTP communes: limitation de débit par IP et en-têtes de sécurité.
use axum::{
    extract::{ConnectInfo, Request, State},
    http::{HeaderName, HeaderValue, StatusCode},
    middleware::Next,
    response::{IntoResponse, Response},
    Json, Router,
};
use dashmap::DashMap;
use governor::{
    clock::DefaultClock,
    state::{InMemoryState, NotKeyed},
    Quota, RateLimiter,
};
use std::{
    net::{IpAddr, SocketAddr},
    num::NonZeroU32,
    sync::Arc,
    time::Duration,
};
use tower_http::set_header::SetResponseHeaderLayer;
use tracing::debug;

type IpRateLimiter = RateLimiter<NotKeyed, InMemoryState, DefaultClock>;

// Un seau par adresse IP cliente.
#[derive(Clone)]
pub struct RateLimitState {
    quota: Option<Quota>,
    limit: u32,
    window: Duration,
    limiters: Arc<DashMap<IpAddr, Arc<IpRateLimiter>>>,
}

impl RateLimitState {
    // `max` requêtes par `window`, avec une rafale de `max`. `max == 0` désactive la limite.
    pub fn new(max: u32, window: Duration) -> Self {
        let quota = NonZeroU32::new(max).and_then(|burst| {
            Quota::with_period(window / max).map(|quota| quota.allow_burst(burst))
        });
        Self {
            quota,
            limit: max,
            window,
            limiters: Arc::new(DashMap::new()),
        }
    }

    pub fn check(&self, ip: IpAddr) -> Result<(), RateLimited> {
        let Some(quota) = self.quota else {
            return Ok(());
        };
        let limiter = self
            .limiters
            .entry(ip)
            .or_insert_with(|| Arc::new(RateLimiter::direct(quota)))
            .clone();

        limiter.check().map_err(|not_until| {
            let retry_after = not_until
                .wait_time_from(governor::clock::Clock::now(&DefaultClock::default()))
                .as_secs()
                .max(1);
            debug!(ip = %ip, retry_after, "Rate limited");
            RateLimited { retry_after }
        })
    }

    fn policy(&self) -> String {
        format!("{};w={}", self.limit, self.window.as_secs())
    }
}

#[derive(Debug)]
pub struct RateLimited {
    pub retry_after: u64,
}

impl IntoResponse for RateLimited {
    fn into_response(self) -> Response {
        let body = Json(serde_json::json!({
            "error": "Too many requests, please try again later.",
        }));
        let mut response = (StatusCode::TOO_MANY_REQUESTS, body).into_response();
        response.headers_mut().insert(
            HeaderName::from_static("retry-after"),
            HeaderValue::from(self.retry_after),
        );
        response
    }
}

// Toutes les routes, WebSocket compris, passent par le même budget par IP.
pub async fn rate_limit(
    State(state): State<RateLimitState>,
    ConnectInfo(addr): ConnectInfo<SocketAddr>,
    request: Request,
    next: Next,
) -> Result<Response, RateLimited> {
    state.check(addr.ip())?;

    let mut response = next.run(request).await;
    if state.quota.is_some() {
        let headers = response.headers_mut();
        headers.insert(
            HeaderName::from_static("ratelimit-limit"),
            HeaderValue::from(state.limit),
        );
        if let Ok(policy) = HeaderValue::from_str(&state.policy()) {
            headers.insert(HeaderName::from_static("ratelimit-policy"), policy);
        }
    }
    Ok(response)
}

const SECURITY_HEADERS: [(&str, &str); 10] = [
    ("content-security-policy", "default-src 'self'"),
    ("cross-origin-opener-policy", "same-origin"),
    ("cross-origin-resource-policy", "same-origin"),
    ("referrer-policy", "no-referrer"),
    ("strict-transport-security", "max-age=15552000; includeSubDomains"),
    ("x-content-type-options", "nosniff"),
    ("x-dns-prefetch-control", "off"),
    ("x-frame-options", "SAMEORIGIN"),
    ("x-permitted-cross-domain-policies", "none"),
    ("x-xss-protection", "0"),
];

// En-têtes de sécurité par défaut; une réponse qui fixe déjà l'un d'eux le garde.
pub fn security_headers<S>(router: Router<S>) -> Router<S>
where
    S: Clone + Send + Sync + 'static,
{
    SECURITY_HEADERS
        .into_iter()
        .fold(router, |router, (name, value)| {
            router.layer(SetResponseHeaderLayer::if_not_present(
                HeaderName::from_static(name),
                HeaderValue::from_static(value),
            ))
        })
}
