//! HTTP-level rate limiting middleware.
//!
//! Applies a global requests-per-minute quota plus a tighter quota for task
//! submissions. This is distinct from the tool manager's per-tool fixed
//! window, whose boundary semantics are part of the tool-call contract.

use axum::{
    extract::{Request, State},
    http::StatusCode,
    middleware::Next,
    response::Response,
};
use governor::{
    clock::DefaultClock,
    state::{InMemoryState, NotKeyed},
    Quota, RateLimiter,
};
use std::{num::NonZeroU32, sync::Arc};
use tracing::warn;

pub const REQUESTS_PER_MINUTE: u32 = 600;
pub const SUBMISSIONS_PER_MINUTE: u32 = 120;

#[derive(Clone)]
pub struct RateLimitState {
    general: Arc<RateLimiter<NotKeyed, InMemoryState, DefaultClock>>,
    submissions: Arc<RateLimiter<NotKeyed, InMemoryState, DefaultClock>>,
}

impl RateLimitState {
    pub fn new() -> Self {
        let general_quota =
            Quota::per_minute(NonZeroU32::new(REQUESTS_PER_MINUTE).expect("nonzero"));
        let submission_quota =
            Quota::per_minute(NonZeroU32::new(SUBMISSIONS_PER_MINUTE).expect("nonzero"));
        Self {
            general: Arc::new(RateLimiter::direct(general_quota)),
            submissions: Arc::new(RateLimiter::direct(submission_quota)),
        }
    }
}

impl Default for RateLimitState {
    fn default() -> Self {
        Self::new()
    }
}

pub async fn rate_limit_middleware(
    State(state): State<RateLimitState>,
    request: Request,
    next: Next,
) -> Result<Response, StatusCode> {
    let is_submission = request.uri().path() == "/task" && request.method() == "POST";

    if state.general.check().is_err() {
        warn!("Global request quota exhausted");
        return Err(StatusCode::TOO_MANY_REQUESTS);
    }
    if is_submission && state.submissions.check().is_err() {
        warn!("Submission quota exhausted");
        return Err(StatusCode::TOO_MANY_REQUESTS);
    }

    Ok(next.run(request).await)
}
