#![forbid(unsafe_code)]

//! License acquisition: challenge out, license in, with retry.

use std::{fmt, future::Future, sync::Arc, time::Duration};

use bytes::Bytes;
use derivative::Derivative;
use derive_setters::Setters;
use futures::{FutureExt, future::BoxFuture};
use tokio::time::{sleep, timeout};
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace, warn};

use crate::{
    cdm::{MediaKeySession, MessageType},
    error::{DrmError, DrmResult, LicenseError},
};

/// What a license callback resolves to: a license, `None` to skip the
/// request, or a failure.
pub type LicenseResult = Result<Option<Bytes>, LicenseError>;

/// Answer of a license callback, either immediate or deferred.
pub enum LicenseResponse {
    Ready(LicenseResult),
    Pending(BoxFuture<'static, LicenseResult>),
}

impl LicenseResponse {
    pub fn license<B: Into<Bytes>>(license: B) -> Self {
        Self::Ready(Ok(Some(license.into())))
    }

    /// Skip this request; the session is left as is.
    #[must_use]
    pub fn ignore() -> Self {
        Self::Ready(Ok(None))
    }

    #[must_use]
    pub fn failed(error: LicenseError) -> Self {
        Self::Ready(Err(error))
    }

    pub fn pending<F>(future: F) -> Self
    where
        F: Future<Output = LicenseResult> + Send + 'static,
    {
        Self::Pending(future.boxed())
    }

    async fn resolve(self) -> LicenseResult {
        match self {
            Self::Ready(result) => result,
            Self::Pending(future) => future.await,
        }
    }
}

impl From<LicenseResult> for LicenseResponse {
    fn from(result: LicenseResult) -> Self {
        Self::Ready(result)
    }
}

impl fmt::Debug for LicenseResponse {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Ready(result) => f.debug_tuple("Ready").field(result).finish(),
            Self::Pending(_) => f.write_str("Pending"),
        }
    }
}

/// Caller-supplied license fetcher, called with the challenge and its type.
pub type LicenseCallback = Arc<dyn Fn(Bytes, MessageType) -> LicenseResponse + Send + Sync>;

/// How many times a failed license request is retried.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum RetryLimit {
    /// At most this many retries after the first attempt. `Count(0)` disables retries.
    Count(u32),
    Unlimited,
}

impl RetryLimit {
    /// Whether another attempt may follow `failures` failed ones.
    #[must_use]
    pub fn allows_retry(self, failures: u32) -> bool {
        match self {
            Self::Count(retries) => failures <= retries,
            Self::Unlimited => true,
        }
    }
}

/// Retry and timeout settings of license requests.
#[derive(Clone, Debug, Derivative, Setters)]
#[derivative(Default)]
#[setters(prefix = "with_", strip_option)]
pub struct LicensePolicy {
    /// Default: 3 retries.
    #[derivative(Default(value = "RetryLimit::Count(3)"))]
    pub retry: RetryLimit,
    /// Backoff before the first retry, doubled for each following one. Default: 200ms.
    #[derivative(Default(value = "Duration::from_millis(200)"))]
    pub base_delay: Duration,
    /// Backoff cap. Default: 3s.
    #[derivative(Default(value = "Duration::from_secs(3)"))]
    pub max_delay: Duration,
    /// Per-attempt limit; exceeding it counts as a failed attempt. Default: 10s.
    #[derivative(Default(value = "Some(Duration::from_secs(10))"))]
    pub timeout: Option<Duration>,
}

impl LicensePolicy {
    /// Remove the per-attempt limit.
    #[must_use]
    pub fn without_timeout(mut self) -> Self {
        self.timeout = None;
        self
    }

    /// Backoff after `failures` failed attempts.
    #[must_use]
    pub fn delay_for_attempt(&self, failures: u32) -> Duration {
        if failures == 0 {
            return Duration::ZERO;
        }
        let factor = 2_u32.saturating_pow(failures - 1);
        self.base_delay
            .checked_mul(factor)
            .unwrap_or(self.max_delay)
            .min(self.max_delay)
    }
}

/// One challenge emitted by a session.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct LicenseRequest {
    pub challenge: Bytes,
    pub message_type: MessageType,
}

/// Terminal result of a successful acquisition.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum LicenseOutcome {
    /// The session was updated with the license.
    Updated,
    /// The callback returned no license.
    Ignored,
}

async fn attempt(
    request: &LicenseRequest,
    get_license: &LicenseCallback,
    limit: Option<Duration>,
) -> LicenseResult {
    let response = get_license(request.challenge.clone(), request.message_type);
    match limit {
        Some(limit) => timeout(limit, response.resolve())
            .await
            .map_err(|_| LicenseError::timeout(limit))?,
        None => response.resolve().await,
    }
}

/// Fetch a license for `request` and feed it to `session`.
///
/// The callback is retried with the same challenge per `policy`. Each failure
/// that is followed by a retry is passed to `on_retry` with the number of
/// failures so far.
///
/// # Errors
///
/// - [`DrmError::KeyLoad`] with the last failure's message once retries are exhausted
///   or the failure is marked `no_retry`.
/// - [`DrmError::KeyUpdate`] when the session rejects the license.
/// - [`DrmError::Cancelled`] when `cancel` fires.
pub async fn acquire_license<F>(
    session: &dyn MediaKeySession,
    request: &LicenseRequest,
    get_license: &LicenseCallback,
    policy: &LicensePolicy,
    cancel: &CancellationToken,
    mut on_retry: F,
) -> DrmResult<LicenseOutcome>
where
    F: FnMut(&DrmError, u32),
{
    let mut failures: u32 = 0;
    let license = loop {
        let result = tokio::select! {
            biased;
            () = cancel.cancelled() => return Err(DrmError::Cancelled),
            result = attempt(request, get_license, policy.timeout) => result,
        };
        let error = match result {
            Ok(license) => break license,
            Err(error) => error,
        };

        failures = failures.saturating_add(1);
        let drm_error = DrmError::KeyLoad {
            message: error.message.clone(),
            timed_out: error.timed_out,
        };
        if error.no_retry || !policy.retry.allows_retry(failures) {
            warn!(
                message_type = %request.message_type,
                attempts = failures,
                %error,
                "license request failed"
            );
            return Err(drm_error);
        }

        let delay = policy.delay_for_attempt(failures);
        debug!(attempt = failures, ?delay, %error, "license request failed, retrying");
        on_retry(&drm_error, failures);

        tokio::select! {
            biased;
            () = cancel.cancelled() => return Err(DrmError::Cancelled),
            () = sleep(delay) => {}
        }
    };

    let Some(license) = license else {
        trace!(message_type = %request.message_type, "license callback skipped the request");
        return Ok(LicenseOutcome::Ignored);
    };

    tokio::select! {
        biased;
        () = cancel.cancelled() => Err(DrmError::Cancelled),
        result = session.update(license) => {
            result.map_err(DrmError::KeyUpdate)?;
            trace!(message_type = %request.message_type, "session updated with license");
            Ok(LicenseOutcome::Updated)
        }
    }
}
