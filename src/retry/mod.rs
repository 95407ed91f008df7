//! Error classification and retry with exponential backoff.
//!
//! Partner failures become a `ClassifiedError` carrying category, optional
//! HTTP status, and retryability; callers pattern-match instead of catching.
//! `with_retry` owns the backoff schedule and the cooperative deadline.

use rand::Rng;
use std::future::Future;
use std::time::Duration;
use tokio::time::Instant;
use tracing::{debug, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorCategory {
    Authentication,
    Authorization,
    RateLimit,
    Validation,
    NotFound,
    ServerError,
    Network,
    Unknown,
}

impl ErrorCategory {
    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorCategory::Authentication => "authentication",
            ErrorCategory::Authorization => "authorization",
            ErrorCategory::RateLimit => "rate_limit",
            ErrorCategory::Validation => "validation",
            ErrorCategory::NotFound => "not_found",
            ErrorCategory::ServerError => "server_error",
            ErrorCategory::Network => "network",
            ErrorCategory::Unknown => "unknown",
        }
    }
}

/// A partner error after classification.
#[derive(Debug, Clone)]
pub struct ClassifiedError {
    pub category: ErrorCategory,
    pub status_code: Option<u16>,
    pub message: String,
    /// `Retry-After` seconds when the partner supplied one.
    pub retry_after_secs: Option<u64>,
}

impl std::fmt::Display for ClassifiedError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "[{}] {}", self.category.as_str(), self.message)
    }
}

impl std::error::Error for ClassifiedError {}

impl ClassifiedError {
    pub fn new(category: ErrorCategory, message: impl Into<String>) -> Self {
        Self {
            category,
            status_code: None,
            message: message.into(),
            retry_after_secs: None,
        }
    }

    pub fn with_status(mut self, status: u16) -> Self {
        self.status_code = Some(status);
        self
    }

    /// Classify from a raw error message. Sources, in order: embedded HTTP
    /// status, platform error codes, known phrases.
    pub fn from_message(message: impl Into<String>) -> Self {
        let message = message.into();
        let status_code = find_http_status(&message);

        let category = if let Some(status) = status_code {
            category_for_status(status)
        } else if let Some(cat) = category_for_platform_code(&message) {
            cat
        } else {
            category_for_phrase(&message)
        };

        Self {
            category,
            status_code,
            message,
            retry_after_secs: None,
        }
    }

    /// rate_limit, server_error, and network retry; authentication retries
    /// once after a token refresh (the caller's closure re-fetches the
    /// token); 408 retries regardless of how it classified.
    pub fn is_retryable(&self) -> bool {
        if self.status_code == Some(408) {
            return true;
        }
        matches!(
            self.category,
            ErrorCategory::RateLimit
                | ErrorCategory::ServerError
                | ErrorCategory::Network
                | ErrorCategory::Authentication
        )
    }
}

fn category_for_status(status: u16) -> ErrorCategory {
    match status {
        401 => ErrorCategory::Authentication,
        403 => ErrorCategory::Authorization,
        404 => ErrorCategory::NotFound,
        408 => ErrorCategory::Network,
        429 => ErrorCategory::RateLimit,
        400 | 422 => ErrorCategory::Validation,
        s if (500..600).contains(&s) => ErrorCategory::ServerError,
        _ => ErrorCategory::Unknown,
    }
}

/// First standalone 3-digit number in the 4xx/5xx range.
fn find_http_status(message: &str) -> Option<u16> {
    let bytes = message.as_bytes();
    let mut i = 0;
    while i < bytes.len() {
        if bytes[i].is_ascii_digit() {
            let start = i;
            while i < bytes.len() && bytes[i].is_ascii_digit() {
                i += 1;
            }
            if i - start == 3 {
                let preceded_ok = start == 0 || !bytes[start - 1].is_ascii_alphanumeric();
                if preceded_ok {
                    if let Ok(n) = message[start..i].parse::<u16>() {
                        if (400..600).contains(&n) {
                            return Some(n);
                        }
                    }
                }
            }
        } else {
            i += 1;
        }
    }
    None
}

fn category_for_platform_code(message: &str) -> Option<ErrorCategory> {
    const NETWORK_CODES: &[&str] = &[
        "ECONNRESET",
        "ECONNREFUSED",
        "ETIMEDOUT",
        "EPIPE",
        "ENOTFOUND",
        "EAI_AGAIN",
        "EHOSTUNREACH",
    ];
    NETWORK_CODES
        .iter()
        .any(|code| message.contains(code))
        .then_some(ErrorCategory::Network)
}

fn category_for_phrase(message: &str) -> ErrorCategory {
    let lower = message.to_lowercase();
    if lower.contains("rate limit") || lower.contains("too many requests") {
        ErrorCategory::RateLimit
    } else if lower.contains("timeout") || lower.contains("timed out") || lower.contains("connection closed") {
        ErrorCategory::Network
    } else if lower.contains("service unavailable")
        || lower.contains("bad gateway")
        || lower.contains("internal server error")
    {
        ErrorCategory::ServerError
    } else if lower.contains("unauthorized")
        || lower.contains("invalid token")
        || lower.contains("token expired")
    {
        ErrorCategory::Authentication
    } else if lower.contains("forbidden") || lower.contains("permission denied") {
        ErrorCategory::Authorization
    } else if lower.contains("not found") {
        ErrorCategory::NotFound
    } else if lower.contains("validation") || lower.contains("invalid request") {
        ErrorCategory::Validation
    } else {
        ErrorCategory::Unknown
    }
}

#[derive(Debug, Clone)]
pub struct RetryConfig {
    pub max_attempts: u32,
    pub initial_delay: Duration,
    pub max_delay: Duration,
    pub multiplier: f64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: 5,
            initial_delay: Duration::from_secs(1),
            max_delay: Duration::from_secs(60),
            multiplier: 2.0,
        }
    }
}

impl RetryConfig {
    /// Delay before attempt `n + 1` (0-based failure count), with ±10%
    /// uniform jitter.
    pub fn delay_for(&self, failure_index: u32) -> Duration {
        let base = self.initial_delay.as_secs_f64() * self.multiplier.powi(failure_index as i32);
        let capped = base.min(self.max_delay.as_secs_f64());
        let jitter = rand::thread_rng().gen_range(0.9..=1.1);
        Duration::from_secs_f64(capped * jitter)
    }
}

/// Result of a retried operation, attempts included for observability.
#[derive(Debug)]
pub struct RetryOutcome<T> {
    pub result: Result<T, ClassifiedError>,
    pub attempts: u32,
}

impl<T> RetryOutcome<T> {
    pub fn success(&self) -> bool {
        self.result.is_ok()
    }

    pub fn into_result(self) -> Result<T, ClassifiedError> {
        self.result
    }
}

/// Execute `op` with exponential backoff. `deadline`, when set, is checked
/// before every wait; a passed deadline aborts with the last error.
pub async fn with_retry<T, F, Fut>(
    mut op: F,
    config: &RetryConfig,
    ctx: &str,
    deadline: Option<Instant>,
) -> RetryOutcome<T>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, ClassifiedError>>,
{
    let mut auth_retried = false;

    for attempt in 1..=config.max_attempts {
        match op().await {
            Ok(value) => {
                if attempt > 1 {
                    debug!(ctx, attempt, "operation recovered after retry");
                }
                return RetryOutcome {
                    result: Ok(value),
                    attempts: attempt,
                };
            }
            Err(err) => {
                let retryable = err.is_retryable()
                    && !(err.category == ErrorCategory::Authentication && auth_retried);
                if !retryable || attempt == config.max_attempts {
                    if attempt == config.max_attempts {
                        warn!(ctx, attempts = attempt, "retry budget exhausted: {err}");
                    }
                    return RetryOutcome {
                        result: Err(err),
                        attempts: attempt,
                    };
                }
                if err.category == ErrorCategory::Authentication {
                    // One shot only, after the caller refreshes its token.
                    auth_retried = true;
                }

                let delay = match err.retry_after_secs {
                    Some(secs) => Duration::from_secs(secs),
                    None => config.delay_for(attempt - 1),
                };
                debug!(ctx, attempt, delay_ms = delay.as_millis() as u64, "retrying: {err}");

                let wake = Instant::now() + delay;
                if let Some(deadline) = deadline {
                    if wake >= deadline {
                        warn!(ctx, "deadline reached mid-backoff, aborting");
                        return RetryOutcome {
                            result: Err(err),
                            attempts: attempt,
                        };
                    }
                }
                tokio::time::sleep_until(wake).await;
            }
        }
    }

    unreachable!("loop returns on success, exhaustion, or non-retryable error")
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::sync::Arc;

    #[test]
    fn test_classify_by_status() {
        let cases = [
            ("request failed with status 429", ErrorCategory::RateLimit, true),
            ("HTTP 401 from partner", ErrorCategory::Authentication, true),
            ("got 403 Forbidden", ErrorCategory::Authorization, false),
            ("upstream said 404", ErrorCategory::NotFound, false),
            ("partner returned 503", ErrorCategory::ServerError, true),
            ("bad request: 400", ErrorCategory::Validation, false),
        ];
        for (msg, category, retryable) in cases {
            let err = ClassifiedError::from_message(msg);
            assert_eq!(err.category, category, "{msg}");
            assert_eq!(err.is_retryable(), retryable, "{msg}");
        }
    }

    #[test]
    fn test_408_retries_regardless() {
        let err = ClassifiedError::from_message("status 408 request timeout");
        assert_eq!(err.status_code, Some(408));
        assert!(err.is_retryable());
    }

    #[test]
    fn test_classify_platform_codes() {
        let err = ClassifiedError::from_message("connect ECONNRESET 10.0.0.1:443");
        assert_eq!(err.category, ErrorCategory::Network);
        assert!(err.is_retryable());
    }

    #[test]
    fn test_classify_phrases() {
        assert_eq!(
            ClassifiedError::from_message("partner rate limit exceeded").category,
            ErrorCategory::RateLimit
        );
        assert_eq!(
            ClassifiedError::from_message("operation timed out after 30s").category,
            ErrorCategory::Network
        );
        assert_eq!(
            ClassifiedError::from_message("Service Unavailable").category,
            ErrorCategory::ServerError
        );
        assert_eq!(
            ClassifiedError::from_message("something inexplicable").category,
            ErrorCategory::Unknown
        );
    }

    #[test]
    fn test_status_number_not_part_of_identifier() {
        // "id 5001234" must not classify as a 500.
        let err = ClassifiedError::from_message("record id 5001234 rejected as invalid request");
        assert_eq!(err.status_code, None);
        assert_eq!(err.category, ErrorCategory::Validation);
    }

    #[test]
    fn test_delay_schedule_doubles_with_cap() {
        let config = RetryConfig::default();
        // Jitter is ±10%; check the envelope.
        for (i, expected) in [(0u32, 1.0f64), (1, 2.0), (2, 4.0), (3, 8.0)] {
            let d = config.delay_for(i).as_secs_f64();
            assert!(d >= expected * 0.9 - 1e-9 && d <= expected * 1.1 + 1e-9, "i={i} d={d}");
        }
        let capped = config.delay_for(30).as_secs_f64();
        assert!(capped <= 60.0 * 1.1 + 1e-9);
    }

    #[tokio::test(start_paused = true)]
    async fn test_never_succeeding_retryable_runs_max_attempts() {
        let calls = Arc::new(AtomicU32::new(0));
        let counter = calls.clone();
        let outcome: RetryOutcome<()> = with_retry(
            move || {
                let counter = counter.clone();
                async move {
                    counter.fetch_add(1, Ordering::SeqCst);
                    Err(ClassifiedError::from_message("status 503"))
                }
            },
            &RetryConfig::default(),
            "test",
            None,
        )
        .await;

        assert!(!outcome.success());
        assert_eq!(outcome.attempts, 5);
        assert_eq!(calls.load(Ordering::SeqCst), 5);
    }

    #[tokio::test]
    async fn test_non_retryable_runs_once() {
        let calls = Arc::new(AtomicU32::new(0));
        let counter = calls.clone();
        let outcome: RetryOutcome<()> = with_retry(
            move || {
                let counter = counter.clone();
                async move {
                    counter.fetch_add(1, Ordering::SeqCst);
                    Err(ClassifiedError::from_message("403 forbidden"))
                }
            },
            &RetryConfig::default(),
            "test",
            None,
        )
        .await;

        assert!(!outcome.success());
        assert_eq!(outcome.attempts, 1);
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_rate_limit_then_success() {
        // Partner 429s three times then succeeds: four invocations total.
        let calls = Arc::new(AtomicU32::new(0));
        let counter = calls.clone();
        let outcome = with_retry(
            move || {
                let counter = counter.clone();
                async move {
                    let n = counter.fetch_add(1, Ordering::SeqCst);
                    if n < 3 {
                        Err(ClassifiedError::from_message("HTTP 429 too many requests"))
                    } else {
                        Ok("done")
                    }
                }
            },
            &RetryConfig::default(),
            "test",
            None,
        )
        .await;

        assert!(outcome.success());
        assert_eq!(outcome.attempts, 4);
        assert_eq!(calls.load(Ordering::SeqCst), 4);
    }

    #[tokio::test(start_paused = true)]
    async fn test_authentication_retries_exactly_once() {
        let calls = Arc::new(AtomicU32::new(0));
        let counter = calls.clone();
        let outcome: RetryOutcome<()> = with_retry(
            move || {
                let counter = counter.clone();
                async move {
                    counter.fetch_add(1, Ordering::SeqCst);
                    Err(ClassifiedError::from_message("HTTP 401 unauthorized"))
                }
            },
            &RetryConfig::default(),
            "test",
            None,
        )
        .await;

        assert!(!outcome.success());
        assert_eq!(outcome.attempts, 2);
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_deadline_aborts_backoff() {
        let calls = Arc::new(AtomicU32::new(0));
        let counter = calls.clone();
        // Deadline shorter than the first backoff wait.
        let deadline = Instant::now() + Duration::from_millis(100);
        let outcome: RetryOutcome<()> = with_retry(
            move || {
                let counter = counter.clone();
                async move {
                    counter.fetch_add(1, Ordering::SeqCst);
                    Err(ClassifiedError::from_message("status 503"))
                }
            },
            &RetryConfig::default(),
            "test",
            Some(deadline),
        )
        .await;

        assert!(!outcome.success());
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_retry_after_hint_overrides_backoff() {
        let calls = Arc::new(AtomicU32::new(0));
        let counter = calls.clone();
        let start = Instant::now();
        let outcome = with_retry(
            move || {
                let counter = counter.clone();
                async move {
                    let n = counter.fetch_add(1, Ordering::SeqCst);
                    if n == 0 {
                        let mut err = ClassifiedError::from_message("HTTP 429");
                        err.retry_after_secs = Some(7);
                        Err(err)
                    } else {
                        Ok(())
                    }
                }
            },
            &RetryConfig::default(),
            "test",
            None,
        )
        .await;

        assert!(outcome.success());
        assert!(start.elapsed() >= Duration::from_secs(7));
    }
}
