//! Scheduling policy: when a feed may be fetched again.
//!
//! Pure functions over a feed's runtime state, the current time and the
//! configured intervals. Nothing here performs I/O.

use chrono::{DateTime, Duration, Utc};

use crate::feed::types::FeedRuntimeState;

/// Growth factor of the failure backoff.
pub const BACKOFF_BASE: f64 = 1.8;

/// Replace degenerate configuration values: a non-positive interval becomes
/// one second, a non-positive backoff ceiling becomes the interval.
fn normalize(interval: Duration, max_backoff: Duration) -> (Duration, Duration) {
    let interval = if interval <= Duration::zero() {
        Duration::seconds(1)
    } else {
        interval
    };
    let max_backoff = if max_backoff <= Duration::zero() {
        interval
    } else {
        max_backoff
    };
    (interval, max_backoff)
}

fn saturating_add(at: DateTime<Utc>, delta: Duration) -> DateTime<Utc> {
    at.checked_add_signed(delta)
        .unwrap_or(DateTime::<Utc>::MAX_UTC)
}

/// Delay imposed after `failures` consecutive failures.
///
/// `min(max_backoff, interval * 1.8^failures)`, and zero without failures.
pub fn calculate_backoff(interval: Duration, failures: u32, max_backoff: Duration) -> Duration {
    if failures == 0 {
        return Duration::zero();
    }
    let (interval, max_backoff) = normalize(interval, max_backoff);

    let exponent = i32::try_from(failures).unwrap_or(i32::MAX);
    let secs = interval.num_seconds() as f64 * BACKOFF_BASE.powi(exponent);
    let capped = secs.min(max_backoff.num_seconds() as f64);

    Duration::seconds(capped as i64)
}

/// Decide whether a feed should be left alone in this pass.
///
/// Rules are evaluated in priority order and the first match wins: suspension,
/// a pending `Retry-After`, an explicit schedule, the failure backoff, and
/// finally the base interval since the last check.
pub fn should_skip(
    now: DateTime<Utc>,
    state: &FeedRuntimeState,
    interval: Duration,
    max_backoff: Duration,
) -> bool {
    if state.suspended {
        return true;
    }

    if state.retry_after_until.is_some_and(|until| until > now) {
        return true;
    }

    // An explicit schedule decides on its own once set.
    if let Some(next_check_at) = state.next_check_at {
        return next_check_at > now;
    }

    let (interval, max_backoff) = normalize(interval, max_backoff);

    if state.consecutive_failures > 0 {
        let backoff = calculate_backoff(interval, state.consecutive_failures, max_backoff);
        if let Some(base) = state.last_error_at.or(state.last_checked_at) {
            if now < saturating_add(base, backoff) {
                return true;
            }
        }
    }

    match state.last_checked_at {
        Some(last_checked_at) => now.signed_duration_since(last_checked_at) < interval,
        None => false,
    }
}

/// Compute when a feed should be checked next.
///
/// Takes the furthest of the base interval, a future `Retry-After`, the
/// `Cache-Control` max-age, a future `Expires` and the failure backoff, then
/// caps the result at `now + max_backoff`.
pub fn compute_next_check_at(
    now: DateTime<Utc>,
    interval: Duration,
    max_backoff: Duration,
    consecutive_failures: u32,
    retry_after_until: Option<DateTime<Utc>>,
    cache_control: Option<&str>,
    expires_at: Option<DateTime<Utc>>,
) -> DateTime<Utc> {
    let (interval, max_backoff) = normalize(interval, max_backoff);
    let ceiling = saturating_add(now, max_backoff);

    let mut next = saturating_add(now, interval);

    if let Some(until) = retry_after_until.filter(|until| *until > now) {
        next = next.max(until);
    }

    if let Some(max_age) = cache_control.and_then(parse_max_age) {
        // Anything past the ceiling is clamped below anyway.
        let max_age = max_age.min(max_backoff.num_seconds());
        next = next.max(saturating_add(now, Duration::seconds(max_age)));
    }

    if let Some(expires_at) = expires_at.filter(|at| *at > now) {
        next = next.max(expires_at);
    }

    if consecutive_failures > 0 {
        let backoff = calculate_backoff(interval, consecutive_failures, max_backoff);
        next = next.max(saturating_add(now, backoff));
    }

    next.min(ceiling)
}

/// Extract `max-age=N` from a `Cache-Control` header value.
///
/// Directive names are case-insensitive. Missing, malformed or non-positive
/// values yield `None`.
pub fn parse_max_age(cache_control: &str) -> Option<i64> {
    cache_control.split(',').find_map(|directive| {
        let (name, value) = directive.trim().split_once('=')?;
        if !name.trim().eq_ignore_ascii_case("max-age") {
            return None;
        }
        let seconds: i64 = value.trim().trim_matches('"').parse().ok()?;
        (seconds > 0).then_some(seconds)
    })
}
