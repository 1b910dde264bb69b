use crate::types::Credential;
use chrono::{DateTime, TimeDelta, Utc};
use std::time::Duration;

fn delta(d: Duration) -> TimeDelta {
    TimeDelta::from_std(d).unwrap_or(TimeDelta::MAX)
}

pub(crate) fn inactivity_exceeded(
    credential: &Credential,
    now: DateTime<Utc>,
    inactivity_window: Duration,
) -> bool {
    now.signed_duration_since(credential.last_activity_at) > delta(inactivity_window)
}

/// A token is unusable once it is inside the safety margin of its expiry or
/// the inactivity window has elapsed, whichever comes first.
pub(crate) fn is_token_expired(
    credential: &Credential,
    now: DateTime<Utc>,
    safety_margin: Duration,
    inactivity_window: Duration,
) -> bool {
    let usable_until = credential
        .expires_at
        .checked_sub_signed(delta(safety_margin))
        .unwrap_or(DateTime::<Utc>::MIN_UTC);
    now > usable_until || inactivity_exceeded(credential, now, inactivity_window)
}

/// An idle session cannot be revived by a refresh; only token expiry can.
pub(crate) fn refresh_token_usable(
    credential: &Credential,
    now: DateTime<Utc>,
    inactivity_window: Duration,
) -> bool {
    if credential.refresh_token.trim().is_empty() {
        return false;
    }
    if inactivity_exceeded(credential, now, inactivity_window) {
        return false;
    }
    credential.refresh_expires_at.map_or(true, |at| now < at)
}

pub(crate) fn refresh_retry_delay(base: Duration, attempt: u32) -> Duration {
    base.saturating_mul(1_u32 << attempt.min(8))
}

pub(crate) fn is_valid_identifier(identifier: &str) -> bool {
    let identifier = identifier.trim();
    if let Some(digits) = identifier.strip_prefix('+') {
        return (8..=15).contains(&digits.len()) && digits.bytes().all(|b| b.is_ascii_digit());
    }

    let Some((local, domain)) = identifier.split_once('@') else {
        return false;
    };
    !local.is_empty()
        && !domain.contains('@')
        && domain.contains('.')
        && !domain.starts_with('.')
        && !domain.ends_with('.')
        && !identifier.chars().any(char::is_whitespace)
}
