use std::sync::{Mutex, PoisonError};
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use reqwest::header::{HeaderMap, RETRY_AFTER};
use serde::Serialize;

/// Reset values above this are absolute Unix timestamps; at or below it they
/// are seconds from now.
const ABSOLUTE_RESET_THRESHOLD: i64 = 1_000_000_000;

const LIMIT: &str = "RateLimit-Limit";
const REMAINING: &str = "RateLimit-Remaining";
const RESET: &str = "RateLimit-Reset";

/// Last observed rate-limit headers.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize)]
pub struct RateLimitSnapshot {
    pub limit: Option<u64>,
    pub remaining: Option<u64>,
    /// Reset time when the raw value parsed as seconds or an HTTP date.
    pub reset: Option<SystemTime>,
    /// The reset header exactly as received.
    pub reset_raw: Option<String>,
}

impl RateLimitSnapshot {
    /// Time from `now` until the reset, zero if it already passed.
    pub fn reset_in(&self, now: SystemTime) -> Option<Duration> {
        self.reset
            .map(|reset| reset.duration_since(now).unwrap_or(Duration::ZERO))
    }

    /// Parses limit / remaining / reset headers, preferring the
    /// `{prefix}RateLimit-*` names over the generic ones per field.
    ///
    /// Returns `None` when none of the headers is present. Malformed values
    /// are left unset.
    pub fn from_headers(headers: &HeaderMap, prefix: &str, now: SystemTime) -> Option<Self> {
        let limit = first_header(headers, prefix, LIMIT);
        let remaining = first_header(headers, prefix, REMAINING);
        let reset = first_header(headers, prefix, RESET);

        if limit.is_none() && remaining.is_none() && reset.is_none() {
            return None;
        }

        Some(Self {
            limit: limit.and_then(|value| value.parse().ok()),
            remaining: remaining.and_then(|value| value.parse().ok()),
            reset: reset.and_then(|value| parse_reset(value, now)),
            reset_raw: reset.map(str::to_owned),
        })
    }
}

fn first_header<'a>(headers: &'a HeaderMap, prefix: &str, name: &str) -> Option<&'a str> {
    let vendor = format!("{prefix}{name}");
    let found = [vendor.as_str(), name]
        .into_iter()
        .find_map(|candidate| headers.get(candidate)?.to_str().ok());
    found.map(str::trim)
}

fn parse_reset(raw: &str, now: SystemTime) -> Option<SystemTime> {
    if let Ok(seconds) = raw.parse::<i64>() {
        if seconds > ABSOLUTE_RESET_THRESHOLD {
            return UNIX_EPOCH.checked_add(Duration::from_secs(seconds.unsigned_abs()));
        }
        let offset = Duration::from_secs(seconds.unsigned_abs());
        return if seconds >= 0 {
            now.checked_add(offset)
        } else {
            now.checked_sub(offset)
        };
    }
    httpdate::parse_http_date(raw).ok()
}

/// Parses `Retry-After` as integer seconds (negative clamps to zero) or an
/// HTTP date (a past date yields zero).
pub fn retry_after(headers: &HeaderMap) -> Option<Duration> {
    retry_after_at(headers, SystemTime::now())
}

pub(crate) fn retry_after_at(headers: &HeaderMap, now: SystemTime) -> Option<Duration> {
    let value = headers.get(RETRY_AFTER)?.to_str().ok()?.trim();
    retry_after_value(value, now)
}

fn retry_after_value(value: &str, now: SystemTime) -> Option<Duration> {
    if let Ok(seconds) = value.parse::<i64>() {
        return Some(Duration::from_secs(seconds.max(0).unsigned_abs()));
    }
    let at = httpdate::parse_http_date(value).ok()?;
    Some(at.duration_since(now).unwrap_or(Duration::ZERO))
}

/// Holds the newest [`RateLimitSnapshot`] for one client.
#[derive(Debug)]
pub struct RateLimitTracker {
    prefix: String,
    last: Mutex<Option<RateLimitSnapshot>>,
}

impl RateLimitTracker {
    pub fn new(prefix: impl Into<String>) -> Self {
        Self {
            prefix: prefix.into(),
            last: Mutex::new(None),
        }
    }

    /// Replaces the snapshot if `headers` carry any rate-limit header.
    pub fn observe(&self, headers: &HeaderMap) {
        if let Some(snapshot) = RateLimitSnapshot::from_headers(headers, &self.prefix, SystemTime::now())
        {
            *self.last.lock().unwrap_or_else(PoisonError::into_inner) = Some(snapshot);
        }
    }

    /// A copy of the newest snapshot.
    pub fn snapshot(&self) -> Option<RateLimitSnapshot> {
        self.last
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// Overwrites the snapshot.
    pub fn set(&self, snapshot: Option<RateLimitSnapshot>) {
        *self.last.lock().unwrap_or_else(PoisonError::into_inner) = snapshot;
    }

    /// Wait hinted by a response: `Retry-After` first, then the time to the
    /// rate-limit reset when the remaining quota is exhausted.
    pub(crate) fn hinted_delay(&self, headers: &HeaderMap) -> Option<Duration> {
        let now = SystemTime::now();
        if let Some(delay) = retry_after_at(headers, now) {
            return Some(delay);
        }
        let snapshot = RateLimitSnapshot::from_headers(headers, &self.prefix, now)?;
        if snapshot.remaining == Some(0) {
            return snapshot.reset_in(now);
        }
        None
    }
}
