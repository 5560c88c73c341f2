//! Anti-abuse gate for unauthenticated checkout: sliding windows per IP and
//! per email plus a minimum interval per email, all decided under one mutex
//! so gate decisions are linearizable.

use chrono::{DateTime, Duration, Utc};
use parking_lot::Mutex;
use std::collections::{HashMap, VecDeque};

use crate::error::{Error, Result};

const IP_WINDOW_MINUTES: i64 = 5;
const IP_MAX_REQUESTS: usize = 20;
const EMAIL_WINDOW_MINUTES: i64 = 10;
const EMAIL_MAX_REQUESTS: usize = 6;
const EMAIL_MIN_INTERVAL_SECONDS: i64 = 20;

#[derive(Default)]
struct LimiterState {
    ip_hits: HashMap<String, VecDeque<DateTime<Utc>>>,
    email_hits: HashMap<String, VecDeque<DateTime<Utc>>>,
    last_email_hit: HashMap<String, DateTime<Utc>>,
}

fn prune(queue: &mut VecDeque<DateTime<Utc>>, now: DateTime<Utc>, window: Duration) {
    let cutoff = now - window;
    while queue.front().is_some_and(|hit| *hit < cutoff) {
        queue.pop_front();
    }
}

#[derive(Default)]
pub struct GuestCheckoutLimiter {
    state: Mutex<LimiterState>,
}

impl GuestCheckoutLimiter {
    pub fn new() -> Self {
        Self::default()
    }

    /// Gate a guest-checkout attempt. On acceptance the hit is recorded
    /// before the mutex is released.
    pub fn check(
        &self,
        client_ip: &str,
        email: &str,
        website_honeypot: Option<&str>,
        now: DateTime<Utc>,
    ) -> Result<()> {
        if website_honeypot.is_some_and(|v| !v.trim().is_empty()) {
            return Err(Error::validation("invalid request"));
        }

        let ip = {
            let trimmed = client_ip.trim();
            if trimmed.is_empty() { "unknown" } else { trimmed }.to_string()
        };
        let email = email.trim().to_lowercase();

        let mut state = self.state.lock();

        {
            let ip_queue = state.ip_hits.entry(ip.clone()).or_default();
            prune(ip_queue, now, Duration::minutes(IP_WINDOW_MINUTES));
            if ip_queue.len() >= IP_MAX_REQUESTS {
                return Err(Error::RateLimited(
                    "too many checkout attempts from this ip".to_string(),
                ));
            }
        }

        {
            let email_queue = state.email_hits.entry(email.clone()).or_default();
            prune(email_queue, now, Duration::minutes(EMAIL_WINDOW_MINUTES));
            if email_queue.len() >= EMAIL_MAX_REQUESTS {
                return Err(Error::RateLimited(
                    "too many checkout attempts for this email".to_string(),
                ));
            }
        }

        if let Some(last_hit) = state.last_email_hit.get(&email) {
            if (now - *last_hit).num_seconds() < EMAIL_MIN_INTERVAL_SECONDS {
                return Err(Error::RateLimited(
                    "please wait before retrying checkout".to_string(),
                ));
            }
        }

        state.ip_hits.entry(ip).or_default().push_back(now);
        state.email_hits.entry(email.clone()).or_default().push_back(now);
        state.last_email_hit.insert(email, now);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn accept(limiter: &GuestCheckoutLimiter, ip: &str, email: &str, now: DateTime<Utc>) -> bool {
        limiter.check(ip, email, None, now).is_ok()
    }

    #[test]
    fn test_honeypot_rejected() {
        let limiter = GuestCheckoutLimiter::new();
        let now = Utc::now();
        let err = limiter
            .check("1.1.1.1", "a@example.com", Some("filled"), now)
            .unwrap_err();
        assert!(matches!(err, Error::Validation(_)));
        // Blank honeypot passes.
        assert!(limiter.check("1.1.1.1", "a@example.com", Some("  "), now).is_ok());
    }

    #[test]
    fn test_ip_window_limit() {
        let limiter = GuestCheckoutLimiter::new();
        let now = Utc::now();
        for i in 0..IP_MAX_REQUESTS {
            // Distinct emails spaced past the per-email interval.
            let email = format!("user{i}@example.com");
            assert!(accept(&limiter, "9.9.9.9", &email, now));
        }
        let err = limiter
            .check("9.9.9.9", "extra@example.com", None, now)
            .unwrap_err();
        assert!(matches!(err, Error::RateLimited(_)));

        // Other IPs are unaffected.
        assert!(accept(&limiter, "8.8.8.8", "other@example.com", now));
    }

    #[test]
    fn test_ip_window_slides() {
        let limiter = GuestCheckoutLimiter::new();
        let start = Utc::now();
        for i in 0..IP_MAX_REQUESTS {
            let email = format!("user{i}@example.com");
            assert!(accept(&limiter, "9.9.9.9", &email, start));
        }
        let later = start + Duration::minutes(IP_WINDOW_MINUTES) + Duration::seconds(1);
        assert!(accept(&limiter, "9.9.9.9", "late@example.com", later));
    }

    #[test]
    fn test_email_window_limit() {
        let limiter = GuestCheckoutLimiter::new();
        let mut now = Utc::now();
        for i in 0..EMAIL_MAX_REQUESTS {
            // Distinct IPs, spaced past the min interval.
            let ip = format!("10.0.0.{i}");
            assert!(accept(&limiter, &ip, "Same@Example.com", now));
            now += Duration::seconds(EMAIL_MIN_INTERVAL_SECONDS + 1);
        }
        let err = limiter
            .check("10.0.1.1", "same@example.com", None, now)
            .unwrap_err();
        assert!(matches!(err, Error::RateLimited(_)));
    }

    #[test]
    fn test_email_min_interval() {
        let limiter = GuestCheckoutLimiter::new();
        let now = Utc::now();
        assert!(accept(&limiter, "1.1.1.1", "a@example.com", now));

        let too_soon = now + Duration::seconds(EMAIL_MIN_INTERVAL_SECONDS - 1);
        let err = limiter
            .check("2.2.2.2", "a@example.com", None, too_soon)
            .unwrap_err();
        assert!(matches!(err, Error::RateLimited(_)));

        let late_enough = now + Duration::seconds(EMAIL_MIN_INTERVAL_SECONDS);
        assert!(accept(&limiter, "2.2.2.2", "a@example.com", late_enough));
    }

    #[test]
    fn test_rejected_attempts_are_not_recorded() {
        let limiter = GuestCheckoutLimiter::new();
        let now = Utc::now();
        assert!(accept(&limiter, "1.1.1.1", "a@example.com", now));
        // Denied by min interval; must not consume the email window.
        for _ in 0..10 {
            assert!(limiter.check("1.1.1.1", "a@example.com", None, now).is_err());
        }
        let later = now + Duration::seconds(EMAIL_MIN_INTERVAL_SECONDS);
        assert!(accept(&limiter, "1.1.1.1", "a@example.com", later));
    }
}
