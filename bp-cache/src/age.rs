//! Cache expiry calculation (spec §4.H), grounded on `http_cache_age.cxx`:
//! the age a cached response is allowed to live is the smaller of its
//! `Expires` header and a `Vary`-sensitivity-dependent upper limit, so a
//! response that varies on a per-user cookie never sits in cache for a
//! full week just because the origin sent a generous `Expires`.

use std::time::{Duration, Instant, SystemTime};

const HOUR: Duration = Duration::from_secs(3600);
const WEEK: Duration = Duration::from_secs(7 * 24 * 3600);

/// Upper bound on cache lifetime given the response's `Vary` header names.
fn age_limit(vary: &[String]) -> Duration {
    if vary.is_empty() {
        return WEEK;
    }
    let has = |name: &str| vary.iter().any(|v| v.eq_ignore_ascii_case(name));
    if has("x-cm4all-beng-user") || has("cookie") || has("cookie2") {
        Duration::from_secs(5 * 60)
    } else if has("x-widgetid") || has("x-widgethref") {
        Duration::from_secs(30 * 60)
    } else {
        HOUR
    }
}

/// Computes the steady-clock deadline a cache entry should expire at, or
/// `None` if the response is already expired and must not be cached.
pub fn calc_expires(
    steady_now: Instant,
    system_now: SystemTime,
    expires: Option<SystemTime>,
    vary: &[String],
) -> Option<Instant> {
    let max_age = match expires {
        None => HOUR,
        Some(expires) => {
            if expires <= system_now {
                return None;
            }
            expires.duration_since(system_now).unwrap_or(Duration::ZERO)
        }
    };
    let limit = age_limit(vary);
    let max_age = max_age.min(limit);
    Some(steady_now + max_age)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_no_expires_header_defaults_to_one_hour() {
        let now = Instant::now();
        let sys_now = SystemTime::now();
        let expiry = calc_expires(now, sys_now, None, &[]).unwrap();
        assert_eq!(expiry.duration_since(now), HOUR);
    }

    #[test]
    fn test_already_expired_returns_none() {
        let now = Instant::now();
        let sys_now = SystemTime::now();
        let expires = sys_now - Duration::from_secs(10);
        assert!(calc_expires(now, sys_now, Some(expires), &[]).is_none());
    }

    #[test]
    fn test_vary_on_cookie_caps_at_five_minutes() {
        let now = Instant::now();
        let sys_now = SystemTime::now();
        let expires = sys_now + WEEK;
        let vary = vec!["Cookie".to_string()];
        let expiry = calc_expires(now, sys_now, Some(expires), &vary).unwrap();
        assert_eq!(expiry.duration_since(now), Duration::from_secs(5 * 60));
    }

    #[test]
    fn test_vary_on_widget_caps_at_thirty_minutes() {
        let now = Instant::now();
        let sys_now = SystemTime::now();
        let expires = sys_now + WEEK;
        let vary = vec!["X-WidgetId".to_string()];
        let expiry = calc_expires(now, sys_now, Some(expires), &vary).unwrap();
        assert_eq!(expiry.duration_since(now), Duration::from_secs(30 * 60));
    }

    #[test]
    fn test_expires_shorter_than_limit_is_respected() {
        let now = Instant::now();
        let sys_now = SystemTime::now();
        let expires = sys_now + Duration::from_secs(60);
        let expiry = calc_expires(now, sys_now, Some(expires), &[]).unwrap();
        assert_eq!(expiry.duration_since(now), Duration::from_secs(60));
    }
}
