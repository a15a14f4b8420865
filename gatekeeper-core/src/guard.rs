//! Per-remote abuse counters and the temporary blocklist
//!
//! Two maps keyed by the remote address string: one timestamp set when a
//! connection exhausts its login attempts, and one (count, timestamp) pair
//! incremented on protocol errors, login timeouts, and I/O failures.
//! Entries expire lazily; there is no background sweeper.

use parking_lot::Mutex;
use std::collections::HashMap;
use std::time::{Duration, Instant};
use tracing::warn;

/// Floor for the failed-login limit
pub const MIN_LOGIN_ERROR_LIMIT: u32 = 3;

/// Blocking windows below one minute are invalid and replaced by the default
pub const MIN_BLOCKING_TIME: Duration = Duration::from_secs(60);

/// Default blocking window
pub const DEFAULT_BLOCKING_TIME: Duration = Duration::from_secs(600);

/// Socket errors block a remote only once the count passes this threshold
const SOCKET_ERROR_THRESHOLD: u32 = 3;

#[derive(Debug, Default)]
struct GuardInner {
    login_errors: HashMap<String, Instant>,
    socket_errors: HashMap<String, (u32, Instant)>,
}

/// Tracks offending remotes and answers the accept-time block decision
#[derive(Debug)]
pub struct AbuseGuard {
    inner: Mutex<GuardInner>,
    login_error_limit: u32,
    blocking_time: Duration,
}

impl AbuseGuard {
    /// Create a guard, normalizing out-of-range limits
    pub fn new(login_error_limit: u32, blocking_time: Duration) -> Self {
        let login_error_limit = if login_error_limit < MIN_LOGIN_ERROR_LIMIT {
            warn!(
                requested = login_error_limit,
                normalized = MIN_LOGIN_ERROR_LIMIT,
                "login_error_limit below floor, raising"
            );
            MIN_LOGIN_ERROR_LIMIT
        } else {
            login_error_limit
        };
        let blocking_time = if blocking_time < MIN_BLOCKING_TIME {
            warn!(
                requested_secs = blocking_time.as_secs(),
                normalized_secs = DEFAULT_BLOCKING_TIME.as_secs(),
                "blocking_time below one minute, using default"
            );
            DEFAULT_BLOCKING_TIME
        } else {
            blocking_time
        };
        Self {
            inner: Mutex::new(GuardInner::default()),
            login_error_limit,
            blocking_time,
        }
    }

    /// The normalized failed-login limit
    pub fn login_error_limit(&self) -> u32 {
        self.login_error_limit
    }

    /// The normalized blocking window
    pub fn blocking_time(&self) -> Duration {
        self.blocking_time
    }

    /// Record that a remote exhausted its login attempts
    pub fn record_login_errors(&self, addr: &str) {
        self.inner
            .lock()
            .login_errors
            .insert(addr.to_string(), Instant::now());
    }

    /// Record one socket error (protocol error, login timeout, I/O failure)
    pub fn record_socket_error(&self, addr: &str) {
        let mut inner = self.inner.lock();
        let entry = inner
            .socket_errors
            .entry(addr.to_string())
            .or_insert((0, Instant::now()));
        entry.0 += 1;
        entry.1 = Instant::now();
    }

    /// Current socket-error count for a remote
    pub fn socket_error_count(&self, addr: &str) -> u32 {
        self.inner
            .lock()
            .socket_errors
            .get(addr)
            .map(|(count, _)| *count)
            .unwrap_or(0)
    }

    /// Whether a remote is currently blocked.
    ///
    /// Login-error timestamps block within the window outright; socket
    /// errors block only once the count passes the threshold. Expired
    /// entries are reclaimed here.
    pub fn is_blocked(&self, addr: &str) -> bool {
        let now = Instant::now();
        let mut inner = self.inner.lock();

        let mut blocked = false;
        if let Some(ts) = inner.login_errors.get(addr) {
            if now.duration_since(*ts) < self.blocking_time {
                blocked = true;
            } else {
                inner.login_errors.remove(addr);
            }
        }

        if let Some((count, ts)) = inner.socket_errors.get(addr) {
            if now.duration_since(*ts) < self.blocking_time {
                if *count > SOCKET_ERROR_THRESHOLD {
                    blocked = true;
                }
            } else {
                inner.socket_errors.remove(addr);
            }
        }

        blocked
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_limit_normalization() {
        let guard = AbuseGuard::new(2, Duration::from_secs(30));
        assert_eq!(guard.login_error_limit(), 3);
        assert_eq!(guard.blocking_time(), Duration::from_secs(600));

        let guard = AbuseGuard::new(5, Duration::from_secs(120));
        assert_eq!(guard.login_error_limit(), 5);
        assert_eq!(guard.blocking_time(), Duration::from_secs(120));
    }

    #[test]
    fn test_login_errors_block_immediately() {
        let guard = AbuseGuard::new(3, Duration::from_secs(600));
        assert!(!guard.is_blocked("10.0.0.1"));
        guard.record_login_errors("10.0.0.1");
        assert!(guard.is_blocked("10.0.0.1"));
        assert!(!guard.is_blocked("10.0.0.2"));
    }

    #[test]
    fn test_socket_errors_block_past_threshold() {
        let guard = AbuseGuard::new(3, Duration::from_secs(600));
        for _ in 0..3 {
            guard.record_socket_error("10.0.0.1");
        }
        // count == 3 is not yet past the threshold
        assert!(!guard.is_blocked("10.0.0.1"));
        guard.record_socket_error("10.0.0.1");
        assert_eq!(guard.socket_error_count("10.0.0.1"), 4);
        assert!(guard.is_blocked("10.0.0.1"));
    }

    #[test]
    fn test_expired_entries_are_reclaimed_lazily() {
        // A one-minute window with timestamps forced into the past
        let guard = AbuseGuard::new(3, Duration::from_secs(60));
        {
            let mut inner = guard.inner.lock();
            inner.login_errors.insert(
                "10.0.0.1".to_string(),
                Instant::now() - Duration::from_secs(61),
            );
            inner.socket_errors.insert(
                "10.0.0.2".to_string(),
                (10, Instant::now() - Duration::from_secs(61)),
            );
        }
        assert!(!guard.is_blocked("10.0.0.1"));
        assert!(!guard.is_blocked("10.0.0.2"));
        let inner = guard.inner.lock();
        assert!(inner.login_errors.is_empty());
        assert!(inner.socket_errors.is_empty());
    }
}
