//! Connect-side retry with capped exponential backoff.
//!
//! A deployed flow starts all of its runtimes at once; a connect side may
//! race its bind side. The retry policy absorbs that race without a
//! discovery service.

use std::net::SocketAddr;
use std::time::Duration;

use tokio::net::TcpStream;
use tracing::debug;

use super::TransportError;

/// Connect retry policy: exponential backoff with a cap.
#[derive(Debug, Clone)]
pub struct ConnectRetry {
    /// Maximum connection attempts, counting the first.
    pub max_attempts: usize,
    /// Delay before the second attempt.
    pub initial_backoff: Duration,
    /// Ceiling on the delay between attempts.
    pub max_backoff: Duration,
}

impl Default for ConnectRetry {
    fn default() -> Self {
        Self {
            max_attempts: 20,
            initial_backoff: Duration::from_millis(50),
            max_backoff: Duration::from_secs(2),
        }
    }
}

impl ConnectRetry {
    /// Delay to sleep before the given 1-based attempt number.
    #[must_use]
    pub fn delay_for_attempt(&self, attempt: usize) -> Duration {
        if attempt <= 1 {
            return Duration::ZERO;
        }
        let exp = u32::try_from(attempt - 2).unwrap_or(u32::MAX).min(16);
        let backoff = self
            .initial_backoff
            .saturating_mul(2u32.saturating_pow(exp));
        backoff.min(self.max_backoff)
    }
}

/// Connects to `addr`, retrying per the policy.
///
/// # Errors
///
/// Returns [`TransportError::Connect`] carrying the last io error once the
/// attempt budget is spent.
pub(crate) async fn connect_with_retry(
    addr: SocketAddr,
    retry: &ConnectRetry,
) -> Result<TcpStream, TransportError> {
    let attempts = retry.max_attempts.max(1);
    let mut last_err = None;
    for attempt in 1..=attempts {
        let delay = retry.delay_for_attempt(attempt);
        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }
        match TcpStream::connect(addr).await {
            Ok(stream) => {
                stream.set_nodelay(true)?;
                return Ok(stream);
            }
            Err(err) => {
                debug!(%addr, attempt, error = %err, "connect attempt failed");
                last_err = Some(err);
            }
        }
    }
    Err(TransportError::Connect {
        addr,
        attempts,
        source: last_err
            .unwrap_or_else(|| std::io::Error::new(std::io::ErrorKind::Other, "no attempts made")),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_first_attempt_has_no_delay() {
        let retry = ConnectRetry::default();
        assert_eq!(retry.delay_for_attempt(1), Duration::ZERO);
    }

    #[test]
    fn test_backoff_doubles_then_caps() {
        let retry = ConnectRetry {
            max_attempts: 10,
            initial_backoff: Duration::from_millis(100),
            max_backoff: Duration::from_millis(500),
        };
        assert_eq!(retry.delay_for_attempt(2), Duration::from_millis(100));
        assert_eq!(retry.delay_for_attempt(3), Duration::from_millis(200));
        assert_eq!(retry.delay_for_attempt(4), Duration::from_millis(400));
        assert_eq!(retry.delay_for_attempt(5), Duration::from_millis(500));
        assert_eq!(retry.delay_for_attempt(9), Duration::from_millis(500));
    }

    #[tokio::test]
    async fn test_connect_fails_after_budget() {
        // A port nothing listens on; keep the budget tiny.
        let retry = ConnectRetry {
            max_attempts: 2,
            initial_backoff: Duration::from_millis(1),
            max_backoff: Duration::from_millis(1),
        };
        let addr: SocketAddr = "127.0.0.1:1".parse().unwrap();
        let err = connect_with_retry(addr, &retry).await.unwrap_err();
        assert!(matches!(
            err,
            TransportError::Connect { attempts: 2, .. }
        ));
    }
}
