use std::future::Future;
use std::time::Duration;
use tokio::time::sleep;
use tracing::{debug, warn};

use super::{AuthFailure, PanelError};

/// Retry rules applied uniformly to every panel call.
///
/// * connection errors and refused logins consume attempts, with exponential
///   backoff between them;
/// * a session refused mid-request gets exactly one re-authentication cycle,
///   which does not consume an attempt;
/// * application errors are returned immediately.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub base_delay: Duration,
    pub max_delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            base_delay: Duration::from_millis(500),
            max_delay: Duration::from_secs(5),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryStep {
    Backoff(Duration),
    Reauthenticate,
    GiveUp,
}

impl RetryPolicy {
    pub fn backoff(&self, attempt: u32) -> Duration {
        let factor = 2u32.saturating_pow(attempt.saturating_sub(1));
        self.base_delay.saturating_mul(factor).min(self.max_delay)
    }

    /// Decides what follows a failed `attempt` (1-based).
    pub fn next_step(&self, err: &PanelError, attempt: u32, reauthenticated: bool) -> RetryStep {
        match err {
            PanelError::Application(_) => RetryStep::GiveUp,
            PanelError::Auth {
                kind: AuthFailure::SessionRejected,
                ..
            } => {
                if reauthenticated {
                    RetryStep::GiveUp
                } else {
                    RetryStep::Reauthenticate
                }
            }
            PanelError::Connection(_)
            | PanelError::Auth {
                kind: AuthFailure::LoginRejected,
                ..
            } => {
                if attempt < self.max_attempts {
                    RetryStep::Backoff(self.backoff(attempt))
                } else {
                    RetryStep::GiveUp
                }
            }
        }
    }

    /// Runs `op` until it succeeds or the policy gives up.
    ///
    /// `op` is responsible for dropping its session when it reports
    /// [`AuthFailure::SessionRejected`], so the next call logs in again.
    pub async fn run<T, F, Fut>(&self, operation: &str, mut op: F) -> Result<T, PanelError>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, PanelError>>,
    {
        let mut attempt = 1;
        let mut reauthenticated = false;
        loop {
            let err = match op().await {
                Ok(value) => return Ok(value),
                Err(err) => err,
            };
            match self.next_step(&err, attempt, reauthenticated) {
                RetryStep::GiveUp => {
                    warn!(operation, attempt, error = %err, "Panel call failed, giving up.");
                    return Err(err);
                }
                RetryStep::Reauthenticate => {
                    debug!(operation, "Panel session rejected, re-authenticating once.");
                    reauthenticated = true;
                }
                RetryStep::Backoff(delay) => {
                    debug!(
                        operation,
                        attempt,
                        delay_ms = delay.as_millis() as u64,
                        error = %err,
                        "Panel call failed, retrying."
                    );
                    attempt += 1;
                    sleep(delay).await;
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    fn fast_policy() -> RetryPolicy {
        RetryPolicy {
            max_attempts: 3,
            base_delay: Duration::from_millis(1),
            max_delay: Duration::from_millis(4),
        }
    }

    #[test]
    fn backoff_doubles_and_caps() {
        let policy = RetryPolicy {
            max_attempts: 5,
            base_delay: Duration::from_millis(100),
            max_delay: Duration::from_millis(300),
        };
        assert_eq!(policy.backoff(1), Duration::from_millis(100));
        assert_eq!(policy.backoff(2), Duration::from_millis(200));
        assert_eq!(policy.backoff(3), Duration::from_millis(300));
        assert_eq!(policy.backoff(10), Duration::from_millis(300));
    }

    #[test]
    fn application_errors_are_never_retried() {
        let step = fast_policy().next_step(&PanelError::Application("duplicate".into()), 1, false);
        assert_eq!(step, RetryStep::GiveUp);
    }

    #[test]
    fn session_rejection_reauthenticates_once() {
        let policy = fast_policy();
        let err = PanelError::session_rejected("expired");
        assert_eq!(policy.next_step(&err, 1, false), RetryStep::Reauthenticate);
        assert_eq!(policy.next_step(&err, 1, true), RetryStep::GiveUp);
    }

    #[test]
    fn connection_errors_stop_at_max_attempts() {
        let policy = fast_policy();
        let err = PanelError::Connection("timeout".into());
        assert!(matches!(policy.next_step(&err, 2, false), RetryStep::Backoff(_)));
        assert_eq!(policy.next_step(&err, 3, false), RetryStep::GiveUp);
    }

    #[tokio::test]
    async fn run_succeeds_after_transient_failures() {
        let calls = AtomicU32::new(0);
        let counter = &calls;
        let result = fast_policy()
            .run("test", || async move {
                if counter.fetch_add(1, Ordering::SeqCst) < 2 {
                    Err(PanelError::Connection("refused".into()))
                } else {
                    Ok(42)
                }
            })
            .await;

        assert_eq!(result, Ok(42));
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn run_gives_up_after_three_login_rejections() {
        let calls = AtomicU32::new(0);
        let counter = &calls;
        let result: Result<(), _> = fast_policy()
            .run("test", || async move {
                counter.fetch_add(1, Ordering::SeqCst);
                Err(PanelError::login_rejected("wrong password"))
            })
            .await;

        assert!(matches!(result, Err(PanelError::Auth { .. })));
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn reauthentication_does_not_consume_an_attempt() {
        let calls = AtomicU32::new(0);
        let counter = &calls;
        let result = fast_policy()
            .run("test", || async move {
                match counter.fetch_add(1, Ordering::SeqCst) {
                    0 => Err(PanelError::session_rejected("expired")),
                    1 | 2 => Err(PanelError::Connection("reset".into())),
                    _ => Ok("done"),
                }
            })
            .await;

        assert_eq!(result, Ok("done"));
        assert_eq!(calls.load(Ordering::SeqCst), 4);
    }
}
