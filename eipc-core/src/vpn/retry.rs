//! Restart policy for tunnel terminations
//!
//! Decides, from a structured termination outcome and the run of
//! consecutive failures, whether to restart the tunnel after a delay,
//! give up, or do nothing. Prerequisite failures are never retried;
//! transient ones are, up to a cap, so a broken gateway cannot put the
//! client into a restart storm.

use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::vpn::supervisor::TerminationOutcome;

/// What the state machine should do after a termination
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RestartDirective {
    /// Leave the tunnel down
    NoRestart,
    /// Schedule a reconnect attempt after the delay
    RestartAfterDelay(Duration),
    /// Give up; operator attention is needed
    Abort,
}

/// Configuration for automatic restart behavior
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RetryPolicy {
    /// Delay before an automatic restart, in milliseconds
    #[serde(default = "default_restart_delay_ms")]
    pub restart_delay_ms: u64,

    /// Consecutive failures tolerated before giving up
    #[serde(default = "default_max_consecutive_failures")]
    pub max_consecutive_failures: u32,
}

fn default_restart_delay_ms() -> u64 {
    2000
}

fn default_max_consecutive_failures() -> u32 {
    3
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            restart_delay_ms: default_restart_delay_ms(),
            max_consecutive_failures: default_max_consecutive_failures(),
        }
    }
}

impl RetryPolicy {
    /// Validate the policy fields against their accepted ranges
    pub fn validate(&self) -> Result<(), PolicyValidationError> {
        if self.restart_delay_ms < 100 || self.restart_delay_ms > 60_000 {
            return Err(PolicyValidationError::InvalidRestartDelay(
                self.restart_delay_ms,
            ));
        }
        if self.max_consecutive_failures < 1 || self.max_consecutive_failures > 10 {
            return Err(PolicyValidationError::InvalidFailureCap(
                self.max_consecutive_failures,
            ));
        }
        Ok(())
    }

    pub fn restart_delay(&self) -> Duration {
        Duration::from_millis(self.restart_delay_ms)
    }

    /// Decide the next action for a termination
    ///
    /// `consecutive_failures` counts the failure being decided, so with
    /// the default cap of 3 the fourth consecutive failure aborts.
    pub fn decide(
        &self,
        outcome: &TerminationOutcome,
        consecutive_failures: u32,
    ) -> RestartDirective {
        match outcome {
            TerminationOutcome::Clean => RestartDirective::NoRestart,

            // Operator-fixable conditions; retrying cannot help
            TerminationOutcome::AuthenticationDenied
            | TerminationOutcome::BinaryNotFound
            | TerminationOutcome::NoElevationTool
            | TerminationOutcome::NoElevationAgent
            | TerminationOutcome::KernelExtensionMissing
            | TerminationOutcome::AlreadyRunningForeign => RestartDirective::Abort,

            // A stale instance of ours gets stopped first, then we retry
            TerminationOutcome::AlreadyRunningOwn => {
                RestartDirective::RestartAfterDelay(self.restart_delay())
            }

            TerminationOutcome::NetworkUnreachable | TerminationOutcome::UnexpectedExit(_) => {
                if consecutive_failures > self.max_consecutive_failures {
                    RestartDirective::Abort
                } else {
                    RestartDirective::RestartAfterDelay(self.restart_delay())
                }
            }
        }
    }
}

/// Validation errors for [`RetryPolicy`]
#[derive(Debug, thiserror::Error)]
pub enum PolicyValidationError {
    #[error("restart_delay_ms must be between 100 and 60000, got: {0}")]
    InvalidRestartDelay(u64),

    #[error("max_consecutive_failures must be between 1 and 10, got: {0}")]
    InvalidFailureCap(u32),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let policy = RetryPolicy::default();
        assert_eq!(policy.restart_delay(), Duration::from_millis(2000));
        assert_eq!(policy.max_consecutive_failures, 3);
        assert!(policy.validate().is_ok());
    }

    #[test]
    fn test_hard_failures_abort() {
        let policy = RetryPolicy::default();
        for outcome in [
            TerminationOutcome::AuthenticationDenied,
            TerminationOutcome::BinaryNotFound,
            TerminationOutcome::NoElevationTool,
            TerminationOutcome::NoElevationAgent,
            TerminationOutcome::KernelExtensionMissing,
            TerminationOutcome::AlreadyRunningForeign,
        ] {
            assert_eq!(
                policy.decide(&outcome, 1),
                RestartDirective::Abort,
                "{} should abort",
                outcome
            );
        }
    }

    #[test]
    fn test_transient_failures_restart_until_cap() {
        let policy = RetryPolicy::default();
        let outcome = TerminationOutcome::UnexpectedExit(1);

        for failures in 1..=3 {
            assert_eq!(
                policy.decide(&outcome, failures),
                RestartDirective::RestartAfterDelay(Duration::from_millis(2000))
            );
        }
        // The fourth consecutive failure gives up
        assert_eq!(policy.decide(&outcome, 4), RestartDirective::Abort);
    }

    #[test]
    fn test_network_unreachable_is_transient() {
        let policy = RetryPolicy::default();
        assert_eq!(
            policy.decide(&TerminationOutcome::NetworkUnreachable, 1),
            RestartDirective::RestartAfterDelay(Duration::from_millis(2000))
        );
    }

    #[test]
    fn test_own_stale_instance_restarts() {
        let policy = RetryPolicy::default();
        assert_eq!(
            policy.decide(&TerminationOutcome::AlreadyRunningOwn, 1),
            RestartDirective::RestartAfterDelay(Duration::from_millis(2000))
        );
    }

    #[test]
    fn test_clean_exit_no_restart() {
        let policy = RetryPolicy::default();
        assert_eq!(
            policy.decide(&TerminationOutcome::Clean, 0),
            RestartDirective::NoRestart
        );
    }

    #[test]
    fn test_validation_ranges() {
        let mut policy = RetryPolicy::default();
        policy.restart_delay_ms = 50;
        assert!(policy.validate().is_err());

        let mut policy = RetryPolicy::default();
        policy.max_consecutive_failures = 0;
        assert!(policy.validate().is_err());

        let mut policy = RetryPolicy::default();
        policy.max_consecutive_failures = 11;
        assert!(policy.validate().is_err());
    }
}
