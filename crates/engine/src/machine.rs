//! Task state machine.
//!
//! ```text
//! pending ──claim──▶ in_flight ──▶ delivered
//!                       │   ▲  └──▶ failed_permanent
//!                       ▼   │claim
//!                 failed_retryable
//! ```
//!
//! `delivered` and `failed_permanent` are terminal.

use chrono::{DateTime, Utc};
use uuid::Uuid;

use herald_common::types::{Task, TaskStatus};

use crate::error::DeliveryError;
use crate::retry::RetryPolicy;

/// Result of one call to the message sender.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SendOutcome {
    Success,
    /// Network error, timeout, rate limit, 5xx: worth another attempt.
    RetryableFailure(String),
    /// Invalid destination, rejected payload: never worth another attempt.
    PermanentFailure(String),
}

/// The transition that closes an `in_flight` attempt.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Transition {
    Delivered,
    Retry {
        next_attempt_at: DateTime<Utc>,
        error: String,
    },
    Fail {
        error: String,
    },
}

impl Transition {
    pub fn target(&self) -> TaskStatus {
        match self {
            Transition::Delivered => TaskStatus::Delivered,
            Transition::Retry { .. } => TaskStatus::FailedRetryable,
            Transition::Fail { .. } => TaskStatus::FailedPermanent,
        }
    }

    /// Apply to an in-memory task. Fails without touching the task unless it
    /// is `in_flight`.
    pub fn apply(&self, task: &mut Task, now: DateTime<Utc>) -> Result<(), DeliveryError> {
        check_transition(task.id, task.status, self.target())?;

        match self {
            Transition::Delivered => {
                task.last_error = None;
                task.next_attempt_at = None;
            }
            Transition::Retry {
                next_attempt_at,
                error,
            } => {
                task.last_error = Some(error.clone());
                task.next_attempt_at = Some(*next_attempt_at);
            }
            Transition::Fail { error } => {
                task.last_error = Some(error.clone());
                task.next_attempt_at = None;
            }
        }
        task.status = self.target();
        task.updated_at = now;
        Ok(())
    }
}

/// The edge table. Anything not listed here is invalid.
pub fn can_transition(from: TaskStatus, to: TaskStatus) -> bool {
    use TaskStatus::*;

    matches!(
        (from, to),
        (Pending, InFlight)
            | (InFlight, Delivered)
            | (InFlight, FailedRetryable)
            | (InFlight, FailedPermanent)
            | (FailedRetryable, InFlight)
    )
}

pub fn check_transition(
    task_id: Uuid,
    from: TaskStatus,
    to: TaskStatus,
) -> Result<(), DeliveryError> {
    if can_transition(from, to) {
        Ok(())
    } else {
        Err(DeliveryError::InvalidTransition { task_id, from, to })
    }
}

/// Map a send outcome for the `attempt`-th try onto the closing transition.
pub fn decide(
    outcome: SendOutcome,
    attempt: i32,
    policy: &RetryPolicy,
    now: DateTime<Utc>,
) -> Transition {
    match outcome {
        SendOutcome::Success => Transition::Delivered,
        SendOutcome::PermanentFailure(error) => Transition::Fail { error },
        SendOutcome::RetryableFailure(error) if policy.should_retry(attempt) => Transition::Retry {
            next_attempt_at: policy.next_attempt_at(attempt, now),
            error,
        },
        SendOutcome::RetryableFailure(error) => Transition::Fail {
            error: format!(
                "retry budget exhausted after {} attempts: {}",
                attempt, error
            ),
        },
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use herald_common::types::NewTask;
    use rand::Rng;
    use std::time::Duration;

    fn policy(max_attempts: i32) -> RetryPolicy {
        RetryPolicy {
            base: Duration::from_secs(1),
            max_delay: Duration::from_secs(10),
            max_attempts,
            jitter_fraction: 0.0,
        }
    }

    fn in_flight_task(attempt: i32) -> Task {
        let mut task = Task::new(
            NewTask {
                destination: "42".to_string(),
                payload: "hi".to_string(),
                scheduled_at: None,
            },
            Utc::now(),
        );
        task.status = TaskStatus::InFlight;
        task.attempt_count = attempt;
        task
    }

    #[test]
    fn test_edge_table_is_exact() {
        use TaskStatus::*;
        let allowed = [
            (Pending, InFlight),
            (InFlight, Delivered),
            (InFlight, FailedRetryable),
            (InFlight, FailedPermanent),
            (FailedRetryable, InFlight),
        ];
        for from in TaskStatus::ALL {
            for to in TaskStatus::ALL {
                assert_eq!(
                    can_transition(from, to),
                    allowed.contains(&(from, to)),
                    "{} -> {}",
                    from,
                    to
                );
            }
        }
    }

    #[test]
    fn test_terminal_states_have_no_exits() {
        for from in TaskStatus::ALL.into_iter().filter(|s| s.is_terminal()) {
            for to in TaskStatus::ALL {
                assert!(!can_transition(from, to));
            }
        }
    }

    #[test]
    fn test_decide_success() {
        let t = decide(SendOutcome::Success, 1, &policy(3), Utc::now());
        assert_eq!(t, Transition::Delivered);
    }

    #[test]
    fn test_decide_permanent_never_retries() {
        let t = decide(
            SendOutcome::PermanentFailure("invalid destination".into()),
            1,
            &policy(3),
            Utc::now(),
        );
        assert_eq!(
            t,
            Transition::Fail {
                error: "invalid destination".into()
            }
        );
    }

    #[test]
    fn test_decide_retryable_within_budget() {
        let now = Utc::now();
        let t = decide(
            SendOutcome::RetryableFailure("timeout".into()),
            2,
            &policy(3),
            now,
        );
        assert_eq!(
            t,
            Transition::Retry {
                next_attempt_at: now + chrono::TimeDelta::seconds(2),
                error: "timeout".into(),
            }
        );
    }

    #[test]
    fn test_decide_retryable_exhausts_budget() {
        let t = decide(
            SendOutcome::RetryableFailure("timeout".into()),
            3,
            &policy(3),
            Utc::now(),
        );
        assert_eq!(t.target(), TaskStatus::FailedPermanent);
    }

    #[test]
    fn test_apply_delivered_clears_error() {
        let mut task = in_flight_task(2);
        task.last_error = Some("timeout".into());
        Transition::Delivered.apply(&mut task, Utc::now()).unwrap();
        assert_eq!(task.status, TaskStatus::Delivered);
        assert!(task.last_error.is_none());
    }

    #[test]
    fn test_apply_rejects_non_in_flight() {
        let mut task = in_flight_task(1);
        task.status = TaskStatus::Delivered;
        let before = task.clone();
        let err = Transition::Fail {
            error: "late".into(),
        }
        .apply(&mut task, Utc::now())
        .unwrap_err();
        assert!(matches!(err, DeliveryError::InvalidTransition { .. }));
        assert_eq!(task, before);
    }

    /// Drive random outcome sequences through claim + decide + apply and
    /// check every step lands on an edge of the table.
    #[test]
    fn test_random_walks_stay_on_table() {
        let mut rng = rand::rng();
        for _ in 0..500 {
            let p = policy(rng.random_range(1..=6));
            let mut task = in_flight_task(0);
            task.status = TaskStatus::Pending;
            let mut now = Utc::now();

            while !task.status.is_terminal() {
                // claim
                assert!(can_transition(task.status, TaskStatus::InFlight));
                let before = task.attempt_count;
                task.status = TaskStatus::InFlight;
                task.attempt_count += 1;
                assert_eq!(task.attempt_count, before + 1);

                let outcome = match rng.random_range(0..3) {
                    0 => SendOutcome::Success,
                    1 => SendOutcome::RetryableFailure("flaky".into()),
                    _ => SendOutcome::PermanentFailure("rejected".into()),
                };
                let transition = decide(outcome, task.attempt_count, &p, now);
                assert!(can_transition(TaskStatus::InFlight, transition.target()));
                transition.apply(&mut task, now).unwrap();
                assert!(task.attempt_count <= p.max_attempts);
                now = now + chrono::TimeDelta::seconds(60);
            }
        }
    }
}
