//! Missed-run and next-run computation.

use chrono::{DateTime, Duration, Utc};
use thiserror::Error;

use crate::cron::CronExpr;

/// Default bound on how many missed fires a single computation walks.
pub const DEFAULT_MISSED_RUN_CAP: usize = 100;

/// Errors from the schedule engine. Both are non-retryable.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ScheduleError {
    /// More fires were missed than the engine is willing to walk.
    #[error("too many missed start times (> {cap}); check clock skew or the schedule")]
    TooManyMissed { cap: usize },

    /// The expression never fires.
    #[error("schedule '{0}' has no upcoming fire time")]
    Unsatisfiable(String),
}

/// Engine policy knobs.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ScheduleConfig {
    pub missed_run_cap: usize,
}

impl Default for ScheduleConfig {
    fn default() -> Self {
        Self {
            missed_run_cap: DEFAULT_MISSED_RUN_CAP,
        }
    }
}

/// Result of one schedule computation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ScheduleDecision {
    /// The most recent fire in `(earliest, now]`, if any.
    pub missed: Option<DateTime<Utc>>,
    /// The first fire strictly after `now`.
    pub next: DateTime<Utc>,
}

impl ScheduleDecision {
    /// Time from `now` until `next`, never negative.
    pub fn wait_from(&self, now: DateTime<Utc>) -> std::time::Duration {
        (self.next - now).to_std().unwrap_or_default()
    }
}

impl ScheduleConfig {
    /// Computes the latest missed fire and the next fire.
    ///
    /// `last_scheduled` is the last launch time, or the owner's creation time
    /// when nothing was launched yet. With a `starting_deadline`, fires older
    /// than `now - starting_deadline` are not considered at all.
    ///
    /// Callers are expected to reject negative deadlines before calling.
    pub fn next_schedule(
        &self,
        expr: &CronExpr,
        last_scheduled: DateTime<Utc>,
        starting_deadline: Option<Duration>,
        now: DateTime<Utc>,
    ) -> Result<ScheduleDecision, ScheduleError> {
        let next_after_now = |expr: &CronExpr| {
            expr.next_after(now)
                .ok_or_else(|| ScheduleError::Unsatisfiable(expr.to_string()))
        };

        let mut earliest = last_scheduled;
        // Negative deadlines count as zero. A deadline reaching past the
        // start of chrono's range bounds nothing.
        let horizon = starting_deadline
            .and_then(|deadline| now.checked_sub_signed(deadline.max(Duration::zero())));
        if let Some(horizon) = horizon {
            if horizon > earliest {
                earliest = horizon;
            }
        }

        if earliest > now {
            return Ok(ScheduleDecision {
                missed: None,
                next: next_after_now(expr)?,
            });
        }

        let mut missed = None;
        let mut count = 0usize;
        let mut cursor = expr.next_after(earliest);
        while let Some(t) = cursor {
            if t > now {
                break;
            }
            missed = Some(t);
            count += 1;
            if count > self.missed_run_cap {
                return Err(ScheduleError::TooManyMissed {
                    cap: self.missed_run_cap,
                });
            }
            cursor = expr.next_after(t);
        }

        Ok(ScheduleDecision {
            missed,
            next: next_after_now(expr)?,
        })
    }
}

/// [`ScheduleConfig::next_schedule`] with the default cap.
pub fn next_schedule(
    expr: &CronExpr,
    last_scheduled: DateTime<Utc>,
    starting_deadline: Option<Duration>,
    now: DateTime<Utc>,
) -> Result<ScheduleDecision, ScheduleError> {
    ScheduleConfig::default().next_schedule(expr, last_scheduled, starting_deadline, now)
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    fn at(s: &str) -> DateTime<Utc> {
        DateTime::parse_from_rfc3339(s).unwrap().with_timezone(&Utc)
    }

    fn hourly() -> CronExpr {
        CronExpr::parse("0 * * * *").unwrap()
    }

    #[test]
    fn test_no_missed_run() {
        let decision = next_schedule(
            &hourly(),
            at("2024-03-01T10:00:00Z"),
            None,
            at("2024-03-01T10:30:00Z"),
        )
        .unwrap();

        assert_eq!(decision.missed, None);
        assert_eq!(decision.next, at("2024-03-01T11:00:00Z"));
        assert_eq!(
            decision.wait_from(at("2024-03-01T10:30:00Z")),
            std::time::Duration::from_secs(30 * 60)
        );
    }

    #[test]
    fn test_returns_latest_of_several_missed() {
        let decision = next_schedule(
            &hourly(),
            at("2024-03-01T10:00:00Z"),
            None,
            at("2024-03-01T13:30:00Z"),
        )
        .unwrap();

        assert_eq!(decision.missed, Some(at("2024-03-01T13:00:00Z")));
        assert_eq!(decision.next, at("2024-03-01T14:00:00Z"));
    }

    #[test]
    fn test_fire_at_exactly_now_is_missed_once() {
        let now = at("2024-03-01T11:00:00Z");
        let decision = next_schedule(&hourly(), at("2024-03-01T10:00:00Z"), None, now).unwrap();
        assert_eq!(decision.missed, Some(now));

        // Once launched, the boundary is excluded.
        let decision = next_schedule(&hourly(), now, None, now).unwrap();
        assert_eq!(decision.missed, None);
        assert_eq!(decision.next, at("2024-03-01T12:00:00Z"));
    }

    #[test]
    fn test_cap_exceeded() {
        let every_minute = CronExpr::parse("* * * * *").unwrap();
        let created = at("2024-03-01T00:00:00Z");

        let config = ScheduleConfig::default();
        let err = config
            .next_schedule(&every_minute, created, None, created + Duration::minutes(101))
            .unwrap_err();
        assert_eq!(err, ScheduleError::TooManyMissed { cap: 100 });

        let ok = config
            .next_schedule(&every_minute, created, None, created + Duration::minutes(100))
            .unwrap();
        assert_eq!(ok.missed, Some(created + Duration::minutes(100)));
    }

    #[test]
    fn test_custom_cap() {
        let every_minute = CronExpr::parse("* * * * *").unwrap();
        let created = at("2024-03-01T00:00:00Z");
        let config = ScheduleConfig { missed_run_cap: 5 };

        let err = config
            .next_schedule(&every_minute, created, None, created + Duration::minutes(6))
            .unwrap_err();
        assert_eq!(err, ScheduleError::TooManyMissed { cap: 5 });
    }

    #[test]
    fn test_starting_deadline_bounds_the_walk() {
        let every_minute = CronExpr::parse("* * * * *").unwrap();
        let created = at("2024-03-01T00:00:00Z");
        let now = created + Duration::days(30);

        // Without a deadline this would exceed the cap.
        let decision = next_schedule(
            &every_minute,
            created,
            Some(Duration::seconds(300)),
            now,
        )
        .unwrap();
        assert_eq!(decision.missed, Some(now));
    }

    #[test]
    fn test_starting_deadline_drops_stale_miss() {
        let missed = at("2024-03-01T11:00:00Z");
        let now = missed + Duration::seconds(120);

        let decision = next_schedule(
            &hourly(),
            at("2024-03-01T10:00:00Z"),
            Some(Duration::seconds(60)),
            now,
        )
        .unwrap();
        assert_eq!(decision.missed, None);
        assert_eq!(decision.next, at("2024-03-01T12:00:00Z"));
    }

    #[test]
    fn test_huge_starting_deadline_does_not_bound_the_walk() {
        let created = at("2024-03-01T00:00:00Z");
        let now = at("2024-03-01T05:30:00Z");

        let decision =
            next_schedule(&hourly(), created, Some(Duration::MAX), now).unwrap();
        assert_eq!(decision.missed, Some(at("2024-03-01T05:00:00Z")));
    }

    #[test]
    fn test_earliest_in_future() {
        let decision = next_schedule(
            &hourly(),
            at("2024-03-01T12:00:00Z"),
            None,
            at("2024-03-01T10:30:00Z"),
        )
        .unwrap();
        assert_eq!(decision.missed, None);
        assert_eq!(decision.next, at("2024-03-01T11:00:00Z"));
    }

    #[test]
    fn test_unsatisfiable() {
        let never = CronExpr::parse("0 0 30 2 *").unwrap();
        let err = next_schedule(
            &never,
            at("2024-03-01T00:00:00Z"),
            None,
            at("2024-03-02T00:00:00Z"),
        )
        .unwrap_err();
        assert!(matches!(err, ScheduleError::Unsatisfiable(_)));
    }

    proptest! {
        #[test]
        fn prop_missed_and_next_bracket_now(offset_mins in 0i64..90, elapsed_mins in 0i64..90) {
            let base = at("2024-03-01T00:00:00Z") + Duration::minutes(offset_mins);
            let now = base + Duration::minutes(elapsed_mins);
            let decision = next_schedule(&hourly(), base, None, now).unwrap();

            prop_assert!(decision.next > now);
            if let Some(missed) = decision.missed {
                prop_assert!(missed > base);
                prop_assert!(missed <= now);
                prop_assert!(hourly().next_after(missed).unwrap() > now);
            }
        }
    }
}
