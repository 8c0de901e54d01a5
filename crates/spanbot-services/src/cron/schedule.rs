//! Next-run computation for the three schedule kinds.
//!
//! `every` schedules fire at a fixed interval from now; `at` schedules
//! fire once and never re-arm when more than five minutes stale; `cron`
//! schedules evaluate a cron expression in an optional named timezone,
//! with a small built-in vocabulary (`hourly`, `daily`, `weekly`,
//! `every N`) as the fallback when the expression does not parse.

use std::str::FromStr;

use chrono::{TimeZone, Utc};
use chrono_tz::Tz;
use cron::Schedule;
use tracing::{debug, warn};

use spanbot_types::cron::{CronJob, ScheduleKind};

use crate::error::{Result, ServiceError};

/// `at` jobs whose target is further in the past than this never re-arm.
pub const STALE_AT_THRESHOLD_MS: i64 = 5 * 60 * 1000;

/// Compute a job's next run time after `now_ms`, or `None` when the job
/// has no further occurrence.
pub fn compute_next_run(job: &CronJob, now_ms: i64) -> Option<i64> {
    match job.schedule.kind {
        ScheduleKind::Every => job.schedule.every_ms.map(|ms| now_ms + ms),
        ScheduleKind::At => job.schedule.at_ms.and_then(|at| {
            if at > now_ms - STALE_AT_THRESHOLD_MS {
                Some(at)
            } else {
                debug!(job = %job.id, "one-shot target too stale, never re-arming");
                None
            }
        }),
        ScheduleKind::Cron => {
            let expr = job.schedule.expr.as_deref()?;
            next_cron_occurrence(expr, job.schedule.tz.as_deref(), now_ms)
        }
    }
}

/// Validate that a job's schedule is interpretable at all.
pub fn validate_schedule(job: &CronJob) -> Result<()> {
    match job.schedule.kind {
        ScheduleKind::Every => {
            if job.schedule.every_ms.is_some_and(|ms| ms > 0) {
                Ok(())
            } else {
                Err(ServiceError::InvalidSchedule(
                    "every-schedule requires a positive interval".into(),
                ))
            }
        }
        ScheduleKind::At => {
            if job.schedule.at_ms.is_some() {
                Ok(())
            } else {
                Err(ServiceError::InvalidSchedule(
                    "at-schedule requires a timestamp".into(),
                ))
            }
        }
        ScheduleKind::Cron => {
            let expr = job.schedule.expr.as_deref().ok_or_else(|| {
                ServiceError::InvalidSchedule("cron-schedule requires an expression".into())
            })?;
            if Schedule::from_str(&normalize_cron_expr(expr)).is_ok()
                || vocabulary_interval(expr).is_some()
            {
                Ok(())
            } else {
                Err(ServiceError::InvalidSchedule(format!(
                    "unparseable cron expression: {expr}"
                )))
            }
        }
    }
}

/// The next instant strictly after `now_ms` matching the expression.
fn next_cron_occurrence(expr: &str, tz: Option<&str>, now_ms: i64) -> Option<i64> {
    let now = Utc.timestamp_millis_opt(now_ms).single()?;

    if let Ok(schedule) = Schedule::from_str(&normalize_cron_expr(expr)) {
        let tz: Option<Tz> = tz.and_then(|name| {
            name.parse().map_err(|_| warn!(tz = name, "unknown timezone, using UTC")).ok()
        });
        return match tz {
            Some(tz) => schedule
                .after(&now.with_timezone(&tz))
                .next()
                .map(|dt| dt.timestamp_millis()),
            None => schedule.after(&now).next().map(|dt| dt.timestamp_millis()),
        };
    }

    vocabulary_interval(expr).map(|interval| match expr.trim().to_ascii_lowercase().as_str() {
        // "daily" aligns to the next UTC midnight rather than now + 24 h.
        "daily" => {
            let now_s = now_ms / 1000;
            let until_midnight = 86_400 - now_s.rem_euclid(86_400);
            now_ms + until_midnight * 1000
        }
        _ => now_ms + interval,
    })
}

/// Interval for the fallback vocabulary, or `None` for unknown words.
fn vocabulary_interval(expr: &str) -> Option<i64> {
    let expr = expr.trim().to_ascii_lowercase();
    match expr.as_str() {
        "hourly" => Some(3_600_000),
        "daily" => Some(86_400_000),
        "weekly" => Some(7 * 86_400_000),
        _ => {
            let seconds: i64 = expr.strip_prefix("every ")?.trim().parse().ok()?;
            (seconds > 0).then_some(seconds * 1000)
        }
    }
}

/// The `cron` crate wants a seconds field; accept the common five-field
/// form by pinning seconds to zero.
fn normalize_cron_expr(expr: &str) -> String {
    let fields = expr.split_whitespace().count();
    if fields == 5 {
        format!("0 {expr}")
    } else {
        expr.to_owned()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use spanbot_types::cron::{CronPayload, CronSchedule};

    fn job_with(schedule: CronSchedule) -> CronJob {
        CronJob {
            id: "j1".into(),
            name: "test".into(),
            enabled: true,
            schedule,
            payload: CronPayload::default(),
            state: Default::default(),
            created_at_ms: 0,
            updated_at_ms: 0,
            delete_after_run: false,
        }
    }

    const NOW: i64 = 1_700_000_000_000;

    #[test]
    fn every_adds_interval_to_now() {
        let job = job_with(CronSchedule::every(60_000));
        assert_eq!(compute_next_run(&job, NOW), Some(NOW + 60_000));
    }

    #[test]
    fn at_job_in_future_arms() {
        let job = job_with(CronSchedule::at(NOW + 2000));
        assert_eq!(compute_next_run(&job, NOW), Some(NOW + 2000));
    }

    #[test]
    fn at_job_slightly_stale_still_arms() {
        // 4 minutes 59 seconds in the past: runs immediately.
        let job = job_with(CronSchedule::at(NOW - (4 * 60 + 59) * 1000));
        assert!(compute_next_run(&job, NOW).is_some());
    }

    #[test]
    fn at_job_too_stale_never_arms() {
        // 5 minutes 1 second in the past: skipped permanently.
        let job = job_with(CronSchedule::at(NOW - (5 * 60 + 1) * 1000));
        assert_eq!(compute_next_run(&job, NOW), None);
    }

    #[test]
    fn cron_expression_is_strictly_future() {
        let job = job_with(CronSchedule::cron("0 9 * * *", Some("UTC".into())));
        let next = compute_next_run(&job, NOW).unwrap();
        assert!(next > NOW);
        // At most 24 hours out for a daily expression.
        assert!(next <= NOW + 86_400_000);
    }

    #[test]
    fn cron_seven_field_form_accepted() {
        let job = job_with(CronSchedule::cron("0 0 * * * * *", None));
        let next = compute_next_run(&job, NOW).unwrap();
        assert!(next > NOW);
    }

    #[test]
    fn cron_timezone_changes_result() {
        let utc = job_with(CronSchedule::cron("0 9 * * *", Some("UTC".into())));
        let shanghai = job_with(CronSchedule::cron("0 9 * * *", Some("Asia/Shanghai".into())));
        let a = compute_next_run(&utc, NOW).unwrap();
        let b = compute_next_run(&shanghai, NOW).unwrap();
        assert_ne!(a, b);
    }

    #[test]
    fn unknown_timezone_falls_back_to_utc() {
        let bad = job_with(CronSchedule::cron("0 9 * * *", Some("Mars/Olympus".into())));
        let utc = job_with(CronSchedule::cron("0 9 * * *", Some("UTC".into())));
        assert_eq!(compute_next_run(&bad, NOW), compute_next_run(&utc, NOW));
    }

    #[test]
    fn vocabulary_fallback() {
        let hourly = job_with(CronSchedule::cron("hourly", None));
        assert_eq!(compute_next_run(&hourly, NOW), Some(NOW + 3_600_000));

        let weekly = job_with(CronSchedule::cron("weekly", None));
        assert_eq!(compute_next_run(&weekly, NOW), Some(NOW + 7 * 86_400_000));

        let every = job_with(CronSchedule::cron("every 90", None));
        assert_eq!(compute_next_run(&every, NOW), Some(NOW + 90_000));
    }

    #[test]
    fn daily_vocabulary_aligns_to_midnight() {
        let daily = job_with(CronSchedule::cron("daily", None));
        let next = compute_next_run(&daily, NOW).unwrap();
        assert!(next > NOW);
        assert_eq!((next / 1000) % 86_400, 0);
    }

    #[test]
    fn garbage_expression_yields_none() {
        let job = job_with(CronSchedule::cron("not a schedule", None));
        assert_eq!(compute_next_run(&job, NOW), None);
    }

    #[test]
    fn validate_accepts_good_schedules() {
        assert!(validate_schedule(&job_with(CronSchedule::every(1000))).is_ok());
        assert!(validate_schedule(&job_with(CronSchedule::at(NOW))).is_ok());
        assert!(validate_schedule(&job_with(CronSchedule::cron("0 9 * * *", None))).is_ok());
        assert!(validate_schedule(&job_with(CronSchedule::cron("hourly", None))).is_ok());
    }

    #[test]
    fn validate_rejects_bad_schedules() {
        assert!(validate_schedule(&job_with(CronSchedule::every(0))).is_err());
        assert!(validate_schedule(&job_with(CronSchedule::cron("nonsense", None))).is_err());

        let no_expr = job_with(CronSchedule {
            kind: ScheduleKind::Cron,
            ..Default::default()
        });
        assert!(validate_schedule(&no_expr).is_err());
    }
}
