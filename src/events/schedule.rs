//! Wall-clock resolution for one-shot and periodic events (§4.4).

use crate::error::EventError;
use chrono::{DateTime, NaiveDateTime, Utc};
use chrono_tz::Tz;
use cron::Schedule as CronSchedule;
use std::str::FromStr;
use std::time::Duration;

/// Resolve a one-shot event's `at` (interpreted in `timezone`, default UTC)
/// into a delay from `now`. Past times resolve to a zero delay — the event
/// bus dispatches immediately rather than skipping it.
pub fn one_shot_delay(at: &str, timezone: Option<&str>, now: DateTime<Utc>) -> anyhow::Result<Duration> {
    let target_utc = resolve_at(at, timezone)?;
    Ok(delay_from(now, target_utc))
}

fn resolve_at(at: &str, timezone: Option<&str>) -> anyhow::Result<DateTime<Utc>> {
    if let Ok(dt) = DateTime::parse_from_rfc3339(at) {
        return Ok(dt.with_timezone(&Utc));
    }

    let naive = NaiveDateTime::parse_from_str(at, "%Y-%m-%dT%H:%M:%S")
        .or_else(|_| NaiveDateTime::parse_from_str(at, "%Y-%m-%d %H:%M:%S"))
        .map_err(|err| anyhow::anyhow!("unrecognized one-shot 'at' timestamp {at:?}: {err}"))?;

    let tz_name = timezone.unwrap_or("UTC");
    let tz: Tz = tz_name
        .parse()
        .map_err(|_| anyhow::anyhow!("unknown timezone {tz_name:?}"))?;

    let local = naive
        .and_local_timezone(tz)
        .single()
        .ok_or_else(|| anyhow::anyhow!("ambiguous or nonexistent local time {at:?} in {tz_name:?}"))?;
    Ok(local.with_timezone(&Utc))
}

fn delay_from(now: DateTime<Utc>, target: DateTime<Utc>) -> Duration {
    (target - now).to_std().unwrap_or(Duration::ZERO)
}

/// Resolve a periodic event's next firing, scheduled in `timezone`.
pub fn next_periodic(
    cron_expr: &str,
    timezone: &str,
    now: DateTime<Utc>,
) -> anyhow::Result<(Duration, DateTime<Utc>)> {
    let tz: Tz = timezone
        .parse()
        .map_err(|_| anyhow::anyhow!("unknown timezone {timezone:?}"))?;
    let schedule = CronSchedule::from_str(cron_expr).map_err(|source| EventError::InvalidCron {
        expr: cron_expr.to_string(),
        source,
    })?;

    let now_tz = now.with_timezone(&tz);
    let next = schedule
        .after(&now_tz)
        .next()
        .ok_or_else(|| anyhow::anyhow!("cron expression {cron_expr:?} has no upcoming firing"))?;
    let next_utc = next.with_timezone(&Utc);
    Ok((delay_from(now, next_utc), next_utc))
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn one_shot_past_time_resolves_to_zero_delay() {
        let now = Utc.with_ymd_and_hms(2026, 6, 1, 12, 0, 0).unwrap();
        let delay = one_shot_delay("2020-01-01T00:00:00", None, now).unwrap();
        assert_eq!(delay, Duration::ZERO);
    }

    #[test]
    fn one_shot_future_utc_time_computes_delay() {
        let now = Utc.with_ymd_and_hms(2026, 6, 1, 12, 0, 0).unwrap();
        let delay = one_shot_delay("2026-06-01T13:00:00", None, now).unwrap();
        assert_eq!(delay, Duration::from_secs(3600));
    }

    #[test]
    fn one_shot_edt_offset_is_four_hours_from_utc() {
        // 9am America/New_York in summer (EDT, UTC-4) is 13:00 UTC.
        let now = Utc.with_ymd_and_hms(2026, 7, 1, 12, 0, 0).unwrap();
        let delay = one_shot_delay("2026-07-01T09:00:00", Some("America/New_York"), now).unwrap();
        assert_eq!(delay, Duration::from_secs(3600));
    }

    #[test]
    fn periodic_schedule_finds_next_minute() {
        let now = Utc.with_ymd_and_hms(2026, 6, 1, 12, 0, 30).unwrap();
        let (delay, next) = next_periodic("0 * * * * *", "UTC", now).unwrap();
        assert!(delay <= Duration::from_secs(30));
        assert!(next > now);
    }

    #[test]
    fn invalid_cron_expression_is_rejected() {
        assert!(next_periodic("not a cron expr", "UTC", Utc::now()).is_err());
    }

    #[test]
    fn invalid_cron_expression_carries_typed_error() {
        let err = next_periodic("not a cron expr", "UTC", Utc::now()).unwrap_err();
        assert!(err.downcast_ref::<EventError>().is_some_and(|e| matches!(e, EventError::InvalidCron { .. })));
    }
}
