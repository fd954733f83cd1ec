use std::time::Duration;

use once_cell::sync::Lazy;
use regex::Regex;
use serde::{Deserialize, Serialize};

use crate::error::ModelError;

/// Shortest supported recomputation interval.
pub const MIN_INTERVAL: Duration = Duration::from_secs(60);
/// Longest supported recomputation interval.
pub const MAX_INTERVAL: Duration = Duration::from_secs(30 * 24 * 60 * 60);

static INTERVAL_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^(\d+)(ms|s|m|h|d)?$").expect("interval grammar"));

/// Periodic trigger configuration: how often a container is due for
/// recomputation.
///
/// Parsed from human strings like `"30m"`, `"1h"`, `"7d"`; a unit-less
/// value means minutes. Values are clamped to
/// [`MIN_INTERVAL`, `MAX_INTERVAL`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct TriggerSpec {
    interval_secs: u64,
}

impl TriggerSpec {
    pub fn parse(spec: &str) -> Result<Self, ModelError> {
        let caps = INTERVAL_RE
            .captures(spec.trim())
            .ok_or_else(|| ModelError::InvalidInterval(spec.to_string()))?;
        let value: u64 = caps[1]
            .parse()
            .map_err(|_| ModelError::InvalidInterval(spec.to_string()))?;
        let interval = match caps.get(2).map(|m| m.as_str()) {
            Some("ms") => Duration::from_millis(value),
            Some("s") => Duration::from_secs(value),
            Some("h") => Duration::from_secs(value.saturating_mul(3600)),
            Some("d") => Duration::from_secs(value.saturating_mul(86_400)),
            // Unit-less and "m" both mean minutes.
            _ => Duration::from_secs(value.saturating_mul(60)),
        };
        Ok(Self::from_interval(interval))
    }

    pub fn from_interval(interval: Duration) -> Self {
        let clamped = interval.clamp(MIN_INTERVAL, MAX_INTERVAL);
        Self {
            interval_secs: clamped.as_secs(),
        }
    }

    pub fn interval(&self) -> Duration {
        Duration::from_secs(self.interval_secs)
    }

    /// How often the cron needs to visit this trigger. Visiting more
    /// often than the cadence never changes outcomes; the cadence only
    /// trims pointless wake-ups for long intervals.
    pub fn cadence(&self) -> TickCadence {
        let mins = self.interval_secs / 60;
        match mins {
            0..5 => TickCadence::EveryMinute,
            5..15 => TickCadence::EveryFiveMinutes,
            15..30 => TickCadence::EveryQuarterHour,
            30..60 => TickCadence::EveryHalfHour,
            60..1440 => TickCadence::Hourly((mins / 60) as u32),
            _ => TickCadence::Daily,
        }
    }
}

/// Coarse visiting schedule derived from a trigger interval.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TickCadence {
    EveryMinute,
    EveryFiveMinutes,
    EveryQuarterHour,
    EveryHalfHour,
    /// Every N hours, on the hour.
    Hourly(u32),
    Daily,
}

impl TickCadence {
    /// Whether a minute tick at `minute_of_day` (0..1440) should visit
    /// the trigger.
    pub fn due(&self, minute_of_day: u32) -> bool {
        match *self {
            TickCadence::EveryMinute => true,
            TickCadence::EveryFiveMinutes => minute_of_day % 5 == 0,
            TickCadence::EveryQuarterHour => minute_of_day % 15 == 0,
            TickCadence::EveryHalfHour => minute_of_day % 30 == 0,
            TickCadence::Hourly(hours) => minute_of_day % (hours.max(1) * 60) == 0,
            TickCadence::Daily => minute_of_day == 0,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_units_and_defaults_to_minutes() {
        assert_eq!(
            TriggerSpec::parse("30m").unwrap().interval(),
            Duration::from_secs(30 * 60)
        );
        assert_eq!(
            TriggerSpec::parse("1h").unwrap().interval(),
            Duration::from_secs(3600)
        );
        assert_eq!(
            TriggerSpec::parse("7d").unwrap().interval(),
            Duration::from_secs(7 * 86_400)
        );
        assert_eq!(
            TriggerSpec::parse("45").unwrap().interval(),
            Duration::from_secs(45 * 60)
        );
    }

    #[test]
    fn clamps_to_supported_range() {
        assert_eq!(TriggerSpec::parse("500ms").unwrap().interval(), MIN_INTERVAL);
        assert_eq!(TriggerSpec::parse("10s").unwrap().interval(), MIN_INTERVAL);
        assert_eq!(TriggerSpec::parse("90d").unwrap().interval(), MAX_INTERVAL);
    }

    #[test]
    fn rejects_garbage() {
        assert!(TriggerSpec::parse("soon").is_err());
        assert!(TriggerSpec::parse("5 m").is_err());
        assert!(TriggerSpec::parse("-5m").is_err());
    }

    #[test]
    fn cadence_widens_with_interval() {
        assert_eq!(
            TriggerSpec::parse("2m").unwrap().cadence(),
            TickCadence::EveryMinute
        );
        assert_eq!(
            TriggerSpec::parse("10m").unwrap().cadence(),
            TickCadence::EveryFiveMinutes
        );
        assert_eq!(
            TriggerSpec::parse("20m").unwrap().cadence(),
            TickCadence::EveryQuarterHour
        );
        assert_eq!(
            TriggerSpec::parse("45m").unwrap().cadence(),
            TickCadence::EveryHalfHour
        );
        assert_eq!(
            TriggerSpec::parse("6h").unwrap().cadence(),
            TickCadence::Hourly(6)
        );
        assert_eq!(TriggerSpec::parse("3d").unwrap().cadence(), TickCadence::Daily);
    }

    #[test]
    fn hourly_cadence_fires_on_the_hour() {
        let cadence = TickCadence::Hourly(6);
        assert!(cadence.due(0));
        assert!(cadence.due(360));
        assert!(!cadence.due(90));
        assert!(TickCadence::Daily.due(0));
        assert!(!TickCadence::Daily.due(720));
    }
}
