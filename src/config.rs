use std::path::PathBuf;
use std::time::Duration;

use chrono::TimeDelta;

/// Business limits applied by the availability validator and the notification dedup.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Policy {
    pub min_duration: TimeDelta,
    pub max_duration: TimeDelta,
    /// Earliest a booking may start, measured from now.
    pub min_notice: TimeDelta,
    /// Latest a booking may start, measured from now.
    pub max_notice: TimeDelta,
    /// Max active (Pending/Approved) bookings per requester per date.
    pub daily_quota: u32,
    pub dedup_window: TimeDelta,
}

impl Default for Policy {
    fn default() -> Self {
        Self {
            min_duration: TimeDelta::minutes(30),
            max_duration: TimeDelta::hours(8),
            min_notice: TimeDelta::hours(2),
            max_notice: TimeDelta::days(30),
            daily_quota: 3,
            dedup_window: TimeDelta::minutes(5),
        }
    }
}

/// Process-level settings, read from `RESERVO_*` environment variables.
#[derive(Debug, Clone)]
pub struct Config {
    pub data_dir: PathBuf,
    pub metrics_port: Option<u16>,
    pub compact_threshold: u64,
    /// When set, the binary stays up and checks for compaction this often.
    pub compact_interval: Option<Duration>,
    pub policy: Policy,
}

fn env_parse<T: std::str::FromStr>(key: &str) -> Option<T> {
    std::env::var(key).ok().and_then(|s| s.parse().ok())
}

impl Config {
    pub fn from_env() -> Self {
        let defaults = Policy::default();
        let policy = Policy {
            min_duration: env_parse("RESERVO_MIN_DURATION_MINUTES")
                .map(TimeDelta::minutes)
                .unwrap_or(defaults.min_duration),
            max_duration: env_parse("RESERVO_MAX_DURATION_MINUTES")
                .map(TimeDelta::minutes)
                .unwrap_or(defaults.max_duration),
            min_notice: env_parse("RESERVO_MIN_NOTICE_MINUTES")
                .map(TimeDelta::minutes)
                .unwrap_or(defaults.min_notice),
            max_notice: env_parse("RESERVO_MAX_NOTICE_DAYS")
                .map(TimeDelta::days)
                .unwrap_or(defaults.max_notice),
            daily_quota: env_parse("RESERVO_DAILY_QUOTA").unwrap_or(defaults.daily_quota),
            dedup_window: env_parse("RESERVO_DEDUP_WINDOW_SECONDS")
                .map(TimeDelta::seconds)
                .unwrap_or(defaults.dedup_window),
        };

        Self {
            data_dir: std::env::var("RESERVO_DATA_DIR")
                .unwrap_or_else(|_| "./data".into())
                .into(),
            metrics_port: env_parse("RESERVO_METRICS_PORT"),
            compact_threshold: env_parse("RESERVO_COMPACT_THRESHOLD").unwrap_or(1000),
            compact_interval: env_parse::<u64>("RESERVO_COMPACT_INTERVAL_SECONDS")
                .filter(|s| *s > 0)
                .map(Duration::from_secs),
            policy,
        }
    }

    pub fn wal_path(&self) -> PathBuf {
        self.data_dir.join("reservo.wal")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_policy_matches_booking_rules() {
        let p = Policy::default();
        assert_eq!(p.min_duration, TimeDelta::minutes(30));
        assert_eq!(p.max_duration, TimeDelta::minutes(480));
        assert_eq!(p.min_notice, TimeDelta::hours(2));
        assert_eq!(p.max_notice, TimeDelta::days(30));
        assert_eq!(p.daily_quota, 3);
        assert_eq!(p.dedup_window, TimeDelta::seconds(300));
    }

    #[test]
    fn wal_lives_in_data_dir() {
        let cfg = Config {
            data_dir: PathBuf::from("/tmp/reservo"),
            metrics_port: None,
            compact_threshold: 10,
            compact_interval: None,
            policy: Policy::default(),
        };
        assert_eq!(cfg.wal_path(), PathBuf::from("/tmp/reservo/reservo.wal"));
    }
}
