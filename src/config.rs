use std::time::Duration;

use chrono::{Days, Local, NaiveDate};

use crate::wire::DEFAULT_DECOMPRESSION_CEILING;
use crate::{Error, Result};

const GIB: u64 = 1024 * 1024 * 1024;

/// How an upsert that hit lock contention is retried.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Total attempts, including the first one.
    pub max_attempts: u32,
    pub backoff: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            backoff: Duration::ZERO,
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct StorageLimits {
    pub soft: u64,
    pub hard: u64,
}

impl Default for StorageLimits {
    fn default() -> Self {
        Self {
            soft: 100 * GIB,
            hard: 200 * GIB,
        }
    }
}

#[derive(Clone, Debug)]
pub struct ImporterConfig {
    /// One connection URL per database shard, indexed by `StreamInfo::db_shard`.
    pub database_urls: Vec<String>,
    pub storage_limits: StorageLimits,
    /// Ping every store connection each `ping_interval` ticks.
    pub ping_interval: u64,
    /// Ticks per cache generation; one tick per second makes this hourly.
    pub refresh_interval: u64,
    pub storage_interval: u64,
    pub poll_timeout: Duration,
    pub provision_delay: Duration,
    pub retry: RetryPolicy,
    pub wait_for_replication: bool,
    pub background_index_builds: bool,
    pub dry_run: bool,
    pub decompression_ceiling: usize,
    pub connections_per_shard: u32,
    pub updater_count: usize,
}

impl Default for ImporterConfig {
    fn default() -> Self {
        Self {
            database_urls: Vec::new(),
            storage_limits: StorageLimits::default(),
            ping_interval: 5,
            refresh_interval: 3600,
            storage_interval: 60,
            poll_timeout: Duration::from_secs(1),
            provision_delay: Duration::from_secs(5),
            retry: RetryPolicy::default(),
            wait_for_replication: false,
            background_index_builds: true,
            dry_run: false,
            decompression_ceiling: DEFAULT_DECOMPRESSION_CEILING,
            connections_per_shard: 1,
            updater_count: 4,
        }
    }
}

impl ImporterConfig {
    pub fn builder() -> ImporterConfigBuilder {
        ImporterConfigBuilder::default()
    }

    pub fn shard_count(&self) -> usize {
        self.database_urls.len()
    }

    pub fn validate(&self) -> Result<()> {
        if self.database_urls.is_empty() {
            return Err(Error::Config("at least one database shard is required".into()));
        }
        if self.storage_limits.soft > self.storage_limits.hard {
            return Err(Error::Config(format!(
                "soft storage limit {} exceeds hard limit {}",
                self.storage_limits.soft, self.storage_limits.hard
            )));
        }
        for (name, value) in [
            ("ping_interval", self.ping_interval),
            ("refresh_interval", self.refresh_interval),
            ("storage_interval", self.storage_interval),
        ] {
            if value == 0 {
                return Err(Error::Config(format!("{name} must be non-zero")));
            }
        }
        if self.retry.max_attempts == 0 {
            return Err(Error::Config("retry budget must allow one attempt".into()));
        }
        if self.connections_per_shard == 0 {
            return Err(Error::Config("connections_per_shard must be non-zero".into()));
        }
        if self.decompression_ceiling == 0 {
            return Err(Error::Config("decompression_ceiling must be non-zero".into()));
        }
        if self.updater_count == 0 {
            return Err(Error::Config("at least one updater is required".into()));
        }
        Ok(())
    }
}

#[derive(Debug, Default)]
pub struct ImporterConfigBuilder {
    config: ImporterConfig,
}

impl ImporterConfigBuilder {
    pub fn database_url(mut self, url: impl Into<String>) -> Self {
        self.config.database_urls.push(url.into());
        self
    }

    pub fn database_urls<I, S>(mut self, urls: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.config
            .database_urls
            .extend(urls.into_iter().map(Into::into));
        self
    }

    pub fn storage_limits(mut self, soft: u64, hard: u64) -> Self {
        self.config.storage_limits = StorageLimits { soft, hard };
        self
    }

    pub fn ping_interval(mut self, ticks: u64) -> Self {
        self.config.ping_interval = ticks;
        self
    }

    pub fn refresh_interval(mut self, ticks: u64) -> Self {
        self.config.refresh_interval = ticks;
        self
    }

    pub fn storage_interval(mut self, ticks: u64) -> Self {
        self.config.storage_interval = ticks;
        self
    }

    pub fn poll_timeout(mut self, timeout: Duration) -> Self {
        self.config.poll_timeout = timeout;
        self
    }

    pub fn provision_delay(mut self, delay: Duration) -> Self {
        self.config.provision_delay = delay;
        self
    }

    pub fn retry(mut self, max_attempts: u32, backoff: Duration) -> Self {
        self.config.retry = RetryPolicy {
            max_attempts,
            backoff,
        };
        self
    }

    pub fn wait_for_replication(mut self, wait: bool) -> Self {
        self.config.wait_for_replication = wait;
        self
    }

    pub fn background_index_builds(mut self, background: bool) -> Self {
        self.config.background_index_builds = background;
        self
    }

    pub fn dry_run(mut self, dry_run: bool) -> Self {
        self.config.dry_run = dry_run;
        self
    }

    pub fn decompression_ceiling(mut self, bytes: usize) -> Self {
        self.config.decompression_ceiling = bytes;
        self
    }

    pub fn connections_per_shard(mut self, n: u32) -> Self {
        self.config.connections_per_shard = n;
        self
    }

    pub fn updater_count(mut self, n: usize) -> Self {
        self.config.updater_count = n;
        self
    }

    pub fn build(self) -> Result<ImporterConfig> {
        self.config.validate()?;
        Ok(self.config)
    }
}

/// Split a list separated by commas and/or whitespace, dropping empty items.
pub fn split_delimited(list: &str) -> Vec<String> {
    list.split(|c: char| c == ',' || c.is_whitespace())
        .filter(|s| !s.is_empty())
        .map(str::to_string)
        .collect()
}

/// Today's and tomorrow's dates as used in database names.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct DateInfo {
    today: NaiveDate,
    tomorrow: NaiveDate,
}

impl DateInfo {
    pub fn new() -> Self {
        Self::for_date(Local::now().date_naive())
    }

    pub fn for_date(today: NaiveDate) -> Self {
        Self {
            today,
            tomorrow: today.checked_add_days(Days::new(1)).unwrap_or(today),
        }
    }

    pub fn today(&self) -> NaiveDate {
        self.today
    }

    pub fn tomorrow(&self) -> NaiveDate {
        self.tomorrow
    }

    /// `YYYY-MM-DD`
    pub fn today_str(&self) -> String {
        format_date(self.today)
    }

    pub fn tomorrow_str(&self) -> String {
        format_date(self.tomorrow)
    }

    /// Refresh from the local clock. Returns true when the day changed.
    pub fn update(&mut self) -> bool {
        self.update_at(Local::now().date_naive())
    }

    pub fn update_at(&mut self, today: NaiveDate) -> bool {
        if today == self.today {
            return false;
        }
        *self = Self::for_date(today);
        true
    }
}

impl Default for DateInfo {
    fn default() -> Self {
        Self::new()
    }
}

pub fn format_date(date: NaiveDate) -> String {
    date.format("%Y-%m-%d").to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn date(y: i32, m: u32, d: u32) -> NaiveDate {
        NaiveDate::from_ymd_opt(y, m, d).unwrap()
    }

    #[test]
    fn builder_validates() {
        let err = ImporterConfig::builder().build().unwrap_err();
        assert!(matches!(err, Error::Config(_)));

        let err = ImporterConfig::builder()
            .database_url("postgres://localhost/a")
            .storage_limits(10, 5)
            .build()
            .unwrap_err();
        assert!(err.to_string().contains("soft storage limit"));

        let err = ImporterConfig::builder()
            .database_url("postgres://localhost/a")
            .ping_interval(0)
            .build()
            .unwrap_err();
        assert!(err.to_string().contains("ping_interval"));

        let cfg = ImporterConfig::builder()
            .database_urls(["postgres://a", "postgres://b"])
            .retry(5, Duration::from_millis(10))
            .build()
            .unwrap();
        assert_eq!(cfg.shard_count(), 2);
        assert_eq!(cfg.retry.max_attempts, 5);
    }

    #[test]
    fn defaults() {
        let cfg = ImporterConfig::default();
        assert_eq!(cfg.retry.max_attempts, 3);
        assert_eq!(cfg.retry.backoff, Duration::ZERO);
        assert_eq!(cfg.ping_interval, 5);
        assert_eq!(cfg.refresh_interval, 3600);
        assert_eq!(cfg.poll_timeout, Duration::from_secs(1));
        assert_eq!(cfg.provision_delay, Duration::from_secs(5));
        assert_eq!(cfg.decompression_ceiling, 32 * 1024 * 1024);
        assert!(!cfg.wait_for_replication);
    }

    #[test]
    fn split_on_commas_and_spaces() {
        assert_eq!(
            split_delimited("postgres://a, postgres://b  postgres://c,"),
            vec!["postgres://a", "postgres://b", "postgres://c"]
        );
        assert!(split_delimited(" , ").is_empty());
    }

    #[test]
    fn date_rollover() {
        let mut info = DateInfo::for_date(date(2024, 2, 28));
        assert_eq!(info.tomorrow_str(), "2024-02-29");
        assert!(!info.update_at(date(2024, 2, 28)));
        assert!(info.update_at(date(2024, 2, 29)));
        assert_eq!(info.today_str(), "2024-02-29");
        assert_eq!(info.tomorrow(), date(2024, 3, 1));
    }
}
