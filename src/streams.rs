use std::collections::BTreeMap;
use std::sync::Arc;

use chrono::NaiveDate;

use crate::config::format_date;
use crate::schema::check_identifier;
use crate::{Error, Result};

/// An application/environment pair and the database shard it writes to.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct StreamInfo {
    pub name: String,
    pub app: String,
    pub env: String,
    pub db_shard: usize,
}

impl StreamInfo {
    pub fn new(app: impl Into<String>, env: impl Into<String>, db_shard: usize) -> Self {
        let app = app.into();
        let env = env.into();
        Self {
            name: format!("{app}-{env}"),
            app,
            env,
            db_shard,
        }
    }

    /// Parse `app-env[@shard]`. The environment is the part after the last
    /// dash, so applications may contain dashes themselves.
    pub fn parse(spec: &str) -> Result<Self> {
        let (name, shard) = match spec.split_once('@') {
            Some((name, shard)) => {
                let shard = shard
                    .parse::<usize>()
                    .map_err(|_| Error::Config(format!("invalid shard in stream '{spec}'")))?;
                (name, shard)
            }
            None => (spec, 0),
        };
        let info = match name.rsplit_once('-') {
            Some((app, env)) if !app.is_empty() && !env.is_empty() => Self::new(app, env, shard),
            _ => {
                return Err(Error::Config(format!(
                    "stream '{spec}' is not of the form app-env[@shard]"
                )));
            }
        };
        check_identifier(&info.database_name_for("0000-00-00"))
            .map_err(|_| Error::Config(format!("stream '{spec}' makes database names too long")))?;
        Ok(info)
    }

    /// `logjam-<app>-<env>-<YYYY-MM-DD>`
    pub fn database_name(&self, date: NaiveDate) -> String {
        self.database_name_for(&format_date(date))
    }

    pub fn database_name_for(&self, iso_date: &str) -> String {
        format!("logjam-{}-{}-{}", self.app, self.env, iso_date)
    }
}

/// Read-only view of the streams currently being imported.
pub trait StreamRegistry: Send + Sync {
    fn active_stream_names(&self) -> Vec<String>;
    fn stream_info(&self, name: &str) -> Option<Arc<StreamInfo>>;

    fn active_streams(&self) -> Vec<Arc<StreamInfo>> {
        self.active_stream_names()
            .iter()
            .filter_map(|name| self.stream_info(name))
            .collect()
    }
}

#[derive(Clone, Debug, Default)]
pub struct StaticStreamRegistry {
    streams: BTreeMap<String, Arc<StreamInfo>>,
}

impl StaticStreamRegistry {
    pub fn new(streams: impl IntoIterator<Item = StreamInfo>) -> Self {
        Self {
            streams: streams
                .into_iter()
                .map(|s| (s.name.clone(), Arc::new(s)))
                .collect(),
        }
    }

    pub fn len(&self) -> usize {
        self.streams.len()
    }

    pub fn is_empty(&self) -> bool {
        self.streams.is_empty()
    }
}

impl StreamRegistry for StaticStreamRegistry {
    fn active_stream_names(&self) -> Vec<String> {
        self.streams.keys().cloned().collect()
    }

    fn stream_info(&self, name: &str) -> Option<Arc<StreamInfo>> {
        self.streams.get(name).cloned()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_app_env_and_shard() {
        let s = StreamInfo::parse("web-shop-production@2").unwrap();
        assert_eq!(s.app, "web-shop");
        assert_eq!(s.env, "production");
        assert_eq!(s.db_shard, 2);
        assert_eq!(s.name, "web-shop-production");

        assert_eq!(StreamInfo::parse("shop-staging").unwrap().db_shard, 0);
        assert!(StreamInfo::parse("shop").is_err());
        assert!(StreamInfo::parse("shop-production@x").is_err());
    }

    #[test]
    fn long_app_env_pairs_are_rejected() {
        // 44 bytes of app and env leave a 63 byte database name
        let fits = format!("{}-{}", "a".repeat(34), "production");
        assert!(StreamInfo::parse(&fits).is_ok());

        let too_long = format!("{}-{}", "a".repeat(35), "production");
        assert!(matches!(StreamInfo::parse(&too_long), Err(Error::Config(_))));
    }

    #[test]
    fn database_names_carry_the_date() {
        let s = StreamInfo::new("shop", "production", 0);
        let date = NaiveDate::from_ymd_opt(2024, 3, 7).unwrap();
        assert_eq!(s.database_name(date), "logjam-shop-production-2024-03-07");
    }

    #[test]
    fn registry_lists_active_streams() {
        let registry = StaticStreamRegistry::new([
            StreamInfo::new("b", "production", 0),
            StreamInfo::new("a", "production", 1),
        ]);
        assert_eq!(
            registry.active_stream_names(),
            vec!["a-production", "b-production"]
        );
        assert_eq!(registry.stream_info("a-production").unwrap().db_shard, 1);
        assert!(registry.stream_info("c-production").is_none());
        assert_eq!(registry.active_streams().len(), 2);
    }
}
