use std::collections::HashMap;
use std::sync::{Arc, RwLock};

use serde_json::Value;

use crate::config::StorageLimits;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum StorageClass {
    Normal,
    SoftLimit,
    HardLimit,
}

impl StorageClass {
    pub fn classify(size: u64, limits: &StorageLimits) -> Self {
        if size > limits.hard {
            StorageClass::HardLimit
        } else if size > limits.soft {
            StorageClass::SoftLimit
        } else {
            StorageClass::Normal
        }
    }

    /// Prefix used in storage log lines.
    pub fn marker(self) -> &'static str {
        match self {
            StorageClass::Normal => "[I]",
            StorageClass::SoftLimit => "[W]",
            StorageClass::HardLimit => "[E]",
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct StorageReport {
    pub database: String,
    pub size: u64,
    pub class: StorageClass,
}

/// `storageSize` from a database stats document. Stores report it as a
/// 32-bit int, a 64-bit int or a double depending on magnitude.
pub fn extract_storage_size(stats: &Value) -> Option<u64> {
    let size = stats.get("storageSize")?;
    if let Some(n) = size.as_u64() {
        return Some(n);
    }
    if let Some(n) = size.as_i64() {
        return Some(n.max(0) as u64);
    }
    size.as_f64()
        .filter(|f| f.is_finite())
        .map(|f| f.max(0.0) as u64)
}

/// Latest storage classification per database, shared between the indexer
/// that samples it and whoever wants to enforce it.
#[derive(Clone, Debug, Default)]
pub struct StorageLedger {
    inner: Arc<RwLock<HashMap<String, StorageReport>>>,
}

impl StorageLedger {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record(&self, report: StorageReport) {
        let mut map = self.inner.write().expect("storage ledger poisoned");
        map.insert(report.database.clone(), report);
    }

    pub fn get(&self, database: &str) -> Option<StorageReport> {
        let map = self.inner.read().expect("storage ledger poisoned");
        map.get(database).cloned()
    }

    pub fn class_of(&self, database: &str) -> StorageClass {
        self.get(database)
            .map(|r| r.class)
            .unwrap_or(StorageClass::Normal)
    }

    pub fn over_limit(&self, class: StorageClass) -> Vec<String> {
        let map = self.inner.read().expect("storage ledger poisoned");
        let mut names: Vec<String> = map
            .values()
            .filter(|r| r.class == class)
            .map(|r| r.database.clone())
            .collect();
        names.sort();
        names
    }

    pub fn counts(&self) -> (u64, u64) {
        let map = self.inner.read().expect("storage ledger poisoned");
        map.values().fold((0, 0), |(soft, hard), r| match r.class {
            StorageClass::SoftLimit => (soft + 1, hard),
            StorageClass::HardLimit => (soft, hard + 1),
            StorageClass::Normal => (soft, hard),
        })
    }

    /// Forget databases not in `keep`, e.g. yesterday's after a rollover.
    pub fn retain(&self, keep: impl Fn(&str) -> bool) {
        let mut map = self.inner.write().expect("storage ledger poisoned");
        map.retain(|name, _| keep(name));
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;

    #[test]
    fn size_from_any_numeric_encoding() {
        assert_eq!(extract_storage_size(&json!({"storageSize": 4096i32})), Some(4096));
        assert_eq!(
            extract_storage_size(&json!({"storageSize": 8_589_934_592i64})),
            Some(8_589_934_592)
        );
        assert_eq!(
            extract_storage_size(&json!({"storageSize": 1.5e10})),
            Some(15_000_000_000)
        );
        assert_eq!(extract_storage_size(&json!({"storageSize": "big"})), None);
        assert_eq!(extract_storage_size(&json!({"dataSize": 1})), None);
    }

    #[test]
    fn classification_thresholds_are_exclusive() {
        let limits = StorageLimits { soft: 100, hard: 200 };
        assert_eq!(StorageClass::classify(100, &limits), StorageClass::Normal);
        assert_eq!(StorageClass::classify(101, &limits), StorageClass::SoftLimit);
        assert_eq!(StorageClass::classify(200, &limits), StorageClass::SoftLimit);
        assert_eq!(StorageClass::classify(201, &limits), StorageClass::HardLimit);
        assert_eq!(StorageClass::HardLimit.marker(), "[E]");
    }

    #[test]
    fn ledger_tracks_latest_report() {
        let ledger = StorageLedger::new();
        ledger.record(StorageReport {
            database: "a".into(),
            size: 300,
            class: StorageClass::HardLimit,
        });
        ledger.record(StorageReport {
            database: "b".into(),
            size: 150,
            class: StorageClass::SoftLimit,
        });
        assert_eq!(ledger.counts(), (1, 1));
        assert_eq!(ledger.over_limit(StorageClass::HardLimit), vec!["a"]);

        ledger.record(StorageReport {
            database: "a".into(),
            size: 10,
            class: StorageClass::Normal,
        });
        assert_eq!(ledger.class_of("a"), StorageClass::Normal);
        assert_eq!(ledger.class_of("unknown"), StorageClass::Normal);

        ledger.retain(|name| name != "b");
        assert!(ledger.get("b").is_none());
    }
}
