//! Per-minute counters as produced by the parsers, and their translation into
//! upsert selectors and `$inc` documents.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value, json};

use crate::{Error, Result};

#[derive(Clone, Copy, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct MetricSum {
    pub value: f64,
    pub value_squared: f64,
}

/// Counters for one namespace (a page, or a page within a minute).
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Increments {
    pub backend_request_count: u64,
    pub page_request_count: u64,
    pub ajax_request_count: u64,
    pub metrics: BTreeMap<String, MetricSum>,
    pub extra: Map<String, Value>,
}

impl Increments {
    pub fn frontend_request_count(&self) -> u64 {
        self.page_request_count + self.ajax_request_count
    }

    /// Record one observation of `resource`.
    pub fn add_metric(&mut self, resource: impl Into<String>, value: f64) {
        let sum = self.metrics.entry(resource.into()).or_default();
        sum.value += value;
        sum.value_squared += value * value;
    }

    /// Fold `other` into `self`. Numeric extras are added; others are replaced.
    pub fn merge(&mut self, other: &Increments) {
        self.backend_request_count += other.backend_request_count;
        self.page_request_count += other.page_request_count;
        self.ajax_request_count += other.ajax_request_count;
        for (name, m) in &other.metrics {
            let sum = self.metrics.entry(name.clone()).or_default();
            sum.value += m.value;
            sum.value_squared += m.value_squared;
        }
        for (name, value) in &other.extra {
            let merged = match (self.extra.get(name), value) {
                (Some(Value::Number(a)), Value::Number(b)) => match (a.as_i64(), b.as_i64()) {
                    (Some(a), Some(b)) => json!(a + b),
                    _ => json!(a.as_f64().unwrap_or(0.0) + b.as_f64().unwrap_or(0.0)),
                },
                _ => value.clone(),
            };
            self.extra.insert(name.clone(), merged);
        }
    }

    /// `{"$inc": {...}}` holding only non-zero counters, each metric with a
    /// positive value together with its `<name>_sq` companion, and numeric
    /// extras. Non-numeric extras are logged and left out.
    pub fn to_update_document(&self) -> Value {
        let mut inc = Map::new();
        if self.backend_request_count != 0 {
            inc.insert("count".into(), json!(self.backend_request_count));
        }
        if self.page_request_count != 0 {
            inc.insert("page_count".into(), json!(self.page_request_count));
        }
        if self.ajax_request_count != 0 {
            inc.insert("ajax_count".into(), json!(self.ajax_request_count));
        }
        let frontend = self.frontend_request_count();
        if frontend != 0 {
            inc.insert("frontend_count".into(), json!(frontend));
        }
        for (name, sum) in &self.metrics {
            if sum.value > 0.0 {
                inc.insert(name.clone(), json!(sum.value));
                inc.insert(format!("{name}_sq"), json!(sum.value_squared));
            }
        }
        for (name, value) in &self.extra {
            match value {
                Value::Number(_) => {
                    inc.insert(name.clone(), value.clone());
                }
                other => {
                    tracing::error!(
                        target: "logjam::increments",
                        key = %name,
                        value = %other,
                        "unsupported value type for increment, skipped"
                    );
                }
            }
        }
        json!({ "$inc": inc })
    }
}

/// Per-resource request counts for one quant bucket.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct QuantCounts(pub BTreeMap<String, u64>);

impl QuantCounts {
    pub fn add(&mut self, resource: impl Into<String>, count: u64) {
        *self.0.entry(resource.into()).or_default() += count;
    }

    pub fn to_update_document(&self) -> Value {
        let inc: Map<String, Value> = self
            .0
            .iter()
            .filter(|(_, count)| **count > 0)
            .map(|(resource, count)| (resource.clone(), json!(count)))
            .collect();
        json!({ "$inc": inc })
    }
}

impl<K: Into<String>> FromIterator<(K, u64)> for QuantCounts {
    fn from_iter<I: IntoIterator<Item = (K, u64)>>(iter: I) -> Self {
        let mut counts = QuantCounts::default();
        for (resource, count) in iter {
            counts.add(resource, count);
        }
        counts
    }
}

/// `totals` selector: the namespace key is the page.
pub fn totals_selector(page: &str) -> Map<String, Value> {
    let mut selector = Map::new();
    selector.insert("page".into(), json!(page));
    selector
}

/// `"<minute>-<page>"`
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct MinuteKey {
    pub minute: u32,
    pub page: String,
}

impl MinuteKey {
    pub fn parse(key: &str) -> Result<Self> {
        let malformed = || Error::MalformedKey {
            kind: "minutes",
            key: key.to_string(),
        };
        let (minute, page) = key.split_once('-').ok_or_else(malformed)?;
        if page.is_empty() || !is_digits(minute) {
            return Err(malformed());
        }
        Ok(Self {
            minute: minute.parse().map_err(|_| malformed())?,
            page: page.to_string(),
        })
    }

    pub fn selector(&self) -> Map<String, Value> {
        let mut selector = Map::new();
        selector.insert("page".into(), json!(self.page));
        selector.insert("minute".into(), json!(self.minute));
        selector
    }
}

/// `"<kind>-<quant>-<page>"` with a single-character kind.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct QuantKey {
    pub kind: char,
    pub quant: u64,
    pub page: String,
}

impl QuantKey {
    pub fn parse(key: &str) -> Result<Self> {
        let malformed = || Error::MalformedKey {
            kind: "quants",
            key: key.to_string(),
        };
        let mut parts = key.splitn(3, '-');
        let (Some(kind), Some(quant), Some(page)) = (parts.next(), parts.next(), parts.next())
        else {
            return Err(malformed());
        };
        let mut kind_chars = kind.chars();
        let (Some(kind), None) = (kind_chars.next(), kind_chars.next()) else {
            return Err(malformed());
        };
        if page.is_empty() || !is_digits(quant) {
            return Err(malformed());
        }
        Ok(Self {
            kind,
            quant: quant.parse().map_err(|_| malformed())?,
            page: page.to_string(),
        })
    }

    pub fn selector(&self) -> Map<String, Value> {
        let mut selector = Map::new();
        selector.insert("page".into(), json!(self.page));
        selector.insert("kind".into(), json!(self.kind.to_string()));
        selector.insert("quant".into(), json!(self.quant));
        selector
    }
}

fn is_digits(s: &str) -> bool {
    !s.is_empty() && s.bytes().all(|b| b.is_ascii_digit())
}
