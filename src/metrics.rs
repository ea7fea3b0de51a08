use std::fmt::Write as _;
use std::sync::OnceLock;
use std::sync::atomic::{AtomicU64, Ordering};

pub struct Metrics {
    // Updaters
    pub tasks_processed_total: AtomicU64,
    pub upserts_total: AtomicU64,
    pub upsert_retries_total: AtomicU64,
    pub upserts_dropped_total: AtomicU64,
    pub keys_skipped_total: AtomicU64,

    // Indexer
    pub index_requests_total: AtomicU64,
    pub indexes_created_total: AtomicU64,
    pub index_failures_total: AtomicU64,
    pub databases_provisioned_total: AtomicU64,

    // Storage
    pub storage_soft_limit_databases: AtomicU64,
    pub storage_hard_limit_databases: AtomicU64,

    // Wire
    pub envelopes_invalid_total: AtomicU64,
}

impl Default for Metrics {
    fn default() -> Self {
        Self {
            tasks_processed_total: AtomicU64::new(0),
            upserts_total: AtomicU64::new(0),
            upsert_retries_total: AtomicU64::new(0),
            upserts_dropped_total: AtomicU64::new(0),
            keys_skipped_total: AtomicU64::new(0),
            index_requests_total: AtomicU64::new(0),
            indexes_created_total: AtomicU64::new(0),
            index_failures_total: AtomicU64::new(0),
            databases_provisioned_total: AtomicU64::new(0),
            storage_soft_limit_databases: AtomicU64::new(0),
            storage_hard_limit_databases: AtomicU64::new(0),
            envelopes_invalid_total: AtomicU64::new(0),
        }
    }
}

static METRICS: OnceLock<Metrics> = OnceLock::new();

pub fn metrics() -> &'static Metrics {
    METRICS.get_or_init(Metrics::default)
}

pub fn record_upsert(attempts: u32) {
    let m = metrics();
    m.upserts_total.fetch_add(1, Ordering::Relaxed);
    if attempts > 1 {
        m.upsert_retries_total
            .fetch_add(u64::from(attempts - 1), Ordering::Relaxed);
    }
}

pub fn record_dropped_upsert(attempts: u32) {
    let m = metrics();
    m.upserts_dropped_total.fetch_add(1, Ordering::Relaxed);
    if attempts > 1 {
        m.upsert_retries_total
            .fetch_add(u64::from(attempts - 1), Ordering::Relaxed);
    }
}

pub fn record_index_result(ok: bool) {
    let m = metrics();
    if ok {
        m.indexes_created_total.fetch_add(1, Ordering::Relaxed);
    } else {
        m.index_failures_total.fetch_add(1, Ordering::Relaxed);
    }
}

pub fn set_storage_limit_gauges(soft: u64, hard: u64) {
    let m = metrics();
    m.storage_soft_limit_databases.store(soft, Ordering::Relaxed);
    m.storage_hard_limit_databases.store(hard, Ordering::Relaxed);
}

pub fn render_prometheus() -> String {
    let m = metrics();
    let mut s = String::new();
    let counters = [
        ("tasks_processed_total", &m.tasks_processed_total),
        ("upserts_total", &m.upserts_total),
        ("upsert_retries_total", &m.upsert_retries_total),
        ("upserts_dropped_total", &m.upserts_dropped_total),
        ("keys_skipped_total", &m.keys_skipped_total),
        ("index_requests_total", &m.index_requests_total),
        ("indexes_created_total", &m.indexes_created_total),
        ("index_failures_total", &m.index_failures_total),
        ("databases_provisioned_total", &m.databases_provisioned_total),
        ("envelopes_invalid_total", &m.envelopes_invalid_total),
    ];
    for (name, value) in counters {
        let _ = writeln!(
            s,
            "# TYPE {name} counter\n{name} {}",
            value.load(Ordering::Relaxed)
        );
    }
    // storage
    let _ = writeln!(
        s,
        "# TYPE storage_soft_limit_databases gauge\nstorage_soft_limit_databases {}",
        m.storage_soft_limit_databases.load(Ordering::Relaxed)
    );
    let _ = writeln!(
        s,
        "# TYPE storage_hard_limit_databases gauge\nstorage_hard_limit_databases {}",
        m.storage_hard_limit_databases.load(Ordering::Relaxed)
    );
    s
}
