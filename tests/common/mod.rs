#![allow(dead_code)]

pub mod fault_injection;

use orderflow::providers::fs::FsProvider;
use orderflow::providers::sqlite::SqliteProvider;
use orderflow::providers::Provider;
use orderflow::{BackoffStrategy, Event, EventKind, RetryPolicy, RuntimeOptions};
use std::sync::Arc as StdArc;
use std::time::{Duration, Instant};
use tempfile::TempDir;

pub const MUG_ORDER: &str = r#"{"Id":1,"UserId":"u1","ProductName":"Mug","ProductPrice":9.99,"Quantity":2}"#;

pub const ORDER_OUTPUTS: [&str; 4] = [
    "Inventory updated",
    "Payment processed",
    "Order history updated",
    "Notification sent",
];

pub async fn wait_for_history<F>(store: StdArc<dyn Provider>, instance: &str, predicate: F, timeout_ms: u64) -> bool
where
    F: Fn(&Vec<Event>) -> bool,
{
    let deadline = Instant::now() + Duration::from_millis(timeout_ms);
    loop {
        if let Ok(hist) = store.read(instance).await {
            if predicate(&hist) {
                return true;
            }
        }
        if Instant::now() > deadline {
            return false;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
}

/// Runtime options with no backoff so retry tests stay fast.
pub fn fast_options() -> RuntimeOptions {
    RuntimeOptions {
        activity_retry: RetryPolicy::new(3).with_backoff(BackoffStrategy::None),
        ..Default::default()
    }
}

pub fn scheduled_names(hist: &[Event]) -> Vec<String> {
    hist.iter()
        .filter_map(|e| match &e.kind {
            EventKind::ActivityScheduled { name, .. } => Some(name.clone()),
            _ => None,
        })
        .collect()
}

pub fn count_kind(hist: &[Event], type_name: &str) -> usize {
    hist.iter().filter(|e| e.kind.type_name() == type_name).count()
}

pub async fn create_fs_store() -> (StdArc<dyn Provider>, TempDir) {
    let td = tempfile::tempdir().unwrap();
    let store = StdArc::new(FsProvider::new(td.path()).await.unwrap()) as StdArc<dyn Provider>;
    (store, td)
}

pub fn sqlite_url(td: &TempDir) -> String {
    format!("sqlite:{}", td.path().join("test.db").display())
}

pub async fn create_sqlite_store_disk() -> (StdArc<dyn Provider>, TempDir) {
    let td = tempfile::tempdir().unwrap();
    let store = StdArc::new(SqliteProvider::new(&sqlite_url(&td)).await.unwrap()) as StdArc<dyn Provider>;
    (store, td)
}
