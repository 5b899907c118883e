//! Behaviour every `Provider` backend must share, run against each one.

use orderflow::providers::fs::FsProvider;
use orderflow::providers::sqlite::SqliteProvider;
use orderflow::providers::{InMemoryProvider, InstanceState, Provider, ProviderErrorKind, TerminalOutcome};
use orderflow::EventKind;
use std::sync::Arc;
use tempfile::TempDir;

mod common;

fn scheduled(call_seq: u64, name: &str) -> EventKind {
    EventKind::ActivityScheduled {
        call_seq,
        name: name.to_string(),
        input: "{}".to_string(),
    }
}

fn completed(call_seq: u64, result: &str) -> EventKind {
    EventKind::ActivityCompleted {
        call_seq,
        result: result.to_string(),
    }
}

async fn create_writes_started_event(store: Arc<dyn Provider>) {
    let record = store.create_instance("c-1", "OrderOrchestrator", "{\"Id\":1}").await.unwrap();
    assert_eq!(record.state, InstanceState::Running);
    assert_eq!(record.orchestration, "OrderOrchestrator");
    assert!(record.cancel_requested.is_none());

    let hist = store.read("c-1").await.unwrap();
    assert_eq!(hist.len(), 1);
    assert_eq!(hist[0].seq, 0);
    assert_eq!(
        hist[0].kind,
        EventKind::OrchestratorStarted {
            name: "OrderOrchestrator".into(),
            input: "{\"Id\":1}".into()
        }
    );
    assert_eq!(store.get_instance("c-1").await.unwrap(), Some(record));
}

async fn duplicate_create_is_rejected(store: Arc<dyn Provider>) {
    store.create_instance("dup", "A", "first").await.unwrap();
    let err = store.create_instance("dup", "A", "second").await.unwrap_err();
    assert_eq!(err.kind, ProviderErrorKind::DuplicateInstance);
    assert!(!err.is_retryable());

    let hist = store.read("dup").await.unwrap();
    assert_eq!(hist.len(), 1);
    assert_eq!(store.get_instance("dup").await.unwrap().unwrap().input, "first");
}

async fn append_assigns_consecutive_seqs(store: Arc<dyn Provider>) {
    store.create_instance("seq", "A", "").await.unwrap();
    let written = store
        .append("seq", 1, vec![scheduled(0, "X"), scheduled(1, "Y")])
        .await
        .unwrap();
    assert_eq!(written.iter().map(|e| e.seq).collect::<Vec<_>>(), vec![1, 2]);

    store.append("seq", 3, vec![completed(1, "y")]).await.unwrap();
    let hist = store.read("seq").await.unwrap();
    assert_eq!(hist.iter().map(|e| e.seq).collect::<Vec<_>>(), vec![0, 1, 2, 3]);
    assert_eq!(hist[3].kind, completed(1, "y"));
}

async fn stale_append_conflicts_and_writes_nothing(store: Arc<dyn Provider>) {
    store.create_instance("cas", "A", "").await.unwrap();
    store.append("cas", 1, vec![scheduled(0, "X")]).await.unwrap();

    let err = store.append("cas", 1, vec![scheduled(0, "Z")]).await.unwrap_err();
    assert_eq!(err.kind, ProviderErrorKind::SequenceConflict);
    assert!(err.is_retryable());

    let err = store
        .commit_terminal(
            "cas",
            5,
            vec![EventKind::OrchestratorCompleted { output: "o".into() }],
            TerminalOutcome::Completed { output: "o".into() },
        )
        .await
        .unwrap_err();
    assert_eq!(err.kind, ProviderErrorKind::SequenceConflict);

    assert_eq!(store.read("cas").await.unwrap().len(), 2);
    assert_eq!(
        store.get_instance("cas").await.unwrap().unwrap().state,
        InstanceState::Running
    );
}

async fn terminal_commit_is_atomic_and_final(store: Arc<dyn Provider>) {
    store.create_instance("term", "A", "").await.unwrap();
    store
        .commit_terminal(
            "term",
            1,
            vec![
                EventKind::ActivityFailed {
                    call_seq: 0,
                    reason: "declined".into(),
                },
                EventKind::OrchestratorFailed {
                    reason: "activity X failed: declined".into(),
                },
            ],
            TerminalOutcome::Failed {
                reason: "activity X failed: declined".into(),
            },
        )
        .await
        .unwrap();

    let record = store.get_instance("term").await.unwrap().unwrap();
    assert_eq!(record.state, InstanceState::Failed);
    assert_eq!(record.failure_reason.as_deref(), Some("activity X failed: declined"));
    assert!(record.output.is_none());
    assert_eq!(store.read("term").await.unwrap().len(), 3);

    let err = store.append("term", 3, vec![completed(0, "late")]).await.unwrap_err();
    assert_eq!(err.kind, ProviderErrorKind::InvalidTransition);
    assert!(!err.is_retryable());
    assert_eq!(store.read("term").await.unwrap().len(), 3);

    // Cancelling a finished instance changes nothing.
    store.request_cancellation("term", "too late").await.unwrap();
    let after = store.get_instance("term").await.unwrap().unwrap();
    assert_eq!(after.state, InstanceState::Failed);
    assert!(after.cancel_requested.is_none());
}

async fn unknown_instances(store: Arc<dyn Provider>) {
    assert_eq!(store.read("ghost").await.unwrap_err().kind, ProviderErrorKind::UnknownInstance);
    assert!(store.get_instance("ghost").await.unwrap().is_none());
    assert_eq!(
        store.append("ghost", 0, vec![scheduled(0, "X")]).await.unwrap_err().kind,
        ProviderErrorKind::UnknownInstance
    );
    assert_eq!(
        store.request_cancellation("ghost", "r").await.unwrap_err().kind,
        ProviderErrorKind::UnknownInstance
    );
}

async fn cancellation_request_is_recorded(store: Arc<dyn Provider>) {
    store.create_instance("cx", "A", "").await.unwrap();
    store.request_cancellation("cx", "customer withdrew").await.unwrap();
    let record = store.get_instance("cx").await.unwrap().unwrap();
    assert_eq!(record.state, InstanceState::Running);
    assert_eq!(record.cancel_requested.as_deref(), Some("customer withdrew"));
    // The request does not touch history.
    assert_eq!(store.read("cx").await.unwrap().len(), 1);
}

async fn list_filters_by_state(store: Arc<dyn Provider>) {
    for id in ["l-1", "l-2", "l-3"] {
        store.create_instance(id, "A", "").await.unwrap();
    }
    store
        .commit_terminal(
            "l-2",
            1,
            vec![EventKind::OrchestratorCompleted { output: "done".into() }],
            TerminalOutcome::Completed { output: "done".into() },
        )
        .await
        .unwrap();

    let mut all = store.list_instances(None).await.unwrap();
    all.sort();
    assert_eq!(all, vec!["l-1", "l-2", "l-3"]);
    let mut running = store.list_instances(Some(InstanceState::Running)).await.unwrap();
    running.sort();
    assert_eq!(running, vec!["l-1", "l-3"]);
    assert_eq!(store.list_instances(Some(InstanceState::Completed)).await.unwrap(), vec!["l-2"]);
    assert!(store.list_instances(Some(InstanceState::Cancelled)).await.unwrap().is_empty());
}

async fn run_contract<F, Fut>(make: F)
where
    F: Fn() -> Fut,
    Fut: std::future::Future<Output = (Arc<dyn Provider>, Option<TempDir>)>,
{
    macro_rules! check {
        ($case:ident) => {{
            let (store, _guard) = make().await;
            $case(store).await;
        }};
    }
    check!(create_writes_started_event);
    check!(duplicate_create_is_rejected);
    check!(append_assigns_consecutive_seqs);
    check!(stale_append_conflicts_and_writes_nothing);
    check!(terminal_commit_is_atomic_and_final);
    check!(unknown_instances);
    check!(cancellation_request_is_recorded);
    check!(list_filters_by_state);
}

#[tokio::test]
async fn in_memory_provider_contract() {
    run_contract(|| async { (Arc::new(InMemoryProvider::new()) as Arc<dyn Provider>, None) }).await;
}

#[tokio::test]
async fn fs_provider_contract() {
    run_contract(|| async {
        let (store, td) = common::create_fs_store().await;
        (store, Some(td))
    })
    .await;
}

#[tokio::test]
async fn sqlite_memory_provider_contract() {
    run_contract(|| async {
        let store = SqliteProvider::new_in_memory().await.unwrap();
        (Arc::new(store) as Arc<dyn Provider>, None)
    })
    .await;
}

#[tokio::test]
async fn sqlite_file_provider_contract() {
    run_contract(|| async {
        let (store, td) = common::create_sqlite_store_disk().await;
        (store, Some(td))
    })
    .await;
}

#[tokio::test]
async fn fs_history_survives_reopen() {
    let td = tempfile::tempdir().unwrap();
    {
        let store = FsProvider::new(td.path()).await.unwrap();
        store.create_instance("keep", "A", "in").await.unwrap();
        store.append("keep", 1, vec![scheduled(0, "X"), completed(0, "x")]).await.unwrap();
        store.request_cancellation("keep", "stop").await.unwrap();
    }
    let reopened = FsProvider::new(td.path()).await.unwrap();
    let hist = reopened.read("keep").await.unwrap();
    assert_eq!(hist.len(), 3);
    assert_eq!(hist[2].kind, completed(0, "x"));
    let record = reopened.get_instance("keep").await.unwrap().unwrap();
    assert_eq!(record.cancel_requested.as_deref(), Some("stop"));
    assert_eq!(reopened.list_instances(Some(InstanceState::Running)).await.unwrap(), vec!["keep"]);
}
