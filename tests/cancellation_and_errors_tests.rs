//! Cancellation, retries and the ways an orchestration can fail.

use orderflow::orders::{self, ORDER_ACTIVITIES, ORDER_ORCHESTRATION, PROCESS_PAYMENT, UPDATE_INVENTORY};
use orderflow::providers::{InMemoryProvider, Provider};
use orderflow::runtime::registry::{ActivityRegistry, OrchestrationRegistry};
use orderflow::{
    ActivityContext, ActivityError, EventKind, OrchestrationContext, OrchestrationError, OrchestrationStatus, Runtime,
};
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Notify;

mod common;
use common::{count_kind, fast_options, scheduled_names, MUG_ORDER};

const WAIT: Duration = Duration::from_secs(5);

#[tokio::test]
async fn cancel_running_order_drops_late_completion() {
    let release = Arc::new(Notify::new());
    let gate = release.clone();
    let activities = ActivityRegistry::builder()
        .register(UPDATE_INVENTORY, move |_ctx: ActivityContext, _input: String| {
            let gate = gate.clone();
            async move {
                gate.notified().await;
                Ok("Inventory updated".to_string())
            }
        })
        .build();
    let rt = Runtime::start(Arc::new(activities), orders::orchestration_registry())
        .await
        .unwrap();
    rt.start_orchestration("order-cancel", ORDER_ORCHESTRATION, MUG_ORDER)
        .await
        .unwrap();

    rt.cancel_instance("order-cancel", "customer withdrew").await.unwrap();
    assert_eq!(
        rt.instances().get_status("order-cancel").await.unwrap(),
        OrchestrationStatus::Cancelled {
            reason: "customer withdrew".into()
        }
    );
    let at_cancel = rt.store().read("order-cancel").await.unwrap();
    assert!(matches!(at_cancel.last().unwrap().kind, EventKind::OrchestratorCancelled { .. }));

    // Let the activity finish; its result must not reach history.
    release.notify_one();
    tokio::time::sleep(Duration::from_millis(100)).await;
    assert_eq!(rt.store().read("order-cancel").await.unwrap(), at_cancel);

    // Cancelling again is a no-op.
    rt.cancel_instance("order-cancel", "again").await.unwrap();
    assert_eq!(rt.store().read("order-cancel").await.unwrap(), at_cancel);
    rt.shutdown().await;
}

#[tokio::test]
async fn cancel_unknown_instance_is_an_error() {
    let rt = Runtime::start(Arc::new(orders::activity_registry()), orders::orchestration_registry())
        .await
        .unwrap();
    let err = rt.cancel_instance("nobody", "r").await.unwrap_err();
    assert_eq!(err, OrchestrationError::UnknownInstance("nobody".into()));
    rt.shutdown().await;
}

#[tokio::test]
async fn transient_failures_are_retried_without_new_history() {
    let attempts = Arc::new(AtomicU32::new(0));
    let seen = attempts.clone();
    let activities = ActivityRegistry::builder()
        .register(UPDATE_INVENTORY, orders::update_inventory)
        .register(PROCESS_PAYMENT, move |ctx: ActivityContext, _input: String| {
            let seen = seen.clone();
            async move {
                seen.fetch_add(1, Ordering::SeqCst);
                if ctx.attempt < 3 {
                    Err(ActivityError::transient("gateway timeout"))
                } else {
                    Ok(format!("Payment processed ({})", ctx.idempotency_key()))
                }
            }
        })
        .register(ORDER_ACTIVITIES[2], orders::update_order_history)
        .register(ORDER_ACTIVITIES[3], orders::send_notification)
        .build();
    let rt = Runtime::start_with_options(
        Arc::new(InMemoryProvider::new()),
        Arc::new(activities),
        orders::orchestration_registry(),
        fast_options(),
    )
    .await
    .unwrap();
    rt.start_orchestration("order-retry", ORDER_ORCHESTRATION, MUG_ORDER)
        .await
        .unwrap();

    let status = rt.instances().wait_for_terminal("order-retry", WAIT).await.unwrap();
    let OrchestrationStatus::Completed { output } = status else {
        panic!("unexpected status {status:?}");
    };
    assert_eq!(attempts.load(Ordering::SeqCst), 3);
    let outputs = orders::decode_outputs(&output).unwrap();
    assert_eq!(outputs[1], "Payment processed (order-retry:1)");

    let hist = rt.store().read("order-retry").await.unwrap();
    assert_eq!(count_kind(&hist, "ActivityScheduled"), 4);
    assert_eq!(count_kind(&hist, "ActivityCompleted"), 4);
    assert_eq!(count_kind(&hist, "ActivityFailed"), 0);
    rt.shutdown().await;
}

#[tokio::test]
async fn exhausted_retries_fail_the_order() {
    let activities = ActivityRegistry::builder()
        .register(UPDATE_INVENTORY, |_ctx: ActivityContext, _input: String| async move {
            Err::<String, _>(ActivityError::transient("inventory service unavailable"))
        })
        .build();
    let rt = Runtime::start_with_options(
        Arc::new(InMemoryProvider::new()),
        Arc::new(activities),
        orders::orchestration_registry(),
        fast_options(),
    )
    .await
    .unwrap();
    rt.start_orchestration("order-exhausted", ORDER_ORCHESTRATION, MUG_ORDER)
        .await
        .unwrap();

    let status = rt.instances().wait_for_terminal("order-exhausted", WAIT).await.unwrap();
    let OrchestrationStatus::Failed { reason } = status else {
        panic!("unexpected status {status:?}");
    };
    assert!(reason.contains("retries exhausted after 3 attempts"), "{reason}");
    assert!(reason.contains("inventory service unavailable"), "{reason}");
    let hist = rt.store().read("order-exhausted").await.unwrap();
    assert_eq!(scheduled_names(&hist), vec![UPDATE_INVENTORY]);
    rt.shutdown().await;
}

#[tokio::test]
async fn changed_orchestration_code_is_detected_on_replay() {
    let store: Arc<dyn Provider> = Arc::new(InMemoryProvider::new());
    store.create_instance("flip", "Flip", "in").await.unwrap();
    store
        .append(
            "flip",
            1,
            vec![EventKind::ActivityScheduled {
                call_seq: 0,
                name: "A".into(),
                input: "in".into(),
            }],
        )
        .await
        .unwrap();

    // The deployed code now calls B first.
    let activities = ActivityRegistry::builder()
        .register("A", |_ctx: ActivityContext, input: String| async move { Ok(input) })
        .register("B", |_ctx: ActivityContext, input: String| async move { Ok(input) })
        .build();
    let orchestrations = OrchestrationRegistry::builder()
        .register("Flip", |ctx: OrchestrationContext, input: String| async move {
            ctx.schedule_activity("B", input).await
        })
        .build();
    let rt = Runtime::start_with_store(store.clone(), Arc::new(activities), orchestrations)
        .await
        .unwrap();

    let OrchestrationStatus::Failed { reason } = rt.instances().get_status("flip").await.unwrap() else {
        panic!("instance should have failed");
    };
    assert!(reason.starts_with("nondeterministic orchestration:"), "{reason}");
    assert_eq!(scheduled_names(&store.read("flip").await.unwrap()), vec!["A"]);
    rt.shutdown().await;
}

#[tokio::test]
async fn orchestration_panics_and_bare_suspensions_fail() {
    let orchestrations = OrchestrationRegistry::builder()
        .register("Panics", |_ctx: OrchestrationContext, _input: String| async move {
            if true {
                panic!("bad order state");
            }
            Ok(String::new())
        })
        .register("Stalls", |_ctx: OrchestrationContext, _input: String| async move {
            ::futures::future::pending::<()>().await;
            Ok(String::new())
        })
        .register("Rejects", |_ctx: OrchestrationContext, input: String| async move {
            Err(format!("rejected {input}"))
        })
        .build();
    let rt = Runtime::start(Arc::new(ActivityRegistry::builder().build()), orchestrations)
        .await
        .unwrap();

    rt.start_orchestration("p", "Panics", "x").await.unwrap();
    rt.start_orchestration("s", "Stalls", "x").await.unwrap();
    rt.start_orchestration("r", "Rejects", "x").await.unwrap();

    let status = |id: &'static str| {
        let rt = rt.clone();
        async move { rt.instances().get_status(id).await.unwrap() }
    };
    let OrchestrationStatus::Failed { reason } = status("p").await else {
        panic!("panicking orchestration should fail");
    };
    assert!(reason.contains("orchestration panicked: bad order state"), "{reason}");
    assert_eq!(
        status("s").await,
        OrchestrationStatus::Failed {
            reason: "orchestration suspended without awaiting an activity".into()
        }
    );
    assert_eq!(
        status("r").await,
        OrchestrationStatus::Failed {
            reason: "rejected x".into()
        }
    );
    rt.shutdown().await;
}

#[tokio::test]
async fn unregistered_orchestration_stays_running_until_registered() {
    let store: Arc<dyn Provider> = Arc::new(InMemoryProvider::new());
    store.create_instance("later", "Later", "in").await.unwrap();

    let rt1 = Runtime::start_with_store(
        store.clone(),
        Arc::new(orders::activity_registry()),
        orders::orchestration_registry(),
    )
    .await
    .unwrap();
    assert_eq!(rt1.instances().get_status("later").await.unwrap(), OrchestrationStatus::Running);
    assert_eq!(store.read("later").await.unwrap().len(), 1);
    rt1.shutdown().await;

    let orchestrations = OrchestrationRegistry::builder()
        .register("Later", |_ctx: OrchestrationContext, input: String| async move { Ok(input) })
        .build();
    let rt2 = Runtime::start_with_store(store.clone(), Arc::new(ActivityRegistry::builder().build()), orchestrations)
        .await
        .unwrap();
    assert_eq!(
        rt2.instances().get_status("later").await.unwrap(),
        OrchestrationStatus::Completed { output: "in".into() }
    );
    rt2.shutdown().await;
}
