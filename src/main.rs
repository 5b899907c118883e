use std::sync::Arc;
use std::time::Duration;

use orderflow::gateway::OrderGateway;
use orderflow::orders::{self, PipelineMode};
use orderflow::providers::{FsProvider, Provider};
use orderflow::Runtime;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    orderflow::logging::init_tracing();

    // Filesystem-backed provider so history persists across runs
    let data_dir = std::env::var("ORDERFLOW_DATA_DIR").unwrap_or_else(|_| "./orderflow-data".to_string());
    let store = Arc::new(FsProvider::new(&data_dir).await?) as Arc<dyn Provider>;

    let rt = Runtime::start_with_store(
        store,
        Arc::new(orders::activity_registry()),
        orders::orchestration_registry(),
    )
    .await?;
    let gateway = OrderGateway::new(rt.clone(), PipelineMode::default());

    let body = br#"{"Id":1,"UserId":"u1","ProductName":"Mug","ProductPrice":9.99,"Quantity":2}"#;
    let accepted = gateway.start(body).await;
    println!("{} {}", accepted.status_code(), accepted.body());

    let instance_id = accepted.body()["id"]
        .as_str()
        .map(str::to_string)
        .ok_or_else(|| anyhow::anyhow!("order was not accepted"))?;
    rt.instances()
        .wait_for_terminal(&instance_id, Duration::from_secs(10))
        .await?;

    let status = gateway.status(&instance_id).await;
    println!("{} {}", status.status_code(), status.body());
    rt.shutdown().await;
    Ok(())
}
