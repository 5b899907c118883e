//! The order workflow: payload, activities, and both orchestration shapes.
//!
//! The four activities are logging stubs standing in for the inventory,
//! payment, order-history and notification services. Each receives the raw
//! order JSON and returns a fixed confirmation string.

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use tracing::info;

use crate::codec::{Codec, Json};
use crate::errors::ActivityError;
use crate::runtime::registry::{
    ActivityContext, ActivityRegistry, ActivityRegistryBuilder, OrchestrationRegistry, OrchestrationRegistryBuilder,
};
use crate::{durable_info, OrchestrationContext};

pub const ORDER_ORCHESTRATION: &str = "OrderOrchestrator";
pub const ORDER_FAN_OUT_ORCHESTRATION: &str = "OrderOrchestratorFanOut";

pub const UPDATE_INVENTORY: &str = "UpdateInventory";
pub const PROCESS_PAYMENT: &str = "ProcessPayment";
pub const UPDATE_ORDER_HISTORY: &str = "UpdateOrderHistory";
pub const SEND_NOTIFICATION: &str = "SendNotification";

/// Activity names in call order.
pub const ORDER_ACTIVITIES: [&str; 4] = [UPDATE_INVENTORY, PROCESS_PAYMENT, UPDATE_ORDER_HISTORY, SEND_NOTIFICATION];

/// Which orchestration shape new orders run under.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum PipelineMode {
    /// Each activity starts after the previous one completed.
    #[default]
    Sequential,
    /// All four activities are scheduled together and joined.
    FanOut,
}

impl PipelineMode {
    pub fn orchestration_name(&self) -> &'static str {
        match self {
            PipelineMode::Sequential => ORDER_ORCHESTRATION,
            PipelineMode::FanOut => ORDER_FAN_OUT_ORCHESTRATION,
        }
    }
}

/// Order as submitted by clients.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct OrderPayload {
    pub id: i64,
    #[serde(default)]
    pub user_id: String,
    #[serde(default)]
    pub product_name: String,
    #[serde(default)]
    pub product_description: String,
    pub product_price: Decimal,
    pub quantity: i32,
    #[serde(default)]
    pub purchase_date: Option<DateTime<Utc>>,
    #[serde(default)]
    pub is_confirmed: bool,
}

impl OrderPayload {
    pub fn validate(&self) -> Result<(), String> {
        if self.user_id.trim().is_empty() {
            return Err("UserId is required".to_string());
        }
        if self.product_name.trim().is_empty() {
            return Err("ProductName is required".to_string());
        }
        if self.quantity < 1 {
            return Err(format!("Quantity must be at least 1, got {}", self.quantity));
        }
        if self.product_price < Decimal::ZERO {
            return Err(format!("ProductPrice must not be negative, got {}", self.product_price));
        }
        Ok(())
    }

    /// Decode and validate a JSON body.
    pub fn from_json(body: &str) -> Result<Self, String> {
        let order: OrderPayload = serde_json::from_str(body).map_err(|e| format!("invalid order payload: {e}"))?;
        order.validate()?;
        Ok(order)
    }
}

fn decode_order(ctx: &ActivityContext, input: &str) -> Result<OrderPayload, ActivityError> {
    serde_json::from_str(input)
        .map_err(|e| ActivityError::permanent(format!("{} received an unreadable order: {e}", ctx.activity_name)))
}

pub async fn update_inventory(ctx: ActivityContext, input: String) -> Result<String, ActivityError> {
    let order = decode_order(&ctx, &input)?;
    info!(
        target: "orderflow::orders",
        instance_id = %ctx.instance_id,
        order_id = order.id,
        product = %order.product_name,
        quantity = order.quantity,
        "Updating inventory"
    );
    Ok("Inventory updated".to_string())
}

pub async fn process_payment(ctx: ActivityContext, input: String) -> Result<String, ActivityError> {
    let order = decode_order(&ctx, &input)?;
    let total = order.product_price * Decimal::from(order.quantity);
    info!(
        target: "orderflow::orders",
        instance_id = %ctx.instance_id,
        order_id = order.id,
        user_id = %order.user_id,
        total = %total,
        idempotency_key = %ctx.idempotency_key(),
        "Processing payment"
    );
    Ok("Payment processed".to_string())
}

pub async fn update_order_history(ctx: ActivityContext, input: String) -> Result<String, ActivityError> {
    let order = decode_order(&ctx, &input)?;
    info!(
        target: "orderflow::orders",
        instance_id = %ctx.instance_id,
        order_id = order.id,
        user_id = %order.user_id,
        "Updating order history"
    );
    Ok("Order history updated".to_string())
}

pub async fn send_notification(ctx: ActivityContext, input: String) -> Result<String, ActivityError> {
    let order = decode_order(&ctx, &input)?;
    info!(
        target: "orderflow::orders",
        instance_id = %ctx.instance_id,
        order_id = order.id,
        user_id = %order.user_id,
        "Sending notification"
    );
    Ok("Notification sent".to_string())
}

/// Strict sequential pipeline. Output is the JSON array of activity results.
pub async fn sequential_order(ctx: OrchestrationContext, input: String) -> Result<String, String> {
    durable_info!(ctx, mode = "sequential", "processing order");
    let mut outputs = Vec::with_capacity(ORDER_ACTIVITIES.len());
    for name in ORDER_ACTIVITIES {
        outputs.push(ctx.schedule_activity(name, input.clone()).await?);
    }
    durable_info!(ctx, steps = outputs.len(), "order processed");
    Json::encode(&outputs)
}

/// Fan-out/join pipeline. Results are in call order, whatever order the
/// activities finished in.
pub async fn fan_out_order(ctx: OrchestrationContext, input: String) -> Result<String, String> {
    durable_info!(ctx, mode = "fan-out", "processing order");
    let calls: Vec<_> = ORDER_ACTIVITIES
        .iter()
        .map(|name| ctx.schedule_activity(*name, input.clone()))
        .collect();
    let outputs = ::futures::future::join_all(calls)
        .await
        .into_iter()
        .collect::<Result<Vec<String>, String>>()?;
    durable_info!(ctx, steps = outputs.len(), "order processed");
    Json::encode(&outputs)
}

pub fn register_activities(builder: ActivityRegistryBuilder) -> ActivityRegistryBuilder {
    builder
        .register(UPDATE_INVENTORY, update_inventory)
        .register(PROCESS_PAYMENT, process_payment)
        .register(UPDATE_ORDER_HISTORY, update_order_history)
        .register(SEND_NOTIFICATION, send_notification)
}

pub fn register_orchestrations(builder: OrchestrationRegistryBuilder) -> OrchestrationRegistryBuilder {
    builder
        .register(ORDER_ORCHESTRATION, sequential_order)
        .register(ORDER_FAN_OUT_ORCHESTRATION, fan_out_order)
}

pub fn activity_registry() -> ActivityRegistry {
    register_activities(ActivityRegistry::builder()).build()
}

pub fn orchestration_registry() -> OrchestrationRegistry {
    register_orchestrations(OrchestrationRegistry::builder()).build()
}

/// Decode a completed order orchestration's output.
pub fn decode_outputs(output: &str) -> Result<Vec<String>, String> {
    Json::decode(output)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::str::FromStr;

    fn mug() -> OrderPayload {
        OrderPayload {
            id: 1,
            user_id: "u1".into(),
            product_name: "Mug".into(),
            product_description: String::new(),
            product_price: Decimal::from_str("9.99").unwrap(),
            quantity: 2,
            purchase_date: None,
            is_confirmed: false,
        }
    }

    #[test]
    fn payload_uses_pascal_case() {
        let body = r#"{"Id":1,"UserId":"u1","ProductName":"Mug","ProductPrice":9.99,"Quantity":2}"#;
        let order = OrderPayload::from_json(body).unwrap();
        assert_eq!(order, mug());
        let json = serde_json::to_string(&order).unwrap();
        assert!(json.contains("\"ProductName\":\"Mug\""));
    }

    #[test]
    fn validation_rejects_bad_orders() {
        let mut order = mug();
        order.quantity = 0;
        assert!(order.validate().unwrap_err().contains("Quantity"));

        let mut order = mug();
        order.product_price = Decimal::from(-1);
        assert!(order.validate().unwrap_err().contains("ProductPrice"));

        let mut order = mug();
        order.user_id = "  ".into();
        assert!(order.validate().unwrap_err().contains("UserId"));

        assert!(OrderPayload::from_json("{not json").is_err());
    }

    #[tokio::test]
    async fn activities_reject_unreadable_input() {
        let ctx = ActivityContext {
            instance_id: "i".into(),
            call_seq: 1,
            activity_name: PROCESS_PAYMENT.into(),
            attempt: 1,
        };
        let err = process_payment(ctx, "garbage".into()).await.unwrap_err();
        assert!(!err.is_retryable());
        assert!(err.message().contains("ProcessPayment"));
    }

    #[test]
    fn registries_contain_the_order_workflow() {
        let acts = activity_registry();
        for name in ORDER_ACTIVITIES {
            assert!(acts.has(name), "{name} missing");
        }
        let orchs = orchestration_registry();
        assert!(orchs.has(PipelineMode::default().orchestration_name()));
        assert!(orchs.has(PipelineMode::FanOut.orchestration_name()));
    }
}
