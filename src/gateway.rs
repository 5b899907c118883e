//! Entry point for order requests.
//!
//! `OrderGateway` turns raw request bodies into orchestration starts and
//! answers status queries. Responses carry an HTTP status code and a JSON
//! body but nothing here binds a socket; wire it into whatever server hosts
//! the runtime.

use std::sync::Arc;

use serde::Serialize;
use serde_json::{json, Value};
use tracing::{info, warn};

use crate::errors::OrchestrationError;
use crate::orders::{OrderPayload, PipelineMode};
use crate::providers::WorkflowInstance;
use crate::runtime::{OrchestrationStatus, Runtime};

/// Status resource returned by `OrderGateway::status`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct StatusBody {
    pub instance_id: String,
    pub runtime_status: String,
    /// The orchestration output as JSON; output that is not JSON is carried
    /// as a string.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub output: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub failure_reason: Option<String>,
    /// RFC 3339.
    pub created_at: String,
    pub last_updated_at: String,
}

impl StatusBody {
    fn from_record(record: &WorkflowInstance) -> Self {
        let status = OrchestrationStatus::from_instance(record);
        let (output, failure_reason) = match &status {
            OrchestrationStatus::Completed { output } => (Some(output_value(output)), None),
            OrchestrationStatus::Failed { reason } | OrchestrationStatus::Cancelled { reason } => {
                (None, Some(reason.clone()))
            }
            _ => (None, None),
        };
        Self {
            instance_id: record.instance_id.clone(),
            runtime_status: status.name().to_string(),
            output,
            failure_reason,
            created_at: rfc3339(record.created_at_ms),
            last_updated_at: rfc3339(record.updated_at_ms),
        }
    }
}

fn output_value(output: &str) -> Value {
    serde_json::from_str(output).unwrap_or_else(|_| Value::String(output.to_string()))
}

fn rfc3339(ms: u64) -> String {
    chrono::DateTime::from_timestamp_millis(ms as i64)
        .map(|t| t.to_rfc3339_opts(chrono::SecondsFormat::Millis, true))
        .unwrap_or_default()
}

/// HTTP-shaped gateway response.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum GatewayResponse {
    /// 202
    Accepted { instance_id: String, status_query_uri: String },
    /// 400
    BadRequest { message: String },
    /// 409
    Conflict { instance_id: String },
    /// 200
    Status(StatusBody),
    /// 404
    NotFound { instance_id: String },
    /// 500
    InternalError { message: String },
}

impl GatewayResponse {
    pub fn status_code(&self) -> u16 {
        match self {
            GatewayResponse::Accepted { .. } => 202,
            GatewayResponse::BadRequest { .. } => 400,
            GatewayResponse::Conflict { .. } => 409,
            GatewayResponse::Status(_) => 200,
            GatewayResponse::NotFound { .. } => 404,
            GatewayResponse::InternalError { .. } => 500,
        }
    }

    pub fn body(&self) -> Value {
        match self {
            GatewayResponse::Accepted {
                instance_id,
                status_query_uri,
            } => json!({ "id": instance_id, "statusQueryGetUri": status_query_uri }),
            GatewayResponse::BadRequest { message } | GatewayResponse::InternalError { message } => {
                json!({ "error": message })
            }
            GatewayResponse::Conflict { instance_id } => {
                json!({ "error": format!("instance {instance_id} already exists"), "id": instance_id })
            }
            GatewayResponse::Status(body) => serde_json::to_value(body).unwrap_or(Value::Null),
            GatewayResponse::NotFound { instance_id } => {
                json!({ "error": format!("instance {instance_id} not found"), "id": instance_id })
            }
        }
    }
}

pub struct OrderGateway {
    runtime: Arc<Runtime>,
    mode: PipelineMode,
    status_base_uri: String,
}

impl OrderGateway {
    pub fn new(runtime: Arc<Runtime>, mode: PipelineMode) -> Self {
        Self {
            runtime,
            mode,
            status_base_uri: "/api/orders".to_string(),
        }
    }

    /// Prefix for `statusQueryGetUri`; the instance id is appended.
    pub fn with_status_base_uri(mut self, base: impl Into<String>) -> Self {
        self.status_base_uri = base.into().trim_end_matches('/').to_string();
        self
    }

    pub fn mode(&self) -> PipelineMode {
        self.mode
    }

    /// Start an order under a generated id `order-<Id>-<uuid>`.
    pub async fn start(&self, body: &[u8]) -> GatewayResponse {
        let order = match Self::parse(body) {
            Ok(o) => o,
            Err(resp) => return resp,
        };
        let instance_id = format!("order-{}-{}", order.id, uuid::Uuid::new_v4());
        self.launch(&instance_id, body).await
    }

    /// Start an order under a caller-chosen id. A taken id yields 409.
    pub async fn start_with_instance_id(&self, instance_id: &str, body: &[u8]) -> GatewayResponse {
        if let Err(resp) = Self::parse(body) {
            return resp;
        }
        if instance_id.trim().is_empty() {
            return GatewayResponse::BadRequest {
                message: "instance id must not be empty".to_string(),
            };
        }
        self.launch(instance_id, body).await
    }

    pub async fn status(&self, instance_id: &str) -> GatewayResponse {
        match self.runtime.instances().get_instance(instance_id).await {
            Ok(Some(record)) => GatewayResponse::Status(StatusBody::from_record(&record)),
            Ok(None) => GatewayResponse::NotFound {
                instance_id: instance_id.to_string(),
            },
            Err(e) => GatewayResponse::InternalError { message: e.to_string() },
        }
    }

    fn parse(body: &[u8]) -> Result<OrderPayload, GatewayResponse> {
        let text = std::str::from_utf8(body).map_err(|e| GatewayResponse::BadRequest {
            message: format!("body is not UTF-8: {e}"),
        })?;
        OrderPayload::from_json(text).map_err(|message| {
            warn!(target: "orderflow::gateway", error = %message, "rejected order request");
            GatewayResponse::BadRequest { message }
        })
    }

    async fn launch(&self, instance_id: &str, body: &[u8]) -> GatewayResponse {
        // The body is forwarded untouched; the core treats it as opaque.
        let input = String::from_utf8_lossy(body).into_owned();
        match self
            .runtime
            .start_orchestration(instance_id, self.mode.orchestration_name(), input)
            .await
        {
            Ok(()) => {
                info!(target: "orderflow::gateway", instance_id = %instance_id, "order accepted");
                GatewayResponse::Accepted {
                    instance_id: instance_id.to_string(),
                    status_query_uri: format!("{}/{instance_id}", self.status_base_uri),
                }
            }
            Err(OrchestrationError::DuplicateInstance(id)) => GatewayResponse::Conflict { instance_id: id },
            Err(OrchestrationError::InvalidInstanceId(id)) => GatewayResponse::BadRequest {
                message: format!("invalid instance id {id:?}"),
            },
            Err(e) => GatewayResponse::InternalError { message: e.to_string() },
        }
    }
}
