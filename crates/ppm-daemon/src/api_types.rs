use serde::Serialize;

use ppm_engine::{Outcome, ProcessedSummary, RejectReason};
use ppm_ha::CoordinatorStatus;
use ppm_validate::ValidatorMetricsSnapshot;

/// Webhook envelope: every response carries the short request id that also
/// tags all log lines for the request.
#[derive(Debug, Serialize)]
pub struct WebhookResponse {
    pub status: &'static str,
    pub request_id: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub result: Option<ProcessedSummary>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reason: Option<RejectReason>,
}

impl WebhookResponse {
    pub fn from_outcome(request_id: String, outcome: Outcome) -> Self {
        match outcome {
            Outcome::Processed { result } => Self {
                status: "processed",
                request_id,
                result: Some(result),
                reason: None,
            },
            Outcome::Rejected { reason } => Self {
                status: "rejected",
                request_id,
                result: None,
                reason: Some(reason),
            },
            Outcome::Duplicate => Self {
                status: "duplicate",
                request_id,
                result: None,
                reason: None,
            },
            Outcome::Ignored => Self {
                status: "ignored",
                request_id,
                result: None,
                reason: None,
            },
        }
    }
}

/// Contract-violation response (HTTP 400): names the offending field.
#[derive(Debug, Serialize)]
pub struct BadRequestResponse {
    pub error: &'static str,
    pub request_id: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub field: Option<String>,
    pub detail: String,
}

#[derive(Debug, Serialize)]
pub struct HealthResponse {
    pub ok: bool,
    pub service: &'static str,
    pub version: &'static str,
}

#[derive(Debug, Serialize)]
pub struct ReadyResponse {
    pub ready: bool,
    pub db_ok: bool,
    pub cache_ok: bool,
}

/// GET /coordinator/leader payload.
#[derive(Debug, Serialize)]
pub struct LeaderResponse {
    #[serde(flatten)]
    pub coordinator: CoordinatorStatus,
    pub validator_metrics: ValidatorMetricsSnapshot,
}
