use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

pub mod error;

pub use error::{Error, Result};

/// Parameter values supplied by a requester, keyed by parameter name.
pub type ParameterValues = BTreeMap<String, String>;

/// Represents the lifecycle status of a deployment request or operation.
///
/// Both entity kinds share a single status vocabulary; the transition
/// rules live in the lifecycle engine.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum RequestStatus {
    PendingApproval,
    Approved,
    Rejected,
    Deploying,
    Completed,
    Failed,
}

impl RequestStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Rejected | Self::Completed | Self::Failed)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::PendingApproval => "pending_approval",
            Self::Approved => "approved",
            Self::Rejected => "rejected",
            Self::Deploying => "deploying",
            Self::Completed => "completed",
            Self::Failed => "failed",
        }
    }
}

impl fmt::Display for RequestStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for RequestStatus {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "pending_approval" => Ok(Self::PendingApproval),
            "approved" => Ok(Self::Approved),
            "rejected" => Ok(Self::Rejected),
            "deploying" => Ok(Self::Deploying),
            "completed" => Ok(Self::Completed),
            "failed" => Ok(Self::Failed),
            other => Err(Error::Storage(format!("unknown request status '{other}'"))),
        }
    }
}

/// Health of a live deployment.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum DeploymentHealth {
    Healthy,
    Degraded,
    Unhealthy,
    Destroyed,
}

impl DeploymentHealth {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Healthy => "healthy",
            Self::Degraded => "degraded",
            Self::Unhealthy => "unhealthy",
            Self::Destroyed => "destroyed",
        }
    }
}

impl fmt::Display for DeploymentHealth {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for DeploymentHealth {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "healthy" => Ok(Self::Healthy),
            "degraded" => Ok(Self::Degraded),
            "unhealthy" => Ok(Self::Unhealthy),
            "destroyed" => Ok(Self::Destroyed),
            other => Err(Error::Storage(format!("unknown deployment health '{other}'"))),
        }
    }
}

/// Kind of operation against an existing deployment.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum OperationKind {
    Scale,
    Destroy,
}

impl OperationKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Scale => "scale",
            Self::Destroy => "destroy",
        }
    }
}

impl fmt::Display for OperationKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for OperationKind {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "scale" => Ok(Self::Scale),
            "destroy" => Ok(Self::Destroy),
            other => Err(Error::Storage(format!("unknown operation kind '{other}'"))),
        }
    }
}

/// Role held by a caller. Identity resolution happens upstream; the
/// engine only ever sees explicit identities, never ambient state.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum Role {
    User,
    Approver,
}

/// An authenticated caller as supplied by the fronting identity proxy.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Identity {
    pub email: String,
    pub name: String,
    pub roles: Vec<Role>,
}

impl Identity {
    pub fn new(email: impl Into<String>, name: impl Into<String>, roles: Vec<Role>) -> Self {
        Self {
            email: email.into(),
            name: name.into(),
            roles,
        }
    }

    pub fn is_approver(&self) -> bool {
        self.roles.contains(&Role::Approver)
    }
}

/// Free-form accounting tags attached to a request at submission.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct Tags {
    pub cost_center: Option<String>,
    pub environment_type: Option<String>,
    pub project_code: Option<String>,
}

/// Reference to a run in the external pipeline system.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct PipelineRunRef {
    pub run_id: i64,
    pub url: Option<String>,
}

/// A request to deploy a catalog template.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeploymentRequest {
    pub id: Uuid,
    pub template_id: String,
    pub requester_email: String,
    pub requester_name: String,
    pub parameters: ParameterValues,
    pub status: RequestStatus,
    pub approver_email: Option<String>,
    pub approver_name: Option<String>,
    pub decided_at: Option<DateTime<Utc>>,
    pub rejection_reason: Option<String>,
    pub failure_reason: Option<String>,
    pub tags: Tags,
    pub expires_at: Option<DateTime<Utc>>,
    pub pipeline_run: Option<PipelineRunRef>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// The live resource set created by a completed request.
///
/// Never deleted outright: destruction only flips the health to
/// `destroyed` so the audit trail stays intact.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Deployment {
    pub id: Uuid,
    pub request_id: Uuid,
    pub template_id: String,
    pub owner_email: String,
    pub health: DeploymentHealth,
    pub parameters: ParameterValues,
    pub expires_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    pub destroyed_at: Option<DateTime<Utc>>,
}

impl Deployment {
    /// A deployment past its expiration date surfaces as requiring
    /// action; it is never auto-destroyed.
    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        self.health != DeploymentHealth::Destroyed
            && self.expires_at.map(|at| at < now).unwrap_or(false)
    }
}

/// A scale or destroy request against an existing deployment.
///
/// Mirrors the request lifecycle; at most one operation per deployment
/// may be outside a terminal status at any time.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Operation {
    pub id: Uuid,
    pub deployment_id: Uuid,
    pub kind: OperationKind,
    pub parameters: Option<ParameterValues>,
    pub reason: Option<String>,
    pub requester_email: String,
    pub requester_name: String,
    pub status: RequestStatus,
    pub approver_email: Option<String>,
    pub approver_name: Option<String>,
    pub decided_at: Option<DateTime<Utc>>,
    pub rejection_reason: Option<String>,
    pub failure_reason: Option<String>,
    pub pipeline_run: Option<PipelineRunRef>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// What kind of entity an audit entry refers to.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum SubjectKind {
    Request,
    Operation,
    Deployment,
}

impl SubjectKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Request => "request",
            Self::Operation => "operation",
            Self::Deployment => "deployment",
        }
    }
}

impl fmt::Display for SubjectKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for SubjectKind {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "request" => Ok(Self::Request),
            "operation" => Ok(Self::Operation),
            "deployment" => Ok(Self::Deployment),
            other => Err(Error::Storage(format!("unknown subject kind '{other}'"))),
        }
    }
}

/// Append-only record of a lifecycle action.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuditEntry {
    pub id: Uuid,
    pub subject_kind: SubjectKind,
    pub subject_id: Uuid,
    pub actor_email: String,
    pub actor_name: String,
    pub action: String,
    pub detail: serde_json::Value,
    pub created_at: DateTime<Utc>,
}

/// Channel an approval reminder was sent over.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum ReminderChannel {
    Email,
    Chat,
}

impl ReminderChannel {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Email => "email",
            Self::Chat => "chat",
        }
    }
}

impl FromStr for ReminderChannel {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "email" => Ok(Self::Email),
            "chat" => Ok(Self::Chat),
            other => Err(Error::Storage(format!("unknown reminder channel '{other}'"))),
        }
    }
}

/// Tracks a reminder sent for a pending approval so it is not repeated.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ApprovalReminder {
    pub id: Uuid,
    pub request_id: Uuid,
    pub channel: ReminderChannel,
    pub sent_at: DateTime<Utc>,
}

// ============================================================================
// API payloads
// ============================================================================

/// Body of `POST /api/requests`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SubmitRequestBody {
    pub template_id: String,
    #[serde(default)]
    pub parameters: ParameterValues,
    #[serde(default)]
    pub tags: Tags,
    #[serde(default)]
    pub expires_at: Option<DateTime<Utc>>,
}

/// Body of `POST /api/requests/:id/reject` and operation rejections.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RejectBody {
    pub reason: String,
}

/// Body of `POST /api/deployments/:id/scale`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ScaleBody {
    pub parameters: ParameterValues,
    #[serde(default)]
    pub reason: Option<String>,
}

/// Body of `POST /api/deployments/:id/destroy`.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct DestroyBody {
    #[serde(default)]
    pub reason: Option<String>,
}

/// Outcome carried by an inbound pipeline callback.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum PipelineOutcome {
    Success,
    Failure,
}

/// Body of `POST /api/pipeline/callback`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CallbackBody {
    pub correlation_token: Uuid,
    pub outcome: PipelineOutcome,
    #[serde(default)]
    pub detail: Option<String>,
}

/// A request enriched with lazily evaluated expiration state.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RequestView {
    #[serde(flatten)]
    pub request: DeploymentRequest,
    pub expired: bool,
}

/// A deployment enriched with lazily evaluated expiration state.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeploymentView {
    #[serde(flatten)]
    pub deployment: Deployment,
    pub expired: bool,
}
