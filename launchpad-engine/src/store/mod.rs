//! Request store: the sole persistence boundary.
//!
//! Every status update is conditional on the entity's current status
//! matching the caller's expectation; a losing concurrent writer gets
//! `Error::Conflict` and must surface "state changed, please refresh"
//! instead of retrying blindly. Reads never block writers.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use uuid::Uuid;

use launchpad_models::{
    ApprovalReminder, AuditEntry, Deployment, DeploymentRequest, Identity, Operation,
    ParameterValues, PipelineRunRef, ReminderChannel, RequestStatus, Result, SubjectKind,
};

mod mem;
mod pg;

pub use mem::MemStore;
pub use pg::PgStore;

#[async_trait]
pub trait RequestStore: Send + Sync {
    // ------------------------------------------------------------------
    // Deployment requests
    // ------------------------------------------------------------------

    async fn create_request(&self, request: &DeploymentRequest) -> Result<()>;

    async fn get_request(&self, id: Uuid) -> Result<DeploymentRequest>;

    /// Newest first; `requester` limits to one user's requests.
    async fn list_requests(&self, requester: Option<&str>) -> Result<Vec<DeploymentRequest>>;

    /// Records an approve/reject decision. Conditional on `expected`.
    async fn set_request_decision(
        &self,
        id: Uuid,
        expected: RequestStatus,
        new_status: RequestStatus,
        approver: &Identity,
        rejection_reason: Option<String>,
    ) -> Result<DeploymentRequest>;

    /// Advances a request along the pipeline edges. `run` is recorded
    /// when present; `failure_reason` is recorded when present.
    /// Conditional on `expected`.
    async fn set_request_pipeline(
        &self,
        id: Uuid,
        expected: RequestStatus,
        new_status: RequestStatus,
        run: Option<PipelineRunRef>,
        failure_reason: Option<String>,
    ) -> Result<DeploymentRequest>;

    /// Pending-approval requests created before `cutoff` (reminder sweep).
    async fn list_pending_requests_older_than(
        &self,
        cutoff: DateTime<Utc>,
    ) -> Result<Vec<DeploymentRequest>>;

    /// Requests stuck in deploying since before `cutoff` (reconciliation).
    async fn list_deploying_requests_older_than(
        &self,
        cutoff: DateTime<Utc>,
    ) -> Result<Vec<DeploymentRequest>>;

    // ------------------------------------------------------------------
    // Operations
    // ------------------------------------------------------------------

    async fn create_operation(&self, operation: &Operation) -> Result<()>;

    async fn get_operation(&self, id: Uuid) -> Result<Operation>;

    async fn list_operations(&self, deployment_id: Uuid) -> Result<Vec<Operation>>;

    /// The single non-terminal operation on a deployment, if any.
    async fn active_operation(&self, deployment_id: Uuid) -> Result<Option<Operation>>;

    async fn set_operation_decision(
        &self,
        id: Uuid,
        expected: RequestStatus,
        new_status: RequestStatus,
        approver: &Identity,
        rejection_reason: Option<String>,
    ) -> Result<Operation>;

    async fn set_operation_pipeline(
        &self,
        id: Uuid,
        expected: RequestStatus,
        new_status: RequestStatus,
        run: Option<PipelineRunRef>,
        failure_reason: Option<String>,
    ) -> Result<Operation>;

    async fn list_deploying_operations_older_than(
        &self,
        cutoff: DateTime<Utc>,
    ) -> Result<Vec<Operation>>;

    // ------------------------------------------------------------------
    // Deployments
    // ------------------------------------------------------------------

    async fn create_deployment(&self, deployment: &Deployment) -> Result<()>;

    async fn get_deployment(&self, id: Uuid) -> Result<Deployment>;

    async fn get_deployment_by_request(&self, request_id: Uuid) -> Result<Option<Deployment>>;

    async fn list_deployments(&self, owner: Option<&str>) -> Result<Vec<Deployment>>;

    /// Replaces the parameter snapshot (completed scale operation).
    async fn set_deployment_parameters(
        &self,
        id: Uuid,
        parameters: &ParameterValues,
    ) -> Result<Deployment>;

    /// Marks the deployment destroyed (completed destroy operation).
    /// The row is retained for audit.
    async fn set_deployment_destroyed(&self, id: Uuid, at: DateTime<Utc>) -> Result<Deployment>;

    // ------------------------------------------------------------------
    // Audit & reminders
    // ------------------------------------------------------------------

    /// Append-only; entries are never mutated or deleted.
    async fn append_audit(&self, entry: &AuditEntry) -> Result<()>;

    async fn list_audit(&self, kind: SubjectKind, subject_id: Uuid) -> Result<Vec<AuditEntry>>;

    async fn record_reminder(&self, reminder: &ApprovalReminder) -> Result<()>;

    async fn has_reminder(&self, request_id: Uuid, channel: ReminderChannel) -> Result<bool>;
}
