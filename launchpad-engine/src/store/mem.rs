//! In-memory store used by tests and `--in-memory` development serving.
//!
//! Shares the conditional-update contract with the Postgres store: the
//! write lock serializes writers, and a stale `expected` status loses
//! with `Error::Conflict`.

use std::collections::HashMap;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tokio::sync::RwLock;
use uuid::Uuid;

use launchpad_models::{
    ApprovalReminder, AuditEntry, Deployment, DeploymentRequest, Error, Identity, Operation,
    ParameterValues, PipelineRunRef, ReminderChannel, RequestStatus, Result, SubjectKind,
};

use super::RequestStore;

#[derive(Default)]
struct Inner {
    requests: HashMap<Uuid, DeploymentRequest>,
    operations: HashMap<Uuid, Operation>,
    deployments: HashMap<Uuid, Deployment>,
    audit: Vec<AuditEntry>,
    reminders: Vec<ApprovalReminder>,
}

#[derive(Default)]
pub struct MemStore {
    inner: RwLock<Inner>,
}

impl MemStore {
    pub fn new() -> Self {
        Self::default()
    }
}

fn conflict() -> Error {
    Error::Conflict("state changed, please refresh".to_string())
}

#[async_trait]
impl RequestStore for MemStore {
    async fn create_request(&self, request: &DeploymentRequest) -> Result<()> {
        let mut inner = self.inner.write().await;
        inner.requests.insert(request.id, request.clone());
        Ok(())
    }

    async fn get_request(&self, id: Uuid) -> Result<DeploymentRequest> {
        let inner = self.inner.read().await;
        inner
            .requests
            .get(&id)
            .cloned()
            .ok_or_else(|| Error::NotFound(format!("request {id} not found")))
    }

    async fn list_requests(&self, requester: Option<&str>) -> Result<Vec<DeploymentRequest>> {
        let inner = self.inner.read().await;
        let mut all: Vec<_> = inner
            .requests
            .values()
            .filter(|r| requester.map(|email| r.requester_email == email).unwrap_or(true))
            .cloned()
            .collect();
        all.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        Ok(all)
    }

    async fn set_request_decision(
        &self,
        id: Uuid,
        expected: RequestStatus,
        new_status: RequestStatus,
        approver: &Identity,
        rejection_reason: Option<String>,
    ) -> Result<DeploymentRequest> {
        let mut inner = self.inner.write().await;
        let request = inner
            .requests
            .get_mut(&id)
            .ok_or_else(|| Error::NotFound(format!("request {id} not found")))?;
        if request.status != expected {
            return Err(conflict());
        }
        let now = Utc::now();
        request.status = new_status;
        request.approver_email = Some(approver.email.clone());
        request.approver_name = Some(approver.name.clone());
        request.decided_at = Some(now);
        request.rejection_reason = rejection_reason;
        request.updated_at = now;
        Ok(request.clone())
    }

    async fn set_request_pipeline(
        &self,
        id: Uuid,
        expected: RequestStatus,
        new_status: RequestStatus,
        run: Option<PipelineRunRef>,
        failure_reason: Option<String>,
    ) -> Result<DeploymentRequest> {
        let mut inner = self.inner.write().await;
        let request = inner
            .requests
            .get_mut(&id)
            .ok_or_else(|| Error::NotFound(format!("request {id} not found")))?;
        if request.status != expected {
            return Err(conflict());
        }
        request.status = new_status;
        if run.is_some() {
            request.pipeline_run = run;
        }
        if failure_reason.is_some() {
            request.failure_reason = failure_reason;
        }
        request.updated_at = Utc::now();
        Ok(request.clone())
    }

    async fn list_pending_requests_older_than(
        &self,
        cutoff: DateTime<Utc>,
    ) -> Result<Vec<DeploymentRequest>> {
        let inner = self.inner.read().await;
        let mut pending: Vec<_> = inner
            .requests
            .values()
            .filter(|r| r.status == RequestStatus::PendingApproval && r.created_at < cutoff)
            .cloned()
            .collect();
        pending.sort_by(|a, b| a.created_at.cmp(&b.created_at));
        Ok(pending)
    }

    async fn list_deploying_requests_older_than(
        &self,
        cutoff: DateTime<Utc>,
    ) -> Result<Vec<DeploymentRequest>> {
        let inner = self.inner.read().await;
        Ok(inner
            .requests
            .values()
            .filter(|r| r.status == RequestStatus::Deploying && r.updated_at < cutoff)
            .cloned()
            .collect())
    }

    async fn create_operation(&self, operation: &Operation) -> Result<()> {
        let mut inner = self.inner.write().await;
        inner.operations.insert(operation.id, operation.clone());
        Ok(())
    }

    async fn get_operation(&self, id: Uuid) -> Result<Operation> {
        let inner = self.inner.read().await;
        inner
            .operations
            .get(&id)
            .cloned()
            .ok_or_else(|| Error::NotFound(format!("operation {id} not found")))
    }

    async fn list_operations(&self, deployment_id: Uuid) -> Result<Vec<Operation>> {
        let inner = self.inner.read().await;
        let mut all: Vec<_> = inner
            .operations
            .values()
            .filter(|o| o.deployment_id == deployment_id)
            .cloned()
            .collect();
        all.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        Ok(all)
    }

    async fn active_operation(&self, deployment_id: Uuid) -> Result<Option<Operation>> {
        let inner = self.inner.read().await;
        Ok(inner
            .operations
            .values()
            .find(|o| o.deployment_id == deployment_id && !o.status.is_terminal())
            .cloned())
    }

    async fn set_operation_decision(
        &self,
        id: Uuid,
        expected: RequestStatus,
        new_status: RequestStatus,
        approver: &Identity,
        rejection_reason: Option<String>,
    ) -> Result<Operation> {
        let mut inner = self.inner.write().await;
        let operation = inner
            .operations
            .get_mut(&id)
            .ok_or_else(|| Error::NotFound(format!("operation {id} not found")))?;
        if operation.status != expected {
            return Err(conflict());
        }
        let now = Utc::now();
        operation.status = new_status;
        operation.approver_email = Some(approver.email.clone());
        operation.approver_name = Some(approver.name.clone());
        operation.decided_at = Some(now);
        operation.rejection_reason = rejection_reason;
        operation.updated_at = now;
        Ok(operation.clone())
    }

    async fn set_operation_pipeline(
        &self,
        id: Uuid,
        expected: RequestStatus,
        new_status: RequestStatus,
        run: Option<PipelineRunRef>,
        failure_reason: Option<String>,
    ) -> Result<Operation> {
        let mut inner = self.inner.write().await;
        let operation = inner
            .operations
            .get_mut(&id)
            .ok_or_else(|| Error::NotFound(format!("operation {id} not found")))?;
        if operation.status != expected {
            return Err(conflict());
        }
        operation.status = new_status;
        if run.is_some() {
            operation.pipeline_run = run;
        }
        if failure_reason.is_some() {
            operation.failure_reason = failure_reason;
        }
        operation.updated_at = Utc::now();
        Ok(operation.clone())
    }

    async fn list_deploying_operations_older_than(
        &self,
        cutoff: DateTime<Utc>,
    ) -> Result<Vec<Operation>> {
        let inner = self.inner.read().await;
        Ok(inner
            .operations
            .values()
            .filter(|o| o.status == RequestStatus::Deploying && o.updated_at < cutoff)
            .cloned()
            .collect())
    }

    async fn create_deployment(&self, deployment: &Deployment) -> Result<()> {
        let mut inner = self.inner.write().await;
        inner.deployments.insert(deployment.id, deployment.clone());
        Ok(())
    }

    async fn get_deployment(&self, id: Uuid) -> Result<Deployment> {
        let inner = self.inner.read().await;
        inner
            .deployments
            .get(&id)
            .cloned()
            .ok_or_else(|| Error::NotFound(format!("deployment {id} not found")))
    }

    async fn get_deployment_by_request(&self, request_id: Uuid) -> Result<Option<Deployment>> {
        let inner = self.inner.read().await;
        Ok(inner
            .deployments
            .values()
            .find(|d| d.request_id == request_id)
            .cloned())
    }

    async fn list_deployments(&self, owner: Option<&str>) -> Result<Vec<Deployment>> {
        let inner = self.inner.read().await;
        let mut all: Vec<_> = inner
            .deployments
            .values()
            .filter(|d| owner.map(|email| d.owner_email == email).unwrap_or(true))
            .cloned()
            .collect();
        all.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        Ok(all)
    }

    async fn set_deployment_parameters(
        &self,
        id: Uuid,
        parameters: &ParameterValues,
    ) -> Result<Deployment> {
        let mut inner = self.inner.write().await;
        let deployment = inner
            .deployments
            .get_mut(&id)
            .ok_or_else(|| Error::NotFound(format!("deployment {id} not found")))?;
        deployment.parameters = parameters.clone();
        Ok(deployment.clone())
    }

    async fn set_deployment_destroyed(&self, id: Uuid, at: DateTime<Utc>) -> Result<Deployment> {
        let mut inner = self.inner.write().await;
        let deployment = inner
            .deployments
            .get_mut(&id)
            .ok_or_else(|| Error::NotFound(format!("deployment {id} not found")))?;
        deployment.health = launchpad_models::DeploymentHealth::Destroyed;
        deployment.destroyed_at = Some(at);
        Ok(deployment.clone())
    }

    async fn append_audit(&self, entry: &AuditEntry) -> Result<()> {
        let mut inner = self.inner.write().await;
        inner.audit.push(entry.clone());
        Ok(())
    }

    async fn list_audit(&self, kind: SubjectKind, subject_id: Uuid) -> Result<Vec<AuditEntry>> {
        let inner = self.inner.read().await;
        Ok(inner
            .audit
            .iter()
            .filter(|e| e.subject_kind == kind && e.subject_id == subject_id)
            .cloned()
            .collect())
    }

    async fn record_reminder(&self, reminder: &ApprovalReminder) -> Result<()> {
        let mut inner = self.inner.write().await;
        inner.reminders.push(reminder.clone());
        Ok(())
    }

    async fn has_reminder(&self, request_id: Uuid, channel: ReminderChannel) -> Result<bool> {
        let inner = self.inner.read().await;
        Ok(inner
            .reminders
            .iter()
            .any(|r| r.request_id == request_id && r.channel == channel))
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use launchpad_models::{Role, Tags};

    use super::*;

    fn pending_request() -> DeploymentRequest {
        let now = Utc::now();
        DeploymentRequest {
            id: Uuid::new_v4(),
            template_id: "vm-basic".to_string(),
            requester_email: "user@company.com".to_string(),
            requester_name: "Test User".to_string(),
            parameters: ParameterValues::new(),
            status: RequestStatus::PendingApproval,
            approver_email: None,
            approver_name: None,
            decided_at: None,
            rejection_reason: None,
            failure_reason: None,
            tags: Tags::default(),
            expires_at: None,
            pipeline_run: None,
            created_at: now,
            updated_at: now,
        }
    }

    fn approver() -> Identity {
        Identity::new("approver@company.com", "Test Approver", vec![Role::Approver])
    }

    #[tokio::test]
    async fn conditional_update_rejects_stale_expectation() {
        let store = MemStore::new();
        let request = pending_request();
        store.create_request(&request).await.unwrap();

        let updated = store
            .set_request_decision(
                request.id,
                RequestStatus::PendingApproval,
                RequestStatus::Approved,
                &approver(),
                None,
            )
            .await
            .unwrap();
        assert_eq!(updated.status, RequestStatus::Approved);
        assert_eq!(updated.approver_email.as_deref(), Some("approver@company.com"));

        let err = store
            .set_request_decision(
                request.id,
                RequestStatus::PendingApproval,
                RequestStatus::Approved,
                &approver(),
                None,
            )
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Conflict(_)));
    }

    #[tokio::test]
    async fn concurrent_writers_get_exactly_one_winner() {
        let store = Arc::new(MemStore::new());
        let request = pending_request();
        store.create_request(&request).await.unwrap();

        let mut handles = Vec::new();
        for _ in 0..2 {
            let store = store.clone();
            let id = request.id;
            handles.push(tokio::spawn(async move {
                store
                    .set_request_decision(
                        id,
                        RequestStatus::PendingApproval,
                        RequestStatus::Approved,
                        &approver(),
                        None,
                    )
                    .await
            }));
        }

        let mut wins = 0;
        let mut conflicts = 0;
        for handle in handles {
            match handle.await.unwrap() {
                Ok(_) => wins += 1,
                Err(Error::Conflict(_)) => conflicts += 1,
                Err(other) => panic!("unexpected error: {other}"),
            }
        }
        assert_eq!(wins, 1);
        assert_eq!(conflicts, 1);

        // A single consistent final state.
        let final_state = store.get_request(request.id).await.unwrap();
        assert_eq!(final_state.status, RequestStatus::Approved);
    }

    #[tokio::test]
    async fn active_operation_sees_only_non_terminal() {
        let store = MemStore::new();
        let deployment_id = Uuid::new_v4();
        let now = Utc::now();

        let mut op = Operation {
            id: Uuid::new_v4(),
            deployment_id,
            kind: launchpad_models::OperationKind::Scale,
            parameters: None,
            reason: None,
            requester_email: "user@company.com".to_string(),
            requester_name: "Test User".to_string(),
            status: RequestStatus::Completed,
            approver_email: None,
            approver_name: None,
            decided_at: None,
            rejection_reason: None,
            failure_reason: None,
            pipeline_run: None,
            created_at: now,
            updated_at: now,
        };
        store.create_operation(&op).await.unwrap();
        assert!(store.active_operation(deployment_id).await.unwrap().is_none());

        op.id = Uuid::new_v4();
        op.status = RequestStatus::PendingApproval;
        store.create_operation(&op).await.unwrap();
        let active = store.active_operation(deployment_id).await.unwrap().unwrap();
        assert_eq!(active.id, op.id);
    }
}
