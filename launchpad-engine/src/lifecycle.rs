//! Lifecycle engine: the write path for requests, operations and
//! deployments.
//!
//! Every state change goes through a conditional store update keyed on
//! the status the caller observed, so concurrent deciders resolve to
//! exactly one winner. Pipeline triggering happens after the approval is
//! committed; a trigger failure fails the request rather than undoing
//! the approval.

use std::sync::Arc;

use chrono::{DateTime, Duration, Utc};
use uuid::Uuid;

use launchpad_models::{
    AuditEntry, Deployment, DeploymentHealth, DeploymentRequest, DeploymentView, DestroyBody,
    Error, Identity, Operation, OperationKind, ParameterValues, PipelineOutcome, RejectBody,
    RequestStatus, RequestView, Result, ScaleBody, SubjectKind, SubmitRequestBody,
};

use crate::catalog::{validate_parameters, CatalogRegistry, Template};
use crate::dispatch::{Dispatcher, NotificationEvent, NotificationKind};
use crate::pipeline::{PipelineGateway, PipelineRunState};
use crate::store::RequestStore;
use crate::transition::{next_status, Action};

const SYSTEM_EMAIL: &str = "system";
const SYSTEM_NAME: &str = "launchpad";

pub struct LifecycleEngine {
    store: Arc<dyn RequestStore>,
    catalog: Arc<dyn CatalogRegistry>,
    gateway: Arc<dyn PipelineGateway>,
    dispatcher: Dispatcher,
    portal_base_url: Option<String>,
    approver_recipients: Vec<String>,
}

impl LifecycleEngine {
    pub fn new(
        store: Arc<dyn RequestStore>,
        catalog: Arc<dyn CatalogRegistry>,
        gateway: Arc<dyn PipelineGateway>,
        dispatcher: Dispatcher,
        portal_base_url: Option<String>,
        approver_recipients: Vec<String>,
    ) -> Self {
        Self {
            store,
            catalog,
            gateway,
            dispatcher,
            portal_base_url,
            approver_recipients,
        }
    }

    // ========================================================================
    // Catalog passthrough
    // ========================================================================

    pub fn templates(&self) -> Vec<Template> {
        self.catalog.list()
    }

    pub fn template(&self, id: &str) -> Option<Template> {
        self.catalog.get_template(id)
    }

    // ========================================================================
    // Deployment requests
    // ========================================================================

    pub async fn submit_request(
        &self,
        caller: &Identity,
        body: SubmitRequestBody,
    ) -> Result<DeploymentRequest> {
        let template = self.catalog.get_template(&body.template_id).ok_or_else(|| {
            Error::Validation(format!("unknown template '{}'", body.template_id))
        })?;
        let parameters = validate_parameters(&template, &body.parameters)?;

        let now = Utc::now();
        let request = DeploymentRequest {
            id: Uuid::new_v4(),
            template_id: template.id.clone(),
            requester_email: caller.email.clone(),
            requester_name: caller.name.clone(),
            parameters,
            status: RequestStatus::PendingApproval,
            approver_email: None,
            approver_name: None,
            decided_at: None,
            rejection_reason: None,
            failure_reason: None,
            tags: body.tags,
            expires_at: body.expires_at,
            pipeline_run: None,
            created_at: now,
            updated_at: now,
        };
        self.store.create_request(&request).await?;

        self.audit(
            SubjectKind::Request,
            request.id,
            caller,
            "request_submitted",
            serde_json::json!({ "template_id": template.id }),
        )
        .await;

        tracing::info!(
            request_id = %request.id,
            template = %template.id,
            requester = %caller.email,
            "deployment request submitted"
        );

        self.dispatcher
            .notify(NotificationEvent {
                kind: NotificationKind::ApprovalRequested,
                recipients: self.approver_recipients.clone(),
                subject_kind: SubjectKind::Request,
                subject_id: request.id,
                summary: format!("{} requested '{}'", caller.name, template.name),
                facts: vec![
                    ("Template".to_string(), template.name.clone()),
                    ("Requester".to_string(), caller.email.clone()),
                    (
                        "Estimated cost".to_string(),
                        template.estimated_monthly_cost_usd.clone(),
                    ),
                ],
                link: self.link(&format!("requests/{}", request.id)),
            })
            .await;

        Ok(request)
    }

    pub async fn get_request_view(&self, caller: &Identity, id: Uuid) -> Result<RequestView> {
        let request = self.store.get_request(id).await?;
        if request.requester_email != caller.email && !caller.is_approver() {
            return Err(Error::Authorization(
                "only the requester or an approver may view this request".to_string(),
            ));
        }
        Ok(request_view(request, Utc::now()))
    }

    /// `all` lists every user's requests and requires the approver role.
    pub async fn list_requests(&self, caller: &Identity, all: bool) -> Result<Vec<RequestView>> {
        if all && !caller.is_approver() {
            return Err(Error::Authorization(
                "listing all requests requires the approver role".to_string(),
            ));
        }
        let requester = if all { None } else { Some(caller.email.as_str()) };
        let now = Utc::now();
        let requests = self.store.list_requests(requester).await?;
        Ok(requests.into_iter().map(|r| request_view(r, now)).collect())
    }

    pub async fn approve_request(
        &self,
        caller: &Identity,
        id: Uuid,
    ) -> Result<DeploymentRequest> {
        let request = self.store.get_request(id).await?;
        self.check_decider(caller, &request.requester_email)?;
        let approved = next_status(request.status, Action::Approve)?;

        let request = self
            .store
            .set_request_decision(id, request.status, approved, caller, None)
            .await?;

        self.audit(
            SubjectKind::Request,
            id,
            caller,
            "request_approved",
            serde_json::json!({}),
        )
        .await;
        tracing::info!(request_id = %id, approver = %caller.email, "request approved");

        self.dispatcher
            .notify(NotificationEvent {
                kind: NotificationKind::Approved,
                recipients: vec![request.requester_email.clone()],
                subject_kind: SubjectKind::Request,
                subject_id: id,
                summary: format!("Request for '{}' approved", request.template_id),
                facts: vec![("Approver".to_string(), caller.email.clone())],
                link: self.link(&format!("requests/{id}")),
            })
            .await;

        self.launch_request(request).await
    }

    /// Triggers the pipeline for a freshly approved request. A trigger
    /// failure lands the request in `failed` with the reason recorded;
    /// the approval itself stands.
    async fn launch_request(&self, request: DeploymentRequest) -> Result<DeploymentRequest> {
        let outcome = match self.catalog.get_template(&request.template_id) {
            Some(template) => {
                self.gateway
                    .trigger(&template.pipeline, &request.parameters, request.id)
                    .await
            }
            None => Err(Error::PipelineUnavailable(format!(
                "template '{}' is no longer in the catalog",
                request.template_id
            ))),
        };

        match outcome {
            Ok(run) => {
                let updated = self
                    .store
                    .set_request_pipeline(
                        request.id,
                        request.status,
                        RequestStatus::Deploying,
                        Some(run.clone()),
                        None,
                    )
                    .await?;
                self.audit_system(
                    SubjectKind::Request,
                    request.id,
                    "pipeline_triggered",
                    serde_json::json!({ "run_id": run.run_id }),
                )
                .await;
                tracing::info!(request_id = %request.id, run_id = run.run_id, "pipeline triggered");
                Ok(updated)
            }
            Err(err) => {
                let reason = err.failure_reason();
                let updated = self
                    .store
                    .set_request_pipeline(
                        request.id,
                        request.status,
                        RequestStatus::Failed,
                        None,
                        Some(reason.clone()),
                    )
                    .await?;
                self.audit_system(
                    SubjectKind::Request,
                    request.id,
                    "pipeline_trigger_failed",
                    serde_json::json!({ "reason": reason }),
                )
                .await;
                tracing::warn!(request_id = %request.id, "pipeline trigger failed: {reason}");

                self.dispatcher
                    .notify(NotificationEvent {
                        kind: NotificationKind::Failed,
                        recipients: vec![updated.requester_email.clone()],
                        subject_kind: SubjectKind::Request,
                        subject_id: request.id,
                        summary: format!("Request for '{}' failed", updated.template_id),
                        facts: vec![("Reason".to_string(), reason)],
                        link: self.link(&format!("requests/{}", request.id)),
                    })
                    .await;
                Ok(updated)
            }
        }
    }

    pub async fn reject_request(
        &self,
        caller: &Identity,
        id: Uuid,
        body: RejectBody,
    ) -> Result<DeploymentRequest> {
        let reason = non_empty_reason(&body.reason)?;
        let request = self.store.get_request(id).await?;
        self.check_decider(caller, &request.requester_email)?;
        let rejected = next_status(request.status, Action::Reject)?;

        let request = self
            .store
            .set_request_decision(id, request.status, rejected, caller, Some(reason.clone()))
            .await?;

        self.audit(
            SubjectKind::Request,
            id,
            caller,
            "request_rejected",
            serde_json::json!({ "reason": reason }),
        )
        .await;
        tracing::info!(request_id = %id, approver = %caller.email, "request rejected");

        self.dispatcher
            .notify(NotificationEvent {
                kind: NotificationKind::Rejected,
                recipients: vec![request.requester_email.clone()],
                subject_kind: SubjectKind::Request,
                subject_id: id,
                summary: format!("Request for '{}' rejected", request.template_id),
                facts: vec![("Reason".to_string(), reason)],
                link: self.link(&format!("requests/{id}")),
            })
            .await;

        Ok(request)
    }

    // ========================================================================
    // Pipeline callbacks
    // ========================================================================

    /// Resolves a pipeline outcome for the request or operation whose id
    /// matches the correlation token. Replayed callbacks for an already
    /// terminal entity are acknowledged without any state change.
    pub async fn pipeline_callback(
        &self,
        correlation: Uuid,
        outcome: PipelineOutcome,
        detail: Option<String>,
    ) -> Result<()> {
        match self.store.get_request(correlation).await {
            Ok(request) => self.resolve_request(request, outcome, detail).await,
            Err(Error::NotFound(_)) => {
                let operation = self.store.get_operation(correlation).await.map_err(|e| {
                    match e {
                        Error::NotFound(_) => Error::NotFound(format!(
                            "no request or operation matches correlation token {correlation}"
                        )),
                        other => other,
                    }
                })?;
                self.resolve_operation(operation, outcome, detail).await
            }
            Err(other) => Err(other),
        }
    }

    async fn resolve_request(
        &self,
        request: DeploymentRequest,
        outcome: PipelineOutcome,
        detail: Option<String>,
    ) -> Result<()> {
        if request.status.is_terminal() {
            tracing::info!(
                request_id = %request.id,
                status = %request.status,
                "duplicate pipeline callback ignored"
            );
            return Ok(());
        }

        let action = match outcome {
            PipelineOutcome::Success => Action::PipelineSucceeded,
            PipelineOutcome::Failure => Action::PipelineFailed,
        };
        let target = next_status(request.status, action)?;
        let failure_reason = match outcome {
            PipelineOutcome::Success => None,
            PipelineOutcome::Failure => {
                Some(detail.unwrap_or_else(|| "pipeline run failed".to_string()))
            }
        };

        let request = self
            .store
            .set_request_pipeline(request.id, request.status, target, None, failure_reason.clone())
            .await?;

        match outcome {
            PipelineOutcome::Success => {
                let deployment = Deployment {
                    id: Uuid::new_v4(),
                    request_id: request.id,
                    template_id: request.template_id.clone(),
                    owner_email: request.requester_email.clone(),
                    health: DeploymentHealth::Healthy,
                    parameters: request.parameters.clone(),
                    expires_at: request.expires_at,
                    created_at: Utc::now(),
                    destroyed_at: None,
                };
                self.store.create_deployment(&deployment).await?;

                self.audit_system(
                    SubjectKind::Request,
                    request.id,
                    "request_completed",
                    serde_json::json!({ "deployment_id": deployment.id }),
                )
                .await;
                self.audit_system(
                    SubjectKind::Deployment,
                    deployment.id,
                    "deployment_created",
                    serde_json::json!({ "request_id": request.id }),
                )
                .await;
                tracing::info!(
                    request_id = %request.id,
                    deployment_id = %deployment.id,
                    "request completed, deployment created"
                );

                self.dispatcher
                    .notify(NotificationEvent {
                        kind: NotificationKind::Completed,
                        recipients: vec![request.requester_email.clone()],
                        subject_kind: SubjectKind::Request,
                        subject_id: request.id,
                        summary: format!("'{}' is deployed", request.template_id),
                        facts: vec![(
                            "Deployment".to_string(),
                            deployment.id.to_string(),
                        )],
                        link: self.link(&format!("deployments/{}", deployment.id)),
                    })
                    .await;
            }
            PipelineOutcome::Failure => {
                let reason = failure_reason.unwrap_or_default();
                self.audit_system(
                    SubjectKind::Request,
                    request.id,
                    "request_failed",
                    serde_json::json!({ "reason": reason }),
                )
                .await;
                tracing::warn!(request_id = %request.id, "request failed: {reason}");

                self.dispatcher
                    .notify(NotificationEvent {
                        kind: NotificationKind::Failed,
                        recipients: vec![request.requester_email.clone()],
                        subject_kind: SubjectKind::Request,
                        subject_id: request.id,
                        summary: format!("Request for '{}' failed", request.template_id),
                        facts: vec![("Reason".to_string(), reason)],
                        link: self.link(&format!("requests/{}", request.id)),
                    })
                    .await;
            }
        }

        Ok(())
    }

    async fn resolve_operation(
        &self,
        operation: Operation,
        outcome: PipelineOutcome,
        detail: Option<String>,
    ) -> Result<()> {
        if operation.status.is_terminal() {
            tracing::info!(
                operation_id = %operation.id,
                status = %operation.status,
                "duplicate pipeline callback ignored"
            );
            return Ok(());
        }

        let action = match outcome {
            PipelineOutcome::Success => Action::PipelineSucceeded,
            PipelineOutcome::Failure => Action::PipelineFailed,
        };
        let target = next_status(operation.status, action)?;
        let failure_reason = match outcome {
            PipelineOutcome::Success => None,
            PipelineOutcome::Failure => {
                Some(detail.unwrap_or_else(|| "pipeline run failed".to_string()))
            }
        };

        let operation = self
            .store
            .set_operation_pipeline(
                operation.id,
                operation.status,
                target,
                None,
                failure_reason.clone(),
            )
            .await?;

        match outcome {
            PipelineOutcome::Success => {
                match operation.kind {
                    OperationKind::Scale => {
                        if let Some(parameters) = &operation.parameters {
                            self.store
                                .set_deployment_parameters(operation.deployment_id, parameters)
                                .await?;
                        }
                        self.audit_system(
                            SubjectKind::Deployment,
                            operation.deployment_id,
                            "deployment_scaled",
                            serde_json::json!({ "operation_id": operation.id }),
                        )
                        .await;
                    }
                    OperationKind::Destroy => {
                        self.store
                            .set_deployment_destroyed(operation.deployment_id, Utc::now())
                            .await?;
                        self.audit_system(
                            SubjectKind::Deployment,
                            operation.deployment_id,
                            "deployment_destroyed",
                            serde_json::json!({ "operation_id": operation.id }),
                        )
                        .await;
                    }
                }
                self.audit_system(
                    SubjectKind::Operation,
                    operation.id,
                    "operation_completed",
                    serde_json::json!({ "kind": operation.kind.as_str() }),
                )
                .await;
                tracing::info!(
                    operation_id = %operation.id,
                    deployment_id = %operation.deployment_id,
                    kind = operation.kind.as_str(),
                    "operation completed"
                );

                self.dispatcher
                    .notify(NotificationEvent {
                        kind: NotificationKind::Completed,
                        recipients: vec![operation.requester_email.clone()],
                        subject_kind: SubjectKind::Operation,
                        subject_id: operation.id,
                        summary: format!("{} operation completed", operation.kind),
                        facts: vec![(
                            "Deployment".to_string(),
                            operation.deployment_id.to_string(),
                        )],
                        link: self.link(&format!("deployments/{}", operation.deployment_id)),
                    })
                    .await;
            }
            PipelineOutcome::Failure => {
                let reason = failure_reason.unwrap_or_default();
                self.audit_system(
                    SubjectKind::Operation,
                    operation.id,
                    "operation_failed",
                    serde_json::json!({ "reason": reason }),
                )
                .await;
                tracing::warn!(operation_id = %operation.id, "operation failed: {reason}");

                self.dispatcher
                    .notify(NotificationEvent {
                        kind: NotificationKind::Failed,
                        recipients: vec![operation.requester_email.clone()],
                        subject_kind: SubjectKind::Operation,
                        subject_id: operation.id,
                        summary: format!("{} operation failed", operation.kind),
                        facts: vec![("Reason".to_string(), reason)],
                        link: self.link(&format!("deployments/{}", operation.deployment_id)),
                    })
                    .await;
            }
        }

        Ok(())
    }

    // ========================================================================
    // Deployments & operations
    // ========================================================================

    pub async fn get_deployment_view(
        &self,
        caller: &Identity,
        id: Uuid,
    ) -> Result<DeploymentView> {
        let deployment = self.store.get_deployment(id).await?;
        if deployment.owner_email != caller.email && !caller.is_approver() {
            return Err(Error::Authorization(
                "only the owner or an approver may view this deployment".to_string(),
            ));
        }
        Ok(deployment_view(deployment, Utc::now()))
    }

    pub async fn list_deployments(
        &self,
        caller: &Identity,
        all: bool,
    ) -> Result<Vec<DeploymentView>> {
        if all && !caller.is_approver() {
            return Err(Error::Authorization(
                "listing all deployments requires the approver role".to_string(),
            ));
        }
        let owner = if all { None } else { Some(caller.email.as_str()) };
        let now = Utc::now();
        let deployments = self.store.list_deployments(owner).await?;
        Ok(deployments
            .into_iter()
            .map(|d| deployment_view(d, now))
            .collect())
    }

    pub async fn submit_scale(
        &self,
        caller: &Identity,
        deployment_id: Uuid,
        body: ScaleBody,
    ) -> Result<Operation> {
        let deployment = self.store.get_deployment(deployment_id).await?;
        self.check_operation_allowed(caller, &deployment).await?;

        let template = self
            .catalog
            .get_template(&deployment.template_id)
            .ok_or_else(|| {
                Error::Validation(format!(
                    "template '{}' is no longer in the catalog",
                    deployment.template_id
                ))
            })?;
        let parameters = validate_parameters(&template, &body.parameters)?;
        if parameters == deployment.parameters {
            return Err(Error::Validation(
                "requested parameters match the current deployment".to_string(),
            ));
        }

        self.create_operation(
            caller,
            &deployment,
            OperationKind::Scale,
            Some(parameters),
            body.reason,
        )
        .await
    }

    pub async fn submit_destroy(
        &self,
        caller: &Identity,
        deployment_id: Uuid,
        body: DestroyBody,
    ) -> Result<Operation> {
        let deployment = self.store.get_deployment(deployment_id).await?;
        self.check_operation_allowed(caller, &deployment).await?;

        self.create_operation(caller, &deployment, OperationKind::Destroy, None, body.reason)
            .await
    }

    async fn check_operation_allowed(
        &self,
        caller: &Identity,
        deployment: &Deployment,
    ) -> Result<()> {
        if deployment.owner_email != caller.email {
            return Err(Error::Authorization(
                "only the deployment owner may request operations".to_string(),
            ));
        }
        if deployment.health == DeploymentHealth::Destroyed {
            return Err(Error::InvalidTransition(
                "deployment is already destroyed".to_string(),
            ));
        }
        if let Some(active) = self.store.active_operation(deployment.id).await? {
            return Err(Error::Conflict(format!(
                "a {} operation is already in progress",
                active.kind
            )));
        }
        Ok(())
    }

    async fn create_operation(
        &self,
        caller: &Identity,
        deployment: &Deployment,
        kind: OperationKind,
        parameters: Option<ParameterValues>,
        reason: Option<String>,
    ) -> Result<Operation> {
        let now = Utc::now();
        let operation = Operation {
            id: Uuid::new_v4(),
            deployment_id: deployment.id,
            kind,
            parameters,
            reason,
            requester_email: caller.email.clone(),
            requester_name: caller.name.clone(),
            status: RequestStatus::PendingApproval,
            approver_email: None,
            approver_name: None,
            decided_at: None,
            rejection_reason: None,
            failure_reason: None,
            pipeline_run: None,
            created_at: now,
            updated_at: now,
        };
        self.store.create_operation(&operation).await?;

        self.audit(
            SubjectKind::Operation,
            operation.id,
            caller,
            match kind {
                OperationKind::Scale => "scale_requested",
                OperationKind::Destroy => "destroy_requested",
            },
            serde_json::json!({ "deployment_id": deployment.id }),
        )
        .await;
        tracing::info!(
            operation_id = %operation.id,
            deployment_id = %deployment.id,
            kind = kind.as_str(),
            "operation submitted"
        );

        self.dispatcher
            .notify(NotificationEvent {
                kind: NotificationKind::ApprovalRequested,
                recipients: self.approver_recipients.clone(),
                subject_kind: SubjectKind::Operation,
                subject_id: operation.id,
                summary: format!(
                    "{} requested a {} of '{}'",
                    caller.name, kind, deployment.template_id
                ),
                facts: vec![
                    ("Deployment".to_string(), deployment.id.to_string()),
                    ("Requester".to_string(), caller.email.clone()),
                ],
                link: self.link(&format!("deployments/{}", deployment.id)),
            })
            .await;

        Ok(operation)
    }

    pub async fn get_operation(&self, caller: &Identity, id: Uuid) -> Result<Operation> {
        let operation = self.store.get_operation(id).await?;
        self.check_operation_viewer(caller, operation.deployment_id).await?;
        Ok(operation)
    }

    pub async fn list_operations(
        &self,
        caller: &Identity,
        deployment_id: Uuid,
    ) -> Result<Vec<Operation>> {
        self.check_operation_viewer(caller, deployment_id).await?;
        self.store.list_operations(deployment_id).await
    }

    async fn check_operation_viewer(&self, caller: &Identity, deployment_id: Uuid) -> Result<()> {
        let deployment = self.store.get_deployment(deployment_id).await?;
        if deployment.owner_email != caller.email && !caller.is_approver() {
            return Err(Error::Authorization(
                "only the deployment owner or an approver may view operations".to_string(),
            ));
        }
        Ok(())
    }

    pub async fn approve_operation(&self, caller: &Identity, id: Uuid) -> Result<Operation> {
        let operation = self.store.get_operation(id).await?;
        self.check_decider(caller, &operation.requester_email)?;
        let approved = next_status(operation.status, Action::Approve)?;

        let operation = self
            .store
            .set_operation_decision(id, operation.status, approved, caller, None)
            .await?;

        self.audit(
            SubjectKind::Operation,
            id,
            caller,
            "operation_approved",
            serde_json::json!({ "kind": operation.kind.as_str() }),
        )
        .await;
        tracing::info!(operation_id = %id, approver = %caller.email, "operation approved");

        self.dispatcher
            .notify(NotificationEvent {
                kind: NotificationKind::Approved,
                recipients: vec![operation.requester_email.clone()],
                subject_kind: SubjectKind::Operation,
                subject_id: id,
                summary: format!("{} operation approved", operation.kind),
                facts: vec![("Approver".to_string(), caller.email.clone())],
                link: self.link(&format!("deployments/{}", operation.deployment_id)),
            })
            .await;

        self.launch_operation(operation).await
    }

    /// Triggers the pipeline for an approved operation. Scale runs carry
    /// the new parameter set; destroy runs carry the deployment's current
    /// snapshot. Both carry an `operation` selector.
    async fn launch_operation(&self, operation: Operation) -> Result<Operation> {
        let deployment = self.store.get_deployment(operation.deployment_id).await?;

        let outcome = match self.catalog.get_template(&deployment.template_id) {
            Some(template) => {
                let mut parameters = match operation.kind {
                    OperationKind::Scale => {
                        operation.parameters.clone().unwrap_or_default()
                    }
                    OperationKind::Destroy => deployment.parameters.clone(),
                };
                parameters.insert("operation".to_string(), operation.kind.to_string());
                self.gateway
                    .trigger(&template.pipeline, &parameters, operation.id)
                    .await
            }
            None => Err(Error::PipelineUnavailable(format!(
                "template '{}' is no longer in the catalog",
                deployment.template_id
            ))),
        };

        match outcome {
            Ok(run) => {
                let updated = self
                    .store
                    .set_operation_pipeline(
                        operation.id,
                        operation.status,
                        RequestStatus::Deploying,
                        Some(run.clone()),
                        None,
                    )
                    .await?;
                self.audit_system(
                    SubjectKind::Operation,
                    operation.id,
                    "pipeline_triggered",
                    serde_json::json!({ "run_id": run.run_id }),
                )
                .await;
                Ok(updated)
            }
            Err(err) => {
                let reason = err.failure_reason();
                let updated = self
                    .store
                    .set_operation_pipeline(
                        operation.id,
                        operation.status,
                        RequestStatus::Failed,
                        None,
                        Some(reason.clone()),
                    )
                    .await?;
                self.audit_system(
                    SubjectKind::Operation,
                    operation.id,
                    "pipeline_trigger_failed",
                    serde_json::json!({ "reason": reason }),
                )
                .await;
                tracing::warn!(operation_id = %operation.id, "pipeline trigger failed: {reason}");

                self.dispatcher
                    .notify(NotificationEvent {
                        kind: NotificationKind::Failed,
                        recipients: vec![updated.requester_email.clone()],
                        subject_kind: SubjectKind::Operation,
                        subject_id: operation.id,
                        summary: format!("{} operation failed", updated.kind),
                        facts: vec![("Reason".to_string(), reason)],
                        link: self.link(&format!("deployments/{}", operation.deployment_id)),
                    })
                    .await;
                Ok(updated)
            }
        }
    }

    pub async fn reject_operation(
        &self,
        caller: &Identity,
        id: Uuid,
        body: RejectBody,
    ) -> Result<Operation> {
        let reason = non_empty_reason(&body.reason)?;
        let operation = self.store.get_operation(id).await?;
        self.check_decider(caller, &operation.requester_email)?;
        let rejected = next_status(operation.status, Action::Reject)?;

        let operation = self
            .store
            .set_operation_decision(id, operation.status, rejected, caller, Some(reason.clone()))
            .await?;

        self.audit(
            SubjectKind::Operation,
            id,
            caller,
            "operation_rejected",
            serde_json::json!({ "reason": reason }),
        )
        .await;

        self.dispatcher
            .notify(NotificationEvent {
                kind: NotificationKind::Rejected,
                recipients: vec![operation.requester_email.clone()],
                subject_kind: SubjectKind::Operation,
                subject_id: id,
                summary: format!("{} operation rejected", operation.kind),
                facts: vec![("Reason".to_string(), reason)],
                link: self.link(&format!("deployments/{}", operation.deployment_id)),
            })
            .await;

        Ok(operation)
    }

    // ========================================================================
    // Sweeps
    // ========================================================================

    /// Polls the pipeline runner for entities stuck in `deploying` for at
    /// least `stuck_for` and resolves any that finished without a
    /// callback. Returns the number resolved.
    pub async fn reconcile_deploying(&self, stuck_for: Duration) -> Result<usize> {
        let cutoff = Utc::now() - stuck_for;
        let mut resolved = 0;

        for request in self.store.list_deploying_requests_older_than(cutoff).await? {
            let Some(template) = self.catalog.get_template(&request.template_id) else {
                tracing::warn!(request_id = %request.id, "reconcile skipped: template gone");
                continue;
            };
            let Some(run) = &request.pipeline_run else {
                tracing::warn!(request_id = %request.id, "reconcile skipped: no run reference");
                continue;
            };
            match self.gateway.poll(&template.pipeline, run).await {
                Ok(state) => {
                    if self.apply_poll_state(request.id, state).await? {
                        resolved += 1;
                    }
                }
                Err(err) => {
                    tracing::warn!(request_id = %request.id, "reconcile poll failed: {err}");
                }
            }
        }

        for operation in self
            .store
            .list_deploying_operations_older_than(cutoff)
            .await?
        {
            let deployment = match self.store.get_deployment(operation.deployment_id).await {
                Ok(deployment) => deployment,
                Err(err) => {
                    tracing::warn!(
                        operation_id = %operation.id,
                        "reconcile skipped: deployment unavailable: {err}"
                    );
                    continue;
                }
            };
            let Some(template) = self.catalog.get_template(&deployment.template_id) else {
                tracing::warn!(operation_id = %operation.id, "reconcile skipped: template gone");
                continue;
            };
            let Some(run) = &operation.pipeline_run else {
                tracing::warn!(operation_id = %operation.id, "reconcile skipped: no run reference");
                continue;
            };
            match self.gateway.poll(&template.pipeline, run).await {
                Ok(state) => {
                    if self.apply_poll_state(operation.id, state).await? {
                        resolved += 1;
                    }
                }
                Err(err) => {
                    tracing::warn!(operation_id = %operation.id, "reconcile poll failed: {err}");
                }
            }
        }

        tracing::info!(resolved, "reconciliation sweep finished");
        Ok(resolved)
    }

    async fn apply_poll_state(&self, correlation: Uuid, state: PipelineRunState) -> Result<bool> {
        match state {
            PipelineRunState::Running => Ok(false),
            PipelineRunState::Succeeded => {
                self.pipeline_callback(correlation, PipelineOutcome::Success, None)
                    .await?;
                Ok(true)
            }
            PipelineRunState::Failed => {
                self.pipeline_callback(
                    correlation,
                    PipelineOutcome::Failure,
                    Some("pipeline run did not succeed".to_string()),
                )
                .await?;
                Ok(true)
            }
        }
    }

    /// Sends a one-time chat reminder for every request pending approval
    /// for at least `pending_for`. Returns the number of reminders sent.
    pub async fn send_approval_reminders(&self, pending_for: Duration) -> Result<usize> {
        use launchpad_models::{ApprovalReminder, ReminderChannel};

        let cutoff = Utc::now() - pending_for;
        let mut sent = 0;

        for request in self.store.list_pending_requests_older_than(cutoff).await? {
            if self
                .store
                .has_reminder(request.id, ReminderChannel::Chat)
                .await?
            {
                continue;
            }

            self.dispatcher
                .notify(NotificationEvent {
                    kind: NotificationKind::ApprovalReminder,
                    recipients: self.approver_recipients.clone(),
                    subject_kind: SubjectKind::Request,
                    subject_id: request.id,
                    summary: format!(
                        "Request for '{}' is still awaiting approval",
                        request.template_id
                    ),
                    facts: vec![
                        ("Requester".to_string(), request.requester_email.clone()),
                        (
                            "Pending since".to_string(),
                            request.created_at.to_rfc3339(),
                        ),
                    ],
                    link: self.link(&format!("requests/{}", request.id)),
                })
                .await;

            self.store
                .record_reminder(&ApprovalReminder {
                    id: Uuid::new_v4(),
                    request_id: request.id,
                    channel: ReminderChannel::Chat,
                    sent_at: Utc::now(),
                })
                .await?;
            self.audit_system(
                SubjectKind::Request,
                request.id,
                "approval_reminder_sent",
                serde_json::json!({ "channel": "chat" }),
            )
            .await;
            sent += 1;
        }

        tracing::info!(sent, "approval reminder sweep finished");
        Ok(sent)
    }

    // ========================================================================
    // Audit
    // ========================================================================

    pub async fn list_audit(
        &self,
        caller: &Identity,
        kind: SubjectKind,
        subject_id: Uuid,
    ) -> Result<Vec<AuditEntry>> {
        if !caller.is_approver() {
            return Err(Error::Authorization(
                "viewing the audit trail requires the approver role".to_string(),
            ));
        }
        self.store.list_audit(kind, subject_id).await
    }

    fn check_decider(&self, caller: &Identity, requester_email: &str) -> Result<()> {
        if !caller.is_approver() {
            return Err(Error::Authorization(
                "deciding a request requires the approver role".to_string(),
            ));
        }
        if caller.email == requester_email {
            return Err(Error::Authorization(
                "you cannot decide your own request".to_string(),
            ));
        }
        Ok(())
    }

    fn link(&self, path: &str) -> Option<String> {
        self.portal_base_url
            .as_ref()
            .map(|base| format!("{}/{path}", base.trim_end_matches('/')))
    }

    async fn audit(
        &self,
        subject_kind: SubjectKind,
        subject_id: Uuid,
        actor: &Identity,
        action: &str,
        detail: serde_json::Value,
    ) {
        self.dispatcher
            .record(AuditEntry {
                id: Uuid::new_v4(),
                subject_kind,
                subject_id,
                actor_email: actor.email.clone(),
                actor_name: actor.name.clone(),
                action: action.to_string(),
                detail,
                created_at: Utc::now(),
            })
            .await;
    }

    async fn audit_system(
        &self,
        subject_kind: SubjectKind,
        subject_id: Uuid,
        action: &str,
        detail: serde_json::Value,
    ) {
        self.dispatcher
            .record(AuditEntry {
                id: Uuid::new_v4(),
                subject_kind,
                subject_id,
                actor_email: SYSTEM_EMAIL.to_string(),
                actor_name: SYSTEM_NAME.to_string(),
                action: action.to_string(),
                detail,
                created_at: Utc::now(),
            })
            .await;
    }
}

fn request_view(request: DeploymentRequest, now: DateTime<Utc>) -> RequestView {
    let expired = !request.status.is_terminal()
        && request.expires_at.map(|at| at < now).unwrap_or(false);
    RequestView { request, expired }
}

fn deployment_view(deployment: Deployment, now: DateTime<Utc>) -> DeploymentView {
    let expired = deployment.is_expired(now);
    DeploymentView {
        deployment,
        expired,
    }
}

fn non_empty_reason(reason: &str) -> Result<String> {
    let trimmed = reason.trim();
    if trimmed.is_empty() {
        return Err(Error::Validation("a rejection reason is required".to_string()));
    }
    Ok(trimmed.to_string())
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::sync::Mutex;

    use async_trait::async_trait;
    use launchpad_models::{PipelineRunRef, Role, Tags};

    use super::*;
    use crate::catalog::{PipelineBinding, YamlCatalog};
    use crate::store::MemStore;

    struct StubGateway {
        fail_trigger: AtomicBool,
        poll_state: Mutex<PipelineRunState>,
        triggered: Mutex<Vec<(Uuid, ParameterValues)>>,
    }

    impl StubGateway {
        fn new() -> Self {
            Self {
                fail_trigger: AtomicBool::new(false),
                poll_state: Mutex::new(PipelineRunState::Running),
                triggered: Mutex::new(Vec::new()),
            }
        }
    }

    #[async_trait]
    impl PipelineGateway for StubGateway {
        async fn trigger(
            &self,
            _binding: &PipelineBinding,
            parameters: &ParameterValues,
            correlation: Uuid,
        ) -> Result<PipelineRunRef> {
            if self.fail_trigger.load(Ordering::SeqCst) {
                return Err(Error::PipelineUnavailable("runner is down".to_string()));
            }
            self.triggered
                .lock()
                .unwrap()
                .push((correlation, parameters.clone()));
            Ok(PipelineRunRef {
                run_id: 1000 + self.triggered.lock().unwrap().len() as i64,
                url: Some("https://runner.example.com/run".to_string()),
            })
        }

        async fn poll(
            &self,
            _binding: &PipelineBinding,
            _run: &PipelineRunRef,
        ) -> Result<PipelineRunState> {
            Ok(*self.poll_state.lock().unwrap())
        }
    }

    struct RecordingTransport {
        events: Mutex<Vec<(NotificationKind, Vec<String>)>>,
    }

    #[async_trait]
    impl crate::dispatch::NotificationTransport for RecordingTransport {
        fn name(&self) -> &str {
            "recording"
        }

        async fn send(&self, event: &NotificationEvent) -> Result<()> {
            self.events
                .lock()
                .unwrap()
                .push((event.kind, event.recipients.clone()));
            Ok(())
        }
    }

    fn template() -> Template {
        Template {
            id: "vm-basic".to_string(),
            name: "Basic VM".to_string(),
            description: String::new(),
            category: "compute".to_string(),
            estimated_monthly_cost_usd: "150".to_string(),
            cost_breakdown: Vec::new(),
            parameters: vec![crate::catalog::ParameterSpec {
                name: "size".to_string(),
                label: None,
                kind: crate::catalog::ParameterType::Select,
                description: String::new(),
                required: true,
                default: None,
                options: vec!["small".to_string(), "large".to_string()],
                min_value: None,
                max_value: None,
            }],
            pipeline: PipelineBinding {
                project: "infra".to_string(),
                pipeline_id: 42,
                branch: "main".to_string(),
                module_name: Some("vm-basic".to_string()),
            },
            icon: None,
            skill_level: None,
            tags: Vec::new(),
        }
    }

    struct Harness {
        store: Arc<MemStore>,
        gateway: Arc<StubGateway>,
        transport: Arc<RecordingTransport>,
        engine: LifecycleEngine,
    }

    fn harness() -> Harness {
        let store = Arc::new(MemStore::new());
        let gateway = Arc::new(StubGateway::new());
        let transport = Arc::new(RecordingTransport {
            events: Mutex::new(Vec::new()),
        });
        let dispatcher = Dispatcher::new(store.clone(), vec![transport.clone()]);
        let engine = LifecycleEngine::new(
            store.clone(),
            Arc::new(YamlCatalog::from_templates(vec![template()])),
            gateway.clone(),
            dispatcher,
            Some("https://portal.example.com".to_string()),
            vec!["approvers@example.com".to_string()],
        );
        Harness {
            store,
            gateway,
            transport,
            engine,
        }
    }

    fn requester() -> Identity {
        Identity::new("dev@example.com", "Dev", vec![Role::User])
    }

    fn approver() -> Identity {
        Identity::new("ops@example.com", "Ops", vec![Role::User, Role::Approver])
    }

    fn submit_body() -> SubmitRequestBody {
        let mut parameters = ParameterValues::new();
        parameters.insert("size".to_string(), "small".to_string());
        SubmitRequestBody {
            template_id: "vm-basic".to_string(),
            parameters,
            tags: Tags::default(),
            expires_at: None,
        }
    }

    async fn submitted(h: &Harness) -> DeploymentRequest {
        h.engine
            .submit_request(&requester(), submit_body())
            .await
            .unwrap()
    }

    async fn deploying(h: &Harness) -> DeploymentRequest {
        let request = submitted(h).await;
        h.engine
            .approve_request(&approver(), request.id)
            .await
            .unwrap()
    }

    async fn deployed(h: &Harness) -> Deployment {
        let request = deploying(h).await;
        h.engine
            .pipeline_callback(request.id, PipelineOutcome::Success, None)
            .await
            .unwrap();
        h.store
            .get_deployment_by_request(request.id)
            .await
            .unwrap()
            .unwrap()
    }

    #[tokio::test]
    async fn submit_creates_pending_request_with_audit_and_notification() {
        let h = harness();
        let request = submitted(&h).await;

        assert_eq!(request.status, RequestStatus::PendingApproval);
        assert_eq!(request.parameters.get("size").unwrap(), "small");

        let audit = h
            .store
            .list_audit(SubjectKind::Request, request.id)
            .await
            .unwrap();
        assert_eq!(audit.len(), 1);
        assert_eq!(audit[0].action, "request_submitted");

        let events = h.transport.events.lock().unwrap();
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].0, NotificationKind::ApprovalRequested);
        assert_eq!(events[0].1, vec!["approvers@example.com".to_string()]);
    }

    #[tokio::test]
    async fn submit_rejects_unknown_template_and_bad_parameters() {
        let h = harness();

        let mut body = submit_body();
        body.template_id = "nope".to_string();
        assert!(matches!(
            h.engine.submit_request(&requester(), body).await,
            Err(Error::Validation(_))
        ));

        let mut body = submit_body();
        body.parameters.insert("size".to_string(), "gigantic".to_string());
        assert!(matches!(
            h.engine.submit_request(&requester(), body).await,
            Err(Error::Validation(_))
        ));
    }

    #[tokio::test]
    async fn approval_requires_the_approver_role() {
        let h = harness();
        let request = submitted(&h).await;

        let err = h
            .engine
            .approve_request(&requester(), request.id)
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Authorization(_)));
    }

    #[tokio::test]
    async fn self_approval_is_forbidden() {
        let h = harness();
        let request = h
            .engine
            .submit_request(&approver(), submit_body())
            .await
            .unwrap();

        let err = h
            .engine
            .approve_request(&approver(), request.id)
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Authorization(_)));
    }

    #[tokio::test]
    async fn approval_triggers_pipeline_and_moves_to_deploying() {
        let h = harness();
        let request = submitted(&h).await;

        let approved = h
            .engine
            .approve_request(&approver(), request.id)
            .await
            .unwrap();
        assert_eq!(approved.status, RequestStatus::Deploying);
        assert!(approved.pipeline_run.is_some());
        assert_eq!(approved.approver_email.as_deref(), Some("ops@example.com"));

        let triggered = h.gateway.triggered.lock().unwrap();
        assert_eq!(triggered.len(), 1);
        assert_eq!(triggered[0].0, request.id);
    }

    #[tokio::test]
    async fn trigger_failure_fails_the_request_but_keeps_the_approval() {
        let h = harness();
        let request = submitted(&h).await;
        h.gateway.fail_trigger.store(true, Ordering::SeqCst);

        let result = h
            .engine
            .approve_request(&approver(), request.id)
            .await
            .unwrap();
        assert_eq!(result.status, RequestStatus::Failed);
        assert!(result.failure_reason.as_deref().unwrap().contains("runner"));
        assert_eq!(result.approver_email.as_deref(), Some("ops@example.com"));

        let actions: Vec<String> = h
            .store
            .list_audit(SubjectKind::Request, request.id)
            .await
            .unwrap()
            .into_iter()
            .map(|e| e.action)
            .collect();
        assert!(actions.contains(&"request_approved".to_string()));
        assert!(actions.contains(&"pipeline_trigger_failed".to_string()));
    }

    #[tokio::test]
    async fn second_approval_reports_invalid_transition() {
        let h = harness();
        let request = deploying(&h).await;

        let err = h
            .engine
            .approve_request(&approver(), request.id)
            .await
            .unwrap_err();
        assert!(matches!(err, Error::InvalidTransition(_)));
    }

    #[tokio::test]
    async fn rejection_requires_a_reason() {
        let h = harness();
        let request = submitted(&h).await;

        let err = h
            .engine
            .reject_request(
                &approver(),
                request.id,
                RejectBody {
                    reason: "   ".to_string(),
                },
            )
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Validation(_)));
    }

    #[tokio::test]
    async fn rejection_records_the_reason() {
        let h = harness();
        let request = submitted(&h).await;

        let rejected = h
            .engine
            .reject_request(
                &approver(),
                request.id,
                RejectBody {
                    reason: "over budget".to_string(),
                },
            )
            .await
            .unwrap();
        assert_eq!(rejected.status, RequestStatus::Rejected);
        assert_eq!(rejected.rejection_reason.as_deref(), Some("over budget"));
    }

    #[tokio::test]
    async fn success_callback_completes_request_and_creates_deployment() {
        let h = harness();
        let request = deploying(&h).await;

        h.engine
            .pipeline_callback(request.id, PipelineOutcome::Success, None)
            .await
            .unwrap();

        let completed = h.store.get_request(request.id).await.unwrap();
        assert_eq!(completed.status, RequestStatus::Completed);

        let deployment = h
            .store
            .get_deployment_by_request(request.id)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(deployment.health, DeploymentHealth::Healthy);
        assert_eq!(deployment.owner_email, "dev@example.com");
        assert_eq!(deployment.parameters, completed.parameters);
    }

    #[tokio::test]
    async fn duplicate_callback_is_acknowledged_without_changes() {
        let h = harness();
        let request = deploying(&h).await;

        h.engine
            .pipeline_callback(request.id, PipelineOutcome::Success, None)
            .await
            .unwrap();
        let audit_before = h
            .store
            .list_audit(SubjectKind::Request, request.id)
            .await
            .unwrap()
            .len();

        // Replay: still Ok, still exactly one deployment, still completed,
        // and no further audit entries.
        h.engine
            .pipeline_callback(request.id, PipelineOutcome::Failure, None)
            .await
            .unwrap();

        let request = h.store.get_request(request.id).await.unwrap();
        assert_eq!(request.status, RequestStatus::Completed);
        let deployments = h.store.list_deployments(None).await.unwrap();
        assert_eq!(deployments.len(), 1);
        let audit_after = h
            .store
            .list_audit(SubjectKind::Request, request.id)
            .await
            .unwrap()
            .len();
        assert_eq!(audit_after, audit_before);
    }

    #[tokio::test]
    async fn failure_callback_records_the_detail() {
        let h = harness();
        let request = deploying(&h).await;

        h.engine
            .pipeline_callback(
                request.id,
                PipelineOutcome::Failure,
                Some("quota exceeded".to_string()),
            )
            .await
            .unwrap();

        let failed = h.store.get_request(request.id).await.unwrap();
        assert_eq!(failed.status, RequestStatus::Failed);
        assert_eq!(failed.failure_reason.as_deref(), Some("quota exceeded"));
    }

    #[tokio::test]
    async fn callback_with_unknown_token_is_not_found() {
        let h = harness();
        let err = h
            .engine
            .pipeline_callback(Uuid::new_v4(), PipelineOutcome::Success, None)
            .await
            .unwrap_err();
        assert!(matches!(err, Error::NotFound(_)));
    }

    #[tokio::test]
    async fn scale_guards_owner_state_and_concurrency() {
        let h = harness();
        let deployment = deployed(&h).await;

        let mut parameters = ParameterValues::new();
        parameters.insert("size".to_string(), "large".to_string());
        let scale = ScaleBody {
            parameters: parameters.clone(),
            reason: None,
        };

        // Not the owner.
        let err = h
            .engine
            .submit_scale(&approver(), deployment.id, scale.clone())
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Authorization(_)));

        // Unchanged parameters.
        let mut same = scale.clone();
        same.parameters.insert("size".to_string(), "small".to_string());
        let err = h
            .engine
            .submit_scale(&requester(), deployment.id, same)
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Validation(_)));

        // One active operation at a time.
        h.engine
            .submit_scale(&requester(), deployment.id, scale.clone())
            .await
            .unwrap();
        let err = h
            .engine
            .submit_scale(&requester(), deployment.id, scale)
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Conflict(_)));

        // Destroy is blocked by the active scale operation too.
        let err = h
            .engine
            .submit_destroy(&requester(), deployment.id, DestroyBody::default())
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Conflict(_)));
    }

    #[tokio::test]
    async fn completed_scale_updates_the_deployment_snapshot() {
        let h = harness();
        let deployment = deployed(&h).await;

        let mut parameters = ParameterValues::new();
        parameters.insert("size".to_string(), "large".to_string());
        let operation = h
            .engine
            .submit_scale(
                &requester(),
                deployment.id,
                ScaleBody {
                    parameters,
                    reason: Some("traffic spike".to_string()),
                },
            )
            .await
            .unwrap();

        let operation = h
            .engine
            .approve_operation(&approver(), operation.id)
            .await
            .unwrap();
        assert_eq!(operation.status, RequestStatus::Deploying);

        // The scale run carries the operation selector.
        {
            let triggered = h.gateway.triggered.lock().unwrap();
            let (correlation, parameters) = triggered.last().unwrap();
            assert_eq!(*correlation, operation.id);
            assert_eq!(parameters.get("operation").unwrap(), "scale");
            assert_eq!(parameters.get("size").unwrap(), "large");
        }

        h.engine
            .pipeline_callback(operation.id, PipelineOutcome::Success, None)
            .await
            .unwrap();

        let deployment = h.store.get_deployment(deployment.id).await.unwrap();
        assert_eq!(deployment.parameters.get("size").unwrap(), "large");
        assert_eq!(deployment.health, DeploymentHealth::Healthy);
    }

    #[tokio::test]
    async fn completed_destroy_marks_the_deployment_destroyed() {
        let h = harness();
        let deployment = deployed(&h).await;

        let operation = h
            .engine
            .submit_destroy(
                &requester(),
                deployment.id,
                DestroyBody {
                    reason: Some("no longer needed".to_string()),
                },
            )
            .await
            .unwrap();
        h.engine
            .approve_operation(&approver(), operation.id)
            .await
            .unwrap();
        h.engine
            .pipeline_callback(operation.id, PipelineOutcome::Success, None)
            .await
            .unwrap();

        let destroyed = h.store.get_deployment(deployment.id).await.unwrap();
        assert_eq!(destroyed.health, DeploymentHealth::Destroyed);
        assert!(destroyed.destroyed_at.is_some());
        assert!(!destroyed.is_expired(Utc::now()));

        // Nothing further can be requested against it.
        let err = h
            .engine
            .submit_destroy(&requester(), deployment.id, DestroyBody::default())
            .await
            .unwrap_err();
        assert!(matches!(err, Error::InvalidTransition(_)));
    }

    #[tokio::test]
    async fn operation_approval_notifies_the_requester() {
        let h = harness();
        let deployment = deployed(&h).await;

        let mut parameters = ParameterValues::new();
        parameters.insert("size".to_string(), "large".to_string());
        let operation = h
            .engine
            .submit_scale(
                &requester(),
                deployment.id,
                ScaleBody {
                    parameters,
                    reason: None,
                },
            )
            .await
            .unwrap();
        h.engine
            .approve_operation(&approver(), operation.id)
            .await
            .unwrap();

        let events = h.transport.events.lock().unwrap();
        assert!(events.iter().any(|(kind, recipients)| {
            *kind == NotificationKind::Approved
                && recipients == &vec!["dev@example.com".to_string()]
        }));
    }

    #[tokio::test]
    async fn operation_trigger_failure_notifies_the_requester() {
        let h = harness();
        let deployment = deployed(&h).await;

        let operation = h
            .engine
            .submit_destroy(&requester(), deployment.id, DestroyBody::default())
            .await
            .unwrap();
        h.gateway.fail_trigger.store(true, Ordering::SeqCst);

        let result = h
            .engine
            .approve_operation(&approver(), operation.id)
            .await
            .unwrap();
        assert_eq!(result.status, RequestStatus::Failed);

        let events = h.transport.events.lock().unwrap();
        assert!(events.iter().any(|(kind, recipients)| {
            *kind == NotificationKind::Failed
                && recipients == &vec!["dev@example.com".to_string()]
        }));
    }

    #[tokio::test]
    async fn operation_views_require_owner_or_approver() {
        let h = harness();
        let deployment = deployed(&h).await;
        let operation = h
            .engine
            .submit_destroy(&requester(), deployment.id, DestroyBody::default())
            .await
            .unwrap();

        let outsider = Identity::new("other@example.com", "Other", vec![Role::User]);
        assert!(matches!(
            h.engine.list_operations(&outsider, deployment.id).await,
            Err(Error::Authorization(_))
        ));
        assert!(matches!(
            h.engine.get_operation(&outsider, operation.id).await,
            Err(Error::Authorization(_))
        ));

        assert_eq!(
            h.engine
                .list_operations(&requester(), deployment.id)
                .await
                .unwrap()
                .len(),
            1
        );
        assert_eq!(
            h.engine
                .get_operation(&approver(), operation.id)
                .await
                .unwrap()
                .id,
            operation.id
        );
    }

    #[tokio::test]
    async fn reconcile_skips_operations_with_missing_deployments() {
        let h = harness();
        let request = deploying(&h).await;
        *h.gateway.poll_state.lock().unwrap() = PipelineRunState::Succeeded;

        // A deploying operation whose deployment row is gone must not
        // abort the sweep.
        let now = Utc::now();
        let orphan = Operation {
            id: Uuid::new_v4(),
            deployment_id: Uuid::new_v4(),
            kind: OperationKind::Scale,
            parameters: None,
            reason: None,
            requester_email: "dev@example.com".to_string(),
            requester_name: "Dev".to_string(),
            status: RequestStatus::Deploying,
            approver_email: None,
            approver_name: None,
            decided_at: None,
            rejection_reason: None,
            failure_reason: None,
            pipeline_run: Some(PipelineRunRef {
                run_id: 7,
                url: None,
            }),
            created_at: now,
            updated_at: now,
        };
        h.store.create_operation(&orphan).await.unwrap();

        let resolved = h.engine.reconcile_deploying(Duration::zero()).await.unwrap();
        assert_eq!(resolved, 1);
        assert_eq!(
            h.store.get_request(request.id).await.unwrap().status,
            RequestStatus::Completed
        );
        assert_eq!(
            h.store.get_operation(orphan.id).await.unwrap().status,
            RequestStatus::Deploying
        );
    }

    #[tokio::test]
    async fn reconcile_resolves_finished_runs() {
        let h = harness();
        let request = deploying(&h).await;
        *h.gateway.poll_state.lock().unwrap() = PipelineRunState::Succeeded;

        let resolved = h.engine.reconcile_deploying(Duration::zero()).await.unwrap();
        assert_eq!(resolved, 1);

        let completed = h.store.get_request(request.id).await.unwrap();
        assert_eq!(completed.status, RequestStatus::Completed);
    }

    #[tokio::test]
    async fn reconcile_leaves_running_entities_alone() {
        let h = harness();
        let request = deploying(&h).await;

        let resolved = h.engine.reconcile_deploying(Duration::zero()).await.unwrap();
        assert_eq!(resolved, 0);
        assert_eq!(
            h.store.get_request(request.id).await.unwrap().status,
            RequestStatus::Deploying
        );
    }

    #[tokio::test]
    async fn approval_reminders_are_sent_once() {
        let h = harness();
        let request = submitted(&h).await;

        let sent = h
            .engine
            .send_approval_reminders(Duration::zero())
            .await
            .unwrap();
        assert_eq!(sent, 1);

        let sent = h
            .engine
            .send_approval_reminders(Duration::zero())
            .await
            .unwrap();
        assert_eq!(sent, 0);

        let actions: Vec<String> = h
            .store
            .list_audit(SubjectKind::Request, request.id)
            .await
            .unwrap()
            .into_iter()
            .map(|e| e.action)
            .collect();
        assert_eq!(
            actions
                .iter()
                .filter(|a| *a == "approval_reminder_sent")
                .count(),
            1
        );
    }

    #[tokio::test]
    async fn listing_everything_requires_the_approver_role() {
        let h = harness();
        submitted(&h).await;

        assert!(matches!(
            h.engine.list_requests(&requester(), true).await,
            Err(Error::Authorization(_))
        ));
        assert_eq!(
            h.engine
                .list_requests(&approver(), true)
                .await
                .unwrap()
                .len(),
            1
        );
        // Non-approvers still see their own.
        assert_eq!(
            h.engine
                .list_requests(&requester(), false)
                .await
                .unwrap()
                .len(),
            1
        );

        assert!(matches!(
            h.engine
                .list_audit(&requester(), SubjectKind::Request, Uuid::new_v4())
                .await,
            Err(Error::Authorization(_))
        ));
    }

    #[tokio::test]
    async fn expired_requests_surface_lazily() {
        let h = harness();
        let mut body = submit_body();
        body.expires_at = Some(Utc::now() - Duration::hours(1));
        let request = h.engine.submit_request(&requester(), body).await.unwrap();

        let view = h
            .engine
            .get_request_view(&requester(), request.id)
            .await
            .unwrap();
        assert!(view.expired);
    }
}
