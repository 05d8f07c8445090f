//! Postgres-backed request store.
//!
//! Conditional updates are plain `UPDATE ... WHERE id = $1 AND status = $2
//! RETURNING ...`: a missing returned row means either the entity is gone
//! (NotFound) or another writer advanced it first (Conflict). Durability
//! comes from the database commit before the call returns.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::postgres::PgRow;
use sqlx::types::Json;
use sqlx::{PgPool, Row};
use uuid::Uuid;

use launchpad_models::{
    ApprovalReminder, AuditEntry, Deployment, DeploymentRequest, Error, Identity, Operation,
    ParameterValues, PipelineRunRef, ReminderChannel, RequestStatus, Result, SubjectKind, Tags,
};

use super::RequestStore;

const REQUEST_COLS: &str = "id, template_id, requester_email, requester_name, parameters, \
     status, approver_email, approver_name, decided_at, rejection_reason, failure_reason, \
     cost_center, environment_type, project_code, expires_at, \
     pipeline_run_id, pipeline_run_url, created_at, updated_at";

const OPERATION_COLS: &str = "id, deployment_id, kind, parameters, reason, \
     requester_email, requester_name, status, approver_email, approver_name, decided_at, \
     rejection_reason, failure_reason, pipeline_run_id, pipeline_run_url, \
     created_at, updated_at";

const DEPLOYMENT_COLS: &str = "id, request_id, template_id, owner_email, health, parameters, \
     expires_at, created_at, destroyed_at";

pub struct PgStore {
    pool: PgPool,
}

impl PgStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

fn conflict() -> Error {
    Error::Conflict("state changed, please refresh".to_string())
}

fn run_ref(run_id: Option<i64>, url: Option<String>) -> Option<PipelineRunRef> {
    run_id.map(|run_id| PipelineRunRef { run_id, url })
}

fn map_request(row: &PgRow) -> Result<DeploymentRequest> {
    Ok(DeploymentRequest {
        id: row.try_get("id")?,
        template_id: row.try_get("template_id")?,
        requester_email: row.try_get("requester_email")?,
        requester_name: row.try_get("requester_name")?,
        parameters: row.try_get::<Json<ParameterValues>, _>("parameters")?.0,
        status: row.try_get::<String, _>("status")?.parse()?,
        approver_email: row.try_get("approver_email")?,
        approver_name: row.try_get("approver_name")?,
        decided_at: row.try_get("decided_at")?,
        rejection_reason: row.try_get("rejection_reason")?,
        failure_reason: row.try_get("failure_reason")?,
        tags: Tags {
            cost_center: row.try_get("cost_center")?,
            environment_type: row.try_get("environment_type")?,
            project_code: row.try_get("project_code")?,
        },
        expires_at: row.try_get("expires_at")?,
        pipeline_run: run_ref(
            row.try_get("pipeline_run_id")?,
            row.try_get("pipeline_run_url")?,
        ),
        created_at: row.try_get("created_at")?,
        updated_at: row.try_get("updated_at")?,
    })
}

fn map_operation(row: &PgRow) -> Result<Operation> {
    Ok(Operation {
        id: row.try_get("id")?,
        deployment_id: row.try_get("deployment_id")?,
        kind: row.try_get::<String, _>("kind")?.parse()?,
        parameters: row
            .try_get::<Option<Json<ParameterValues>>, _>("parameters")?
            .map(|p| p.0),
        reason: row.try_get("reason")?,
        requester_email: row.try_get("requester_email")?,
        requester_name: row.try_get("requester_name")?,
        status: row.try_get::<String, _>("status")?.parse()?,
        approver_email: row.try_get("approver_email")?,
        approver_name: row.try_get("approver_name")?,
        decided_at: row.try_get("decided_at")?,
        rejection_reason: row.try_get("rejection_reason")?,
        failure_reason: row.try_get("failure_reason")?,
        pipeline_run: run_ref(
            row.try_get("pipeline_run_id")?,
            row.try_get("pipeline_run_url")?,
        ),
        created_at: row.try_get("created_at")?,
        updated_at: row.try_get("updated_at")?,
    })
}

fn map_deployment(row: &PgRow) -> Result<Deployment> {
    Ok(Deployment {
        id: row.try_get("id")?,
        request_id: row.try_get("request_id")?,
        template_id: row.try_get("template_id")?,
        owner_email: row.try_get("owner_email")?,
        health: row.try_get::<String, _>("health")?.parse()?,
        parameters: row.try_get::<Json<ParameterValues>, _>("parameters")?.0,
        expires_at: row.try_get("expires_at")?,
        created_at: row.try_get("created_at")?,
        destroyed_at: row.try_get("destroyed_at")?,
    })
}

fn map_audit(row: &PgRow) -> Result<AuditEntry> {
    Ok(AuditEntry {
        id: row.try_get("id")?,
        subject_kind: row.try_get::<String, _>("subject_kind")?.parse()?,
        subject_id: row.try_get("subject_id")?,
        actor_email: row.try_get("actor_email")?,
        actor_name: row.try_get("actor_name")?,
        action: row.try_get("action")?,
        detail: row.try_get("detail")?,
        created_at: row.try_get("created_at")?,
    })
}

#[async_trait]
impl RequestStore for PgStore {
    async fn create_request(&self, request: &DeploymentRequest) -> Result<()> {
        sqlx::query(
            "INSERT INTO launchpad.requests \
             (id, template_id, requester_email, requester_name, parameters, status, \
              cost_center, environment_type, project_code, expires_at, created_at, updated_at) \
             VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12)",
        )
        .bind(request.id)
        .bind(&request.template_id)
        .bind(&request.requester_email)
        .bind(&request.requester_name)
        .bind(Json(&request.parameters))
        .bind(request.status.as_str())
        .bind(&request.tags.cost_center)
        .bind(&request.tags.environment_type)
        .bind(&request.tags.project_code)
        .bind(request.expires_at)
        .bind(request.created_at)
        .bind(request.updated_at)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn get_request(&self, id: Uuid) -> Result<DeploymentRequest> {
        let row = sqlx::query(&format!(
            "SELECT {REQUEST_COLS} FROM launchpad.requests WHERE id = $1"
        ))
        .bind(id)
        .fetch_optional(&self.pool)
        .await?
        .ok_or_else(|| Error::NotFound(format!("request {id} not found")))?;
        map_request(&row)
    }

    async fn list_requests(&self, requester: Option<&str>) -> Result<Vec<DeploymentRequest>> {
        let rows = match requester {
            Some(email) => {
                sqlx::query(&format!(
                    "SELECT {REQUEST_COLS} FROM launchpad.requests \
                     WHERE requester_email = $1 ORDER BY created_at DESC"
                ))
                .bind(email)
                .fetch_all(&self.pool)
                .await?
            }
            None => {
                sqlx::query(&format!(
                    "SELECT {REQUEST_COLS} FROM launchpad.requests ORDER BY created_at DESC"
                ))
                .fetch_all(&self.pool)
                .await?
            }
        };
        rows.iter().map(map_request).collect()
    }

    async fn set_request_decision(
        &self,
        id: Uuid,
        expected: RequestStatus,
        new_status: RequestStatus,
        approver: &Identity,
        rejection_reason: Option<String>,
    ) -> Result<DeploymentRequest> {
        let row = sqlx::query(&format!(
            "UPDATE launchpad.requests \
             SET status = $3, approver_email = $4, approver_name = $5, \
                 decided_at = NOW(), rejection_reason = $6, updated_at = NOW() \
             WHERE id = $1 AND status = $2 \
             RETURNING {REQUEST_COLS}"
        ))
        .bind(id)
        .bind(expected.as_str())
        .bind(new_status.as_str())
        .bind(&approver.email)
        .bind(&approver.name)
        .bind(rejection_reason)
        .fetch_optional(&self.pool)
        .await?;

        match row {
            Some(row) => map_request(&row),
            // Distinguish a vanished row from a lost race.
            None => {
                self.get_request(id).await?;
                Err(conflict())
            }
        }
    }

    async fn set_request_pipeline(
        &self,
        id: Uuid,
        expected: RequestStatus,
        new_status: RequestStatus,
        run: Option<PipelineRunRef>,
        failure_reason: Option<String>,
    ) -> Result<DeploymentRequest> {
        let row = sqlx::query(&format!(
            "UPDATE launchpad.requests \
             SET status = $3, \
                 pipeline_run_id = COALESCE($4, pipeline_run_id), \
                 pipeline_run_url = COALESCE($5, pipeline_run_url), \
                 failure_reason = COALESCE($6, failure_reason), \
                 updated_at = NOW() \
             WHERE id = $1 AND status = $2 \
             RETURNING {REQUEST_COLS}"
        ))
        .bind(id)
        .bind(expected.as_str())
        .bind(new_status.as_str())
        .bind(run.as_ref().map(|r| r.run_id))
        .bind(run.as_ref().and_then(|r| r.url.clone()))
        .bind(failure_reason)
        .fetch_optional(&self.pool)
        .await?;

        match row {
            Some(row) => map_request(&row),
            None => {
                self.get_request(id).await?;
                Err(conflict())
            }
        }
    }

    async fn list_pending_requests_older_than(
        &self,
        cutoff: DateTime<Utc>,
    ) -> Result<Vec<DeploymentRequest>> {
        let rows = sqlx::query(&format!(
            "SELECT {REQUEST_COLS} FROM launchpad.requests \
             WHERE status = 'pending_approval' AND created_at < $1 \
             ORDER BY created_at ASC"
        ))
        .bind(cutoff)
        .fetch_all(&self.pool)
        .await?;
        rows.iter().map(map_request).collect()
    }

    async fn list_deploying_requests_older_than(
        &self,
        cutoff: DateTime<Utc>,
    ) -> Result<Vec<DeploymentRequest>> {
        let rows = sqlx::query(&format!(
            "SELECT {REQUEST_COLS} FROM launchpad.requests \
             WHERE status = 'deploying' AND updated_at < $1"
        ))
        .bind(cutoff)
        .fetch_all(&self.pool)
        .await?;
        rows.iter().map(map_request).collect()
    }

    async fn create_operation(&self, operation: &Operation) -> Result<()> {
        sqlx::query(
            "INSERT INTO launchpad.operations \
             (id, deployment_id, kind, parameters, reason, requester_email, requester_name, \
              status, created_at, updated_at) \
             VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10)",
        )
        .bind(operation.id)
        .bind(operation.deployment_id)
        .bind(operation.kind.as_str())
        .bind(operation.parameters.as_ref().map(Json))
        .bind(&operation.reason)
        .bind(&operation.requester_email)
        .bind(&operation.requester_name)
        .bind(operation.status.as_str())
        .bind(operation.created_at)
        .bind(operation.updated_at)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn get_operation(&self, id: Uuid) -> Result<Operation> {
        let row = sqlx::query(&format!(
            "SELECT {OPERATION_COLS} FROM launchpad.operations WHERE id = $1"
        ))
        .bind(id)
        .fetch_optional(&self.pool)
        .await?
        .ok_or_else(|| Error::NotFound(format!("operation {id} not found")))?;
        map_operation(&row)
    }

    async fn list_operations(&self, deployment_id: Uuid) -> Result<Vec<Operation>> {
        let rows = sqlx::query(&format!(
            "SELECT {OPERATION_COLS} FROM launchpad.operations \
             WHERE deployment_id = $1 ORDER BY created_at DESC"
        ))
        .bind(deployment_id)
        .fetch_all(&self.pool)
        .await?;
        rows.iter().map(map_operation).collect()
    }

    async fn active_operation(&self, deployment_id: Uuid) -> Result<Option<Operation>> {
        let row = sqlx::query(&format!(
            "SELECT {OPERATION_COLS} FROM launchpad.operations \
             WHERE deployment_id = $1 \
             AND status NOT IN ('rejected', 'completed', 'failed') \
             LIMIT 1"
        ))
        .bind(deployment_id)
        .fetch_optional(&self.pool)
        .await?;
        row.as_ref().map(map_operation).transpose()
    }

    async fn set_operation_decision(
        &self,
        id: Uuid,
        expected: RequestStatus,
        new_status: RequestStatus,
        approver: &Identity,
        rejection_reason: Option<String>,
    ) -> Result<Operation> {
        let row = sqlx::query(&format!(
            "UPDATE launchpad.operations \
             SET status = $3, approver_email = $4, approver_name = $5, \
                 decided_at = NOW(), rejection_reason = $6, updated_at = NOW() \
             WHERE id = $1 AND status = $2 \
             RETURNING {OPERATION_COLS}"
        ))
        .bind(id)
        .bind(expected.as_str())
        .bind(new_status.as_str())
        .bind(&approver.email)
        .bind(&approver.name)
        .bind(rejection_reason)
        .fetch_optional(&self.pool)
        .await?;

        match row {
            Some(row) => map_operation(&row),
            None => {
                self.get_operation(id).await?;
                Err(conflict())
            }
        }
    }

    async fn set_operation_pipeline(
        &self,
        id: Uuid,
        expected: RequestStatus,
        new_status: RequestStatus,
        run: Option<PipelineRunRef>,
        failure_reason: Option<String>,
    ) -> Result<Operation> {
        let row = sqlx::query(&format!(
            "UPDATE launchpad.operations \
             SET status = $3, \
                 pipeline_run_id = COALESCE($4, pipeline_run_id), \
                 pipeline_run_url = COALESCE($5, pipeline_run_url), \
                 failure_reason = COALESCE($6, failure_reason), \
                 updated_at = NOW() \
             WHERE id = $1 AND status = $2 \
             RETURNING {OPERATION_COLS}"
        ))
        .bind(id)
        .bind(expected.as_str())
        .bind(new_status.as_str())
        .bind(run.as_ref().map(|r| r.run_id))
        .bind(run.as_ref().and_then(|r| r.url.clone()))
        .bind(failure_reason)
        .fetch_optional(&self.pool)
        .await?;

        match row {
            Some(row) => map_operation(&row),
            None => {
                self.get_operation(id).await?;
                Err(conflict())
            }
        }
    }

    async fn list_deploying_operations_older_than(
        &self,
        cutoff: DateTime<Utc>,
    ) -> Result<Vec<Operation>> {
        let rows = sqlx::query(&format!(
            "SELECT {OPERATION_COLS} FROM launchpad.operations \
             WHERE status = 'deploying' AND updated_at < $1"
        ))
        .bind(cutoff)
        .fetch_all(&self.pool)
        .await?;
        rows.iter().map(map_operation).collect()
    }

    async fn create_deployment(&self, deployment: &Deployment) -> Result<()> {
        sqlx::query(
            "INSERT INTO launchpad.deployments \
             (id, request_id, template_id, owner_email, health, parameters, expires_at, created_at) \
             VALUES ($1, $2, $3, $4, $5, $6, $7, $8)",
        )
        .bind(deployment.id)
        .bind(deployment.request_id)
        .bind(&deployment.template_id)
        .bind(&deployment.owner_email)
        .bind(deployment.health.as_str())
        .bind(Json(&deployment.parameters))
        .bind(deployment.expires_at)
        .bind(deployment.created_at)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn get_deployment(&self, id: Uuid) -> Result<Deployment> {
        let row = sqlx::query(&format!(
            "SELECT {DEPLOYMENT_COLS} FROM launchpad.deployments WHERE id = $1"
        ))
        .bind(id)
        .fetch_optional(&self.pool)
        .await?
        .ok_or_else(|| Error::NotFound(format!("deployment {id} not found")))?;
        map_deployment(&row)
    }

    async fn get_deployment_by_request(&self, request_id: Uuid) -> Result<Option<Deployment>> {
        let row = sqlx::query(&format!(
            "SELECT {DEPLOYMENT_COLS} FROM launchpad.deployments WHERE request_id = $1"
        ))
        .bind(request_id)
        .fetch_optional(&self.pool)
        .await?;
        row.as_ref().map(map_deployment).transpose()
    }

    async fn list_deployments(&self, owner: Option<&str>) -> Result<Vec<Deployment>> {
        let rows = match owner {
            Some(email) => {
                sqlx::query(&format!(
                    "SELECT {DEPLOYMENT_COLS} FROM launchpad.deployments \
                     WHERE owner_email = $1 ORDER BY created_at DESC"
                ))
                .bind(email)
                .fetch_all(&self.pool)
                .await?
            }
            None => {
                sqlx::query(&format!(
                    "SELECT {DEPLOYMENT_COLS} FROM launchpad.deployments ORDER BY created_at DESC"
                ))
                .fetch_all(&self.pool)
                .await?
            }
        };
        rows.iter().map(map_deployment).collect()
    }

    async fn set_deployment_parameters(
        &self,
        id: Uuid,
        parameters: &ParameterValues,
    ) -> Result<Deployment> {
        let row = sqlx::query(&format!(
            "UPDATE launchpad.deployments SET parameters = $2 \
             WHERE id = $1 RETURNING {DEPLOYMENT_COLS}"
        ))
        .bind(id)
        .bind(Json(parameters))
        .fetch_optional(&self.pool)
        .await?
        .ok_or_else(|| Error::NotFound(format!("deployment {id} not found")))?;
        map_deployment(&row)
    }

    async fn set_deployment_destroyed(&self, id: Uuid, at: DateTime<Utc>) -> Result<Deployment> {
        let row = sqlx::query(&format!(
            "UPDATE launchpad.deployments SET health = 'destroyed', destroyed_at = $2 \
             WHERE id = $1 RETURNING {DEPLOYMENT_COLS}"
        ))
        .bind(id)
        .bind(at)
        .fetch_optional(&self.pool)
        .await?
        .ok_or_else(|| Error::NotFound(format!("deployment {id} not found")))?;
        map_deployment(&row)
    }

    async fn append_audit(&self, entry: &AuditEntry) -> Result<()> {
        sqlx::query(
            "INSERT INTO launchpad.audit_log \
             (id, subject_kind, subject_id, actor_email, actor_name, action, detail, created_at) \
             VALUES ($1, $2, $3, $4, $5, $6, $7, $8)",
        )
        .bind(entry.id)
        .bind(entry.subject_kind.as_str())
        .bind(entry.subject_id)
        .bind(&entry.actor_email)
        .bind(&entry.actor_name)
        .bind(&entry.action)
        .bind(&entry.detail)
        .bind(entry.created_at)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn list_audit(&self, kind: SubjectKind, subject_id: Uuid) -> Result<Vec<AuditEntry>> {
        let rows = sqlx::query(
            "SELECT id, subject_kind, subject_id, actor_email, actor_name, action, detail, created_at \
             FROM launchpad.audit_log \
             WHERE subject_kind = $1 AND subject_id = $2 \
             ORDER BY created_at ASC",
        )
        .bind(kind.as_str())
        .bind(subject_id)
        .fetch_all(&self.pool)
        .await?;
        rows.iter().map(map_audit).collect()
    }

    async fn record_reminder(&self, reminder: &ApprovalReminder) -> Result<()> {
        sqlx::query(
            "INSERT INTO launchpad.approval_reminders (id, request_id, channel, sent_at) \
             VALUES ($1, $2, $3, $4)",
        )
        .bind(reminder.id)
        .bind(reminder.request_id)
        .bind(reminder.channel.as_str())
        .bind(reminder.sent_at)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn has_reminder(&self, request_id: Uuid, channel: ReminderChannel) -> Result<bool> {
        let row: Option<(bool,)> = sqlx::query_as(
            "SELECT EXISTS (SELECT 1 FROM launchpad.approval_reminders \
             WHERE request_id = $1 AND channel = $2)",
        )
        .bind(request_id)
        .bind(channel.as_str())
        .fetch_optional(&self.pool)
        .await?;
        Ok(row.map(|(exists,)| exists).unwrap_or(false))
    }
}
