use anyhow::{Context, Result};
use sqlx::postgres::PgPoolOptions;
use sqlx::PgPool;

pub async fn connect(db_url: &str) -> Result<PgPool> {
    PgPoolOptions::new()
        .max_connections(10)
        .connect(db_url)
        .await
        .context("Failed to connect to database")
}

/// Create the launchpad schema and tables if they do not exist.
pub async fn initialize_schema(pool: &PgPool) -> Result<()> {
    sqlx::query("CREATE SCHEMA IF NOT EXISTS launchpad")
        .execute(pool)
        .await
        .context("Failed to create launchpad schema")?;

    sqlx::query(
        "CREATE TABLE IF NOT EXISTS launchpad.requests (
            id UUID PRIMARY KEY,
            template_id TEXT NOT NULL,
            requester_email TEXT NOT NULL,
            requester_name TEXT NOT NULL,
            parameters JSONB NOT NULL DEFAULT '{}'::jsonb,
            status TEXT NOT NULL,
            approver_email TEXT,
            approver_name TEXT,
            decided_at TIMESTAMPTZ,
            rejection_reason TEXT,
            failure_reason TEXT,
            cost_center TEXT,
            environment_type TEXT,
            project_code TEXT,
            expires_at TIMESTAMPTZ,
            pipeline_run_id BIGINT,
            pipeline_run_url TEXT,
            created_at TIMESTAMPTZ NOT NULL,
            updated_at TIMESTAMPTZ NOT NULL
        )",
    )
    .execute(pool)
    .await
    .context("Failed to create requests table")?;

    sqlx::query(
        "CREATE INDEX IF NOT EXISTS idx_requests_status
         ON launchpad.requests (status)",
    )
    .execute(pool)
    .await
    .context("Failed to create requests status index")?;

    sqlx::query(
        "CREATE TABLE IF NOT EXISTS launchpad.deployments (
            id UUID PRIMARY KEY,
            request_id UUID NOT NULL,
            template_id TEXT NOT NULL,
            owner_email TEXT NOT NULL,
            health TEXT NOT NULL,
            parameters JSONB NOT NULL DEFAULT '{}'::jsonb,
            expires_at TIMESTAMPTZ,
            created_at TIMESTAMPTZ NOT NULL,
            destroyed_at TIMESTAMPTZ
        )",
    )
    .execute(pool)
    .await
    .context("Failed to create deployments table")?;

    sqlx::query(
        "CREATE TABLE IF NOT EXISTS launchpad.operations (
            id UUID PRIMARY KEY,
            deployment_id UUID NOT NULL,
            kind TEXT NOT NULL,
            parameters JSONB,
            reason TEXT,
            requester_email TEXT NOT NULL,
            requester_name TEXT NOT NULL,
            status TEXT NOT NULL,
            approver_email TEXT,
            approver_name TEXT,
            decided_at TIMESTAMPTZ,
            rejection_reason TEXT,
            failure_reason TEXT,
            pipeline_run_id BIGINT,
            pipeline_run_url TEXT,
            created_at TIMESTAMPTZ NOT NULL,
            updated_at TIMESTAMPTZ NOT NULL
        )",
    )
    .execute(pool)
    .await
    .context("Failed to create operations table")?;

    sqlx::query(
        "CREATE INDEX IF NOT EXISTS idx_operations_deployment
         ON launchpad.operations (deployment_id, status)",
    )
    .execute(pool)
    .await
    .context("Failed to create operations deployment index")?;

    sqlx::query(
        "CREATE TABLE IF NOT EXISTS launchpad.audit_log (
            id UUID PRIMARY KEY,
            subject_kind TEXT NOT NULL,
            subject_id UUID NOT NULL,
            actor_email TEXT NOT NULL,
            actor_name TEXT NOT NULL,
            action TEXT NOT NULL,
            detail JSONB NOT NULL DEFAULT '{}'::jsonb,
            created_at TIMESTAMPTZ NOT NULL
        )",
    )
    .execute(pool)
    .await
    .context("Failed to create audit_log table")?;

    sqlx::query(
        "CREATE INDEX IF NOT EXISTS idx_audit_subject
         ON launchpad.audit_log (subject_kind, subject_id, created_at)",
    )
    .execute(pool)
    .await
    .context("Failed to create audit subject index")?;

    sqlx::query(
        "CREATE TABLE IF NOT EXISTS launchpad.approval_reminders (
            id UUID PRIMARY KEY,
            request_id UUID NOT NULL,
            channel TEXT NOT NULL,
            sent_at TIMESTAMPTZ NOT NULL,
            UNIQUE (request_id, channel)
        )",
    )
    .execute(pool)
    .await
    .context("Failed to create approval_reminders table")?;

    tracing::info!("launchpad schema ready");
    Ok(())
}
