//! Pipeline gateway: triggers and polls the external pipeline runner.
//!
//! The runner is opaque; all the engine needs is a run reference back
//! from `trigger` and a coarse run state from `poll`. Every trigger call
//! carries the originating request/operation id as a correlation token
//! so a retried trigger never double-provisions.

use std::time::Duration;

use async_trait::async_trait;
use uuid::Uuid;

use launchpad_models::{Error, ParameterValues, PipelineRunRef, Result};

use crate::catalog::PipelineBinding;

const API_VERSION: &str = "7.0";
const REQUEST_TIMEOUT: Duration = Duration::from_secs(30);

/// Coarse state of a pipeline run as seen by `poll`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PipelineRunState {
    Running,
    Succeeded,
    Failed,
}

#[async_trait]
pub trait PipelineGateway: Send + Sync {
    /// Starts a run. Fails with `PipelineUnavailable` on transport
    /// trouble and `PipelineRejected` when the runner refuses the
    /// parameters.
    async fn trigger(
        &self,
        binding: &PipelineBinding,
        parameters: &ParameterValues,
        correlation: Uuid,
    ) -> Result<PipelineRunRef>;

    /// Current state of a previously triggered run. Used by the
    /// reconciliation sweep for runners without push callbacks.
    async fn poll(&self, binding: &PipelineBinding, run: &PipelineRunRef)
        -> Result<PipelineRunState>;
}

/// Gateway for an Azure-DevOps-style REST pipeline runner.
pub struct HttpPipelineGateway {
    http: reqwest::Client,
    org_url: String,
    pat: String,
}

impl HttpPipelineGateway {
    pub fn new(org_url: impl Into<String>, pat: impl Into<String>) -> Result<Self> {
        let http = reqwest::Client::builder()
            .timeout(REQUEST_TIMEOUT)
            .build()
            .map_err(|e| Error::PipelineUnavailable(format!("failed to build client: {e}")))?;

        Ok(Self {
            http,
            org_url: org_url.into().trim_end_matches('/').to_string(),
            pat: pat.into(),
        })
    }
}

/// Request body for a pipeline run, visible for tests.
pub(crate) fn run_payload(
    binding: &PipelineBinding,
    parameters: &ParameterValues,
    correlation: Uuid,
) -> serde_json::Value {
    let mut template_params = serde_json::Map::new();
    for (name, value) in parameters {
        template_params.insert(name.clone(), serde_json::Value::String(value.clone()));
    }
    if let Some(module) = &binding.module_name {
        template_params.insert(
            "module_name".to_string(),
            serde_json::Value::String(module.clone()),
        );
    }
    template_params.insert(
        "correlation_token".to_string(),
        serde_json::Value::String(correlation.to_string()),
    );

    serde_json::json!({
        "resources": {
            "repositories": {
                "self": { "refName": format!("refs/heads/{}", binding.branch) }
            }
        },
        "templateParameters": template_params,
    })
}

/// Maps the runner's build status/result pair onto a run state.
pub(crate) fn map_build_state(status: &str, result: Option<&str>) -> PipelineRunState {
    match status {
        "completed" => match result {
            Some("succeeded") => PipelineRunState::Succeeded,
            _ => PipelineRunState::Failed,
        },
        // notStarted, inProgress, postponed, ...
        _ => PipelineRunState::Running,
    }
}

#[async_trait]
impl PipelineGateway for HttpPipelineGateway {
    async fn trigger(
        &self,
        binding: &PipelineBinding,
        parameters: &ParameterValues,
        correlation: Uuid,
    ) -> Result<PipelineRunRef> {
        let url = format!(
            "{}/{}/_apis/pipelines/{}/runs?api-version={API_VERSION}",
            self.org_url, binding.project, binding.pipeline_id
        );

        let response = self
            .http
            .post(&url)
            .basic_auth("", Some(&self.pat))
            .json(&run_payload(binding, parameters, correlation))
            .send()
            .await
            .map_err(|e| Error::PipelineUnavailable(format!("trigger call failed: {e}")))?;

        let status = response.status();
        if status.is_client_error() {
            let body = response.text().await.unwrap_or_default();
            return Err(Error::PipelineRejected(format!(
                "runner refused the run ({status}): {body}"
            )));
        }
        if !status.is_success() {
            return Err(Error::PipelineUnavailable(format!(
                "runner returned {status}"
            )));
        }

        let data: serde_json::Value = response
            .json()
            .await
            .map_err(|e| Error::PipelineUnavailable(format!("unreadable trigger response: {e}")))?;

        let run_id = data
            .get("id")
            .and_then(|v| v.as_i64())
            .ok_or_else(|| Error::PipelineUnavailable("trigger response missing run id".into()))?;
        let url = data
            .pointer("/_links/web/href")
            .and_then(|v| v.as_str())
            .map(|s| s.to_string());

        Ok(PipelineRunRef { run_id, url })
    }

    async fn poll(
        &self,
        binding: &PipelineBinding,
        run: &PipelineRunRef,
    ) -> Result<PipelineRunState> {
        let url = format!(
            "{}/{}/_apis/build/builds/{}?api-version={API_VERSION}",
            self.org_url, binding.project, run.run_id
        );

        let response = self
            .http
            .get(&url)
            .basic_auth("", Some(&self.pat))
            .send()
            .await
            .map_err(|e| Error::PipelineUnavailable(format!("poll call failed: {e}")))?;

        if !response.status().is_success() {
            return Err(Error::PipelineUnavailable(format!(
                "poll returned {}",
                response.status()
            )));
        }

        let data: serde_json::Value = response
            .json()
            .await
            .map_err(|e| Error::PipelineUnavailable(format!("unreadable poll response: {e}")))?;

        let status = data.get("status").and_then(|v| v.as_str()).unwrap_or("");
        let result = data.get("result").and_then(|v| v.as_str());
        Ok(map_build_state(status, result))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn binding() -> PipelineBinding {
        PipelineBinding {
            project: "infra".to_string(),
            pipeline_id: 42,
            branch: "main".to_string(),
            module_name: Some("vm-basic".to_string()),
        }
    }

    #[test]
    fn payload_carries_branch_module_and_correlation() {
        let mut params = ParameterValues::new();
        params.insert("size".to_string(), "small".to_string());
        let correlation = Uuid::new_v4();

        let payload = run_payload(&binding(), &params, correlation);

        assert_eq!(
            payload.pointer("/resources/repositories/self/refName"),
            Some(&serde_json::json!("refs/heads/main"))
        );
        assert_eq!(
            payload.pointer("/templateParameters/size"),
            Some(&serde_json::json!("small"))
        );
        assert_eq!(
            payload.pointer("/templateParameters/module_name"),
            Some(&serde_json::json!("vm-basic"))
        );
        assert_eq!(
            payload.pointer("/templateParameters/correlation_token"),
            Some(&serde_json::json!(correlation.to_string()))
        );
    }

    #[test]
    fn build_state_mapping() {
        assert_eq!(map_build_state("inProgress", None), PipelineRunState::Running);
        assert_eq!(map_build_state("notStarted", None), PipelineRunState::Running);
        assert_eq!(
            map_build_state("completed", Some("succeeded")),
            PipelineRunState::Succeeded
        );
        assert_eq!(
            map_build_state("completed", Some("failed")),
            PipelineRunState::Failed
        );
        assert_eq!(
            map_build_state("completed", Some("canceled")),
            PipelineRunState::Failed
        );
    }
}
