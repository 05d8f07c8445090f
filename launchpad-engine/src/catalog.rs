//! Catalog registry: immutable template definitions.
//!
//! Templates are authored as YAML files in a catalog directory and
//! loaded once at startup. The registry is consumed read-only by the
//! lifecycle engine; a single synchronous lookup is the only catalog
//! access inside any write path.

use std::collections::HashMap;
use std::path::Path;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

use launchpad_models::{Error, ParameterValues};

/// Value type of a template parameter.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum ParameterType {
    #[default]
    String,
    Number,
    Select,
    Boolean,
}

/// A parameter users must provide when requesting a deployment.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ParameterSpec {
    pub name: String,
    #[serde(default)]
    pub label: Option<String>,
    #[serde(rename = "type", default)]
    pub kind: ParameterType,
    #[serde(default)]
    pub description: String,
    #[serde(default = "default_true")]
    pub required: bool,
    #[serde(default)]
    pub default: Option<String>,
    /// Allowed values for `select` parameters.
    #[serde(default)]
    pub options: Vec<String>,
    #[serde(default)]
    pub min_value: Option<i64>,
    #[serde(default)]
    pub max_value: Option<i64>,
}

impl ParameterSpec {
    pub fn label(&self) -> &str {
        self.label.as_deref().unwrap_or(&self.name)
    }
}

fn default_true() -> bool {
    true
}

fn default_branch() -> String {
    "main".to_string()
}

/// Reference to the pipeline that provisions a template.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PipelineBinding {
    pub project: String,
    pub pipeline_id: i64,
    #[serde(default = "default_branch")]
    pub branch: String,
    /// Module selector for the shared generic pipeline, when set.
    #[serde(default)]
    pub module_name: Option<String>,
}

/// One line of the cost estimate.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CostComponent {
    pub component: String,
    pub estimate: String,
}

/// A deployable template available in the catalog.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Template {
    pub id: String,
    pub name: String,
    #[serde(default)]
    pub description: String,
    #[serde(default = "default_category")]
    pub category: String,
    #[serde(default = "default_cost")]
    pub estimated_monthly_cost_usd: String,
    #[serde(default)]
    pub cost_breakdown: Vec<CostComponent>,
    #[serde(default)]
    pub parameters: Vec<ParameterSpec>,
    pub pipeline: PipelineBinding,
    #[serde(default)]
    pub icon: Option<String>,
    #[serde(default)]
    pub skill_level: Option<String>,
    #[serde(default)]
    pub tags: Vec<String>,
}

fn default_category() -> String {
    "general".to_string()
}

fn default_cost() -> String {
    "Unknown".to_string()
}

/// Read-only source of template definitions.
pub trait CatalogRegistry: Send + Sync {
    fn get_template(&self, id: &str) -> Option<Template>;
    fn list(&self) -> Vec<Template>;
}

/// Catalog backed by `*.yaml` files in a directory.
pub struct YamlCatalog {
    items: HashMap<String, Template>,
}

impl YamlCatalog {
    pub fn load(dir: impl AsRef<Path>) -> Result<Self> {
        let dir = dir.as_ref();
        let mut items = HashMap::new();

        if !dir.exists() {
            tracing::warn!("catalog directory {} does not exist", dir.display());
            return Ok(Self { items });
        }

        for entry in std::fs::read_dir(dir)
            .with_context(|| format!("failed to read catalog directory {}", dir.display()))?
        {
            let path = entry?.path();
            if path.extension().and_then(|e| e.to_str()) != Some("yaml") {
                continue;
            }

            let raw = std::fs::read_to_string(&path)
                .with_context(|| format!("failed to read {}", path.display()))?;
            match serde_yaml::from_str::<Template>(&raw) {
                Ok(template) => {
                    tracing::debug!("loaded catalog template '{}'", template.id);
                    items.insert(template.id.clone(), template);
                }
                Err(err) => {
                    // A broken file must not take the whole catalog down.
                    tracing::error!("skipping invalid catalog file {}: {err}", path.display());
                }
            }
        }

        tracing::info!("catalog loaded: {} templates", items.len());
        Ok(Self { items })
    }

    /// Builds a catalog from already-parsed templates. Used by tests and
    /// seeding tools.
    pub fn from_templates(templates: Vec<Template>) -> Self {
        Self {
            items: templates.into_iter().map(|t| (t.id.clone(), t)).collect(),
        }
    }
}

impl CatalogRegistry for YamlCatalog {
    fn get_template(&self, id: &str) -> Option<Template> {
        self.items.get(id).cloned()
    }

    fn list(&self) -> Vec<Template> {
        let mut all: Vec<Template> = self.items.values().cloned().collect();
        all.sort_by(|a, b| a.id.cmp(&b.id));
        all
    }
}

/// Validates submitted values against a template's parameter schema and
/// returns the normalized set (defaults applied, unknown keys dropped).
///
/// Rejected before any state change; the returned message names the
/// offending field.
pub fn validate_parameters(
    template: &Template,
    values: &ParameterValues,
) -> launchpad_models::Result<ParameterValues> {
    let mut normalized = ParameterValues::new();

    for spec in &template.parameters {
        let value = values
            .get(&spec.name)
            .filter(|v| !v.is_empty())
            .cloned()
            .or_else(|| spec.default.clone());

        let Some(value) = value else {
            if spec.required {
                return Err(Error::Validation(format!(
                    "required field '{}' is missing",
                    spec.label()
                )));
            }
            continue;
        };

        match spec.kind {
            ParameterType::String => {}
            ParameterType::Select => {
                if !spec.options.contains(&value) {
                    return Err(Error::Validation(format!(
                        "'{}' is not a valid choice for '{}'",
                        value,
                        spec.label()
                    )));
                }
            }
            ParameterType::Number => {
                let n: i64 = value.parse().map_err(|_| {
                    Error::Validation(format!("'{}' must be a number", spec.label()))
                })?;
                if let Some(min) = spec.min_value {
                    if n < min {
                        return Err(Error::Validation(format!(
                            "'{}' must be at least {min}",
                            spec.label()
                        )));
                    }
                }
                if let Some(max) = spec.max_value {
                    if n > max {
                        return Err(Error::Validation(format!(
                            "'{}' must be at most {max}",
                            spec.label()
                        )));
                    }
                }
            }
            ParameterType::Boolean => {
                if value != "true" && value != "false" {
                    return Err(Error::Validation(format!(
                        "'{}' must be true or false",
                        spec.label()
                    )));
                }
            }
        }

        normalized.insert(spec.name.clone(), value);
    }

    Ok(normalized)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn vm_template() -> Template {
        serde_yaml::from_str(
            r#"
id: vm-basic
name: Basic Virtual Machine
description: A single VM with managed disk
category: compute
estimated_monthly_cost_usd: "150-300"
cost_breakdown:
  - component: Compute
    estimate: "~120"
  - component: Disk
    estimate: "~30"
parameters:
  - name: size
    label: VM Size
    type: select
    options: [small, medium, large]
  - name: disk_gb
    type: number
    required: false
    default: "64"
    min_value: 32
    max_value: 1024
  - name: public_ip
    type: boolean
    required: false
pipeline:
  project: infra
  pipeline_id: 42
  module_name: vm-basic
"#,
        )
        .unwrap()
    }

    #[test]
    fn parses_yaml_with_defaults() {
        let t = vm_template();
        assert_eq!(t.pipeline.branch, "main");
        assert_eq!(t.parameters[0].kind, ParameterType::Select);
        assert!(t.parameters[0].required);
        assert_eq!(t.parameters[1].default.as_deref(), Some("64"));
    }

    #[test]
    fn validation_applies_defaults_and_drops_unknown_keys() {
        let t = vm_template();
        let mut values = ParameterValues::new();
        values.insert("size".to_string(), "small".to_string());
        values.insert("rogue".to_string(), "x".to_string());

        let normalized = validate_parameters(&t, &values).unwrap();
        assert_eq!(normalized.get("size").unwrap(), "small");
        assert_eq!(normalized.get("disk_gb").unwrap(), "64");
        assert!(!normalized.contains_key("rogue"));
        assert!(!normalized.contains_key("public_ip"));
    }

    #[test]
    fn validation_rejects_missing_required() {
        let t = vm_template();
        let err = validate_parameters(&t, &ParameterValues::new()).unwrap_err();
        assert!(matches!(err, Error::Validation(msg) if msg.contains("VM Size")));
    }

    #[test]
    fn validation_rejects_bad_values() {
        let t = vm_template();

        let mut values = ParameterValues::new();
        values.insert("size".to_string(), "gigantic".to_string());
        assert!(matches!(
            validate_parameters(&t, &values),
            Err(Error::Validation(_))
        ));

        values.insert("size".to_string(), "small".to_string());
        values.insert("disk_gb".to_string(), "8192".to_string());
        assert!(matches!(
            validate_parameters(&t, &values),
            Err(Error::Validation(_))
        ));

        values.insert("disk_gb".to_string(), "128".to_string());
        values.insert("public_ip".to_string(), "maybe".to_string());
        assert!(matches!(
            validate_parameters(&t, &values),
            Err(Error::Validation(_))
        ));
    }

    #[test]
    fn loads_directory_and_skips_broken_files() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(
            dir.path().join("vm.yaml"),
            "id: vm\nname: VM\npipeline:\n  project: infra\n  pipeline_id: 1\n",
        )
        .unwrap();
        std::fs::write(dir.path().join("broken.yaml"), "id: [unclosed").unwrap();
        std::fs::write(dir.path().join("notes.txt"), "ignored").unwrap();

        let catalog = YamlCatalog::load(dir.path()).unwrap();
        assert_eq!(catalog.list().len(), 1);
        assert!(catalog.get_template("vm").is_some());
        assert!(catalog.get_template("broken").is_none());
    }
}
