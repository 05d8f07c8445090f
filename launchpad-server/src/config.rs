use anyhow::{Context, Result};

#[derive(Debug, Clone)]
pub struct Config {
    pub database_url: Option<String>,
    pub server_host: String,
    pub server_port: u16,
    pub catalog_dir: String,
    pub pipeline_org_url: Option<String>,
    pub pipeline_pat: Option<String>,
    pub pipeline_callback_secret: Option<String>,
    pub chat_webhook_url: Option<String>,
    pub approver_recipients: Vec<String>,
    pub portal_base_url: Option<String>,
}

impl Config {
    pub fn load() -> Result<Self> {
        dotenvy::dotenv().ok();

        Ok(Self {
            database_url: std::env::var("DATABASE_URL").ok(),
            server_host: std::env::var("SERVER_HOST")
                .unwrap_or_else(|_| "0.0.0.0".to_string()),
            server_port: std::env::var("SERVER_PORT")
                .unwrap_or_else(|_| "3000".to_string())
                .parse()
                .context("SERVER_PORT must be a valid port number")?,
            catalog_dir: std::env::var("CATALOG_DIR")
                .unwrap_or_else(|_| "catalog".to_string()),
            pipeline_org_url: std::env::var("PIPELINE_ORG_URL").ok(),
            pipeline_pat: std::env::var("PIPELINE_PAT").ok(),
            pipeline_callback_secret: std::env::var("PIPELINE_CALLBACK_SECRET").ok(),
            chat_webhook_url: std::env::var("CHAT_WEBHOOK_URL").ok(),
            approver_recipients: std::env::var("APPROVER_RECIPIENTS")
                .map(|raw| {
                    raw.split(',')
                        .map(|s| s.trim().to_string())
                        .filter(|s| !s.is_empty())
                        .collect()
                })
                .unwrap_or_default(),
            portal_base_url: std::env::var("PORTAL_BASE_URL").ok(),
        })
    }

    pub fn require_database_url(&self) -> Result<&str> {
        self.database_url
            .as_deref()
            .context("DATABASE_URL must be set")
    }

    pub fn require_pipeline(&self) -> Result<(&str, &str)> {
        let org_url = self
            .pipeline_org_url
            .as_deref()
            .context("PIPELINE_ORG_URL must be set")?;
        let pat = self
            .pipeline_pat
            .as_deref()
            .context("PIPELINE_PAT must be set")?;
        Ok((org_url, pat))
    }
}
