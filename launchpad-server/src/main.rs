use std::sync::Arc;

use anyhow::Result;
use clap::Parser;
use tracing_subscriber::EnvFilter;

mod api;
mod auth;
mod cli;
mod config;
mod db;

use cli::{Args, CatalogCommand, Mode};
use config::Config;
use launchpad_engine::{
    CatalogRegistry, Dispatcher, HttpPipelineGateway, LifecycleEngine, MemStore,
    NotificationTransport, PgStore, RequestStore, WebhookTransport, YamlCatalog,
};

fn initialize_tracing() {
    let env_filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| {
        "info,\
         launchpad_server=debug,\
         launchpad_engine=debug,\
         sqlx::query=warn"
            .into()
    });

    tracing_subscriber::fmt().with_env_filter(env_filter).init();
}

#[tokio::main]
async fn main() -> Result<()> {
    dotenvy::dotenv().ok();

    let args = Args::parse();

    initialize_tracing();

    let config = Config::load()?;

    match args.mode {
        Mode::Serve { port, in_memory } => run_serve(config, port, in_memory).await,
        Mode::InitDb => run_init_db(config).await,
        Mode::Reconcile { minutes } => {
            let engine = build_pg_engine(&config).await?;
            let resolved = engine
                .reconcile_deploying(chrono::Duration::minutes(minutes))
                .await?;
            println!("Resolved {resolved} stuck deployment(s)");
            Ok(())
        }
        Mode::Remind { hours } => {
            let engine = build_pg_engine(&config).await?;
            let sent = engine
                .send_approval_reminders(chrono::Duration::hours(hours))
                .await?;
            println!("Sent {sent} approval reminder(s)");
            Ok(())
        }
        Mode::Catalog { command } => match command {
            CatalogCommand::List => run_catalog_list(config),
        },
    }
}

async fn run_serve(config: Config, port: Option<u16>, in_memory: bool) -> Result<()> {
    let store: Arc<dyn RequestStore> = if in_memory {
        tracing::warn!("using the in-memory store; nothing will survive a restart");
        Arc::new(MemStore::new())
    } else {
        let pool = db::connect(config.require_database_url()?).await?;
        db::initialize_schema(&pool).await?;
        Arc::new(PgStore::new(pool))
    };

    let engine = build_engine(&config, store)?;
    let port = port.unwrap_or(config.server_port);

    if config.pipeline_callback_secret.is_none() {
        tracing::warn!("PIPELINE_CALLBACK_SECRET is not set; callbacks are unauthenticated");
    }

    api::start_server(
        &config.server_host,
        port,
        api::AppState {
            engine,
            callback_secret: config.pipeline_callback_secret.clone(),
        },
    )
    .await
}

async fn run_init_db(config: Config) -> Result<()> {
    let pool = db::connect(config.require_database_url()?).await?;
    db::initialize_schema(&pool).await?;
    println!("Database schema initialized");
    Ok(())
}

fn run_catalog_list(config: Config) -> Result<()> {
    let catalog = YamlCatalog::load(&config.catalog_dir)?;
    let templates = catalog.list();
    if templates.is_empty() {
        println!("No templates found in '{}'", config.catalog_dir);
        return Ok(());
    }
    for template in templates {
        println!(
            "{:<24} {:<32} {} (est. {}/mo)",
            template.id, template.name, template.category, template.estimated_monthly_cost_usd
        );
    }
    Ok(())
}

async fn build_pg_engine(config: &Config) -> Result<Arc<LifecycleEngine>> {
    let pool = db::connect(config.require_database_url()?).await?;
    build_engine(config, Arc::new(PgStore::new(pool)))
}

fn build_engine(config: &Config, store: Arc<dyn RequestStore>) -> Result<Arc<LifecycleEngine>> {
    let catalog = Arc::new(YamlCatalog::load(&config.catalog_dir)?);

    let (org_url, pat) = config.require_pipeline()?;
    let gateway = Arc::new(HttpPipelineGateway::new(org_url, pat)?);

    let mut transports: Vec<Arc<dyn NotificationTransport>> = Vec::new();
    if let Some(url) = &config.chat_webhook_url {
        transports.push(Arc::new(WebhookTransport::new(url)?));
    } else {
        tracing::warn!("CHAT_WEBHOOK_URL is not set; notifications are disabled");
    }
    let dispatcher = Dispatcher::new(store.clone(), transports);

    Ok(Arc::new(LifecycleEngine::new(
        store,
        catalog,
        gateway,
        dispatcher,
        config.portal_base_url.clone(),
        config.approver_recipients.clone(),
    )))
}
