use clap::{Parser, Subcommand};

/// Launchpad - approval-gated self-service deployments
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
pub struct Args {
    #[command(subcommand)]
    pub mode: Mode,
}

#[derive(Subcommand, Debug)]
pub enum Mode {
    /// Run the API server
    Serve {
        /// API port (overrides SERVER_PORT)
        #[arg(short, long)]
        port: Option<u16>,

        /// Use an in-memory store instead of Postgres (development only)
        #[arg(long)]
        in_memory: bool,
    },

    /// Create the database schema and tables
    InitDb,

    /// Resolve entities stuck in deploying by polling the pipeline runner
    Reconcile {
        /// Only consider entities deploying for at least this many minutes
        #[arg(long, default_value = "10")]
        minutes: i64,
    },

    /// Send reminders for requests awaiting approval
    Remind {
        /// Only consider requests pending for at least this many hours
        #[arg(long, default_value = "24")]
        hours: i64,
    },

    /// Inspect the template catalog
    Catalog {
        #[command(subcommand)]
        command: CatalogCommand,
    },
}

#[derive(Subcommand, Debug)]
pub enum CatalogCommand {
    /// List the templates found in the catalog directory
    List,
}
