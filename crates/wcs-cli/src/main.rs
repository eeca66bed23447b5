use anyhow::Result;
use clap::{Parser, Subcommand};
use tracing_subscriber::EnvFilter;
use wcs_core::TableName;
use wcs_storage::{ensure_table, PgWidgetTables, WidgetTables};
use wcs_sync::SyncConfig;

#[derive(Debug, Parser)]
#[command(name = "wcs-cli")]
#[command(about = "Widget chat sync command-line interface")]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Pull chats for every registered widget, or just one.
    Sync {
        #[arg(long)]
        widget_id: Option<String>,
    },
    Migrate,
    Serve,
    /// Report whether a widget's table exists.
    TableCheck {
        widget_id: String,
        #[arg(long)]
        create: bool,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let cli = Cli::parse();

    match cli.command.unwrap_or(Commands::Sync { widget_id: None }) {
        Commands::Sync { widget_id } => {
            let statuses = wcs_sync::run_sync_once_from_env(widget_id.as_deref()).await?;
            for status in &statuses {
                println!(
                    "{} -> {} synced={} inserted={} {}",
                    status.widget_id, status.table_name, status.synced, status.inserted, status.message
                );
            }
            println!(
                "sync complete: widgets={} inserted={}",
                statuses.len(),
                statuses.iter().map(|s| s.inserted).sum::<u64>()
            );
        }
        Commands::Migrate => {
            let config = SyncConfig::from_env();
            let pool = wcs_storage::connect(&config.database_url).await?;
            wcs_storage::MIGRATOR.run(&pool).await?;
            println!("migrations applied");
        }
        Commands::Serve => wcs_web::serve_from_env().await?,
        Commands::TableCheck { widget_id, create } => {
            let config = SyncConfig::from_env();
            let pool = wcs_storage::connect(&config.database_url).await?;
            let tables = PgWidgetTables::new(pool);
            let table = TableName::from_widget_id(&widget_id);
            let report = if create {
                let outcome = ensure_table(&tables, &table).await?;
                serde_json::json!({
                    "widgetId": widget_id,
                    "tableName": table,
                    "tableExists": outcome.exists,
                    "created": outcome.created,
                })
            } else {
                serde_json::json!({
                    "widgetId": widget_id,
                    "tableName": table,
                    "tableExists": tables.table_exists(&table).await?,
                    "created": false,
                })
            };
            println!("{}", serde_json::to_string_pretty(&report)?);
        }
    }

    Ok(())
}
