mod config;
mod db;
mod error;
mod models;
mod routes;
mod services;
mod state;

use crate::config::AppConfig;
use crate::db::connection::create_pool;
use crate::db::migrate::migrate;
use crate::services::backup_scheduler::BackupScheduler;
use crate::state::AppState;
use clap::{Parser, Subcommand};
use media_backup::notify::transport_from_config;
use media_backup::{CloudinaryStore, Config, DeliveryPolicy, NotificationQueue, RestoreOptions, RestoreRequest};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::signal;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

/// Longest we wait for queued notifications before exiting
const NOTIFY_FLUSH_TIMEOUT: Duration = Duration::from_secs(60);

#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Pipeline configuration file (overrides BACKUP_CONFIG)
    #[arg(short, long, value_name = "FILE", global = true)]
    config: Option<PathBuf>,

    /// Log level (overrides LOG_LEVEL and log.level)
    #[arg(short, long, global = true)]
    log_level: Option<String>,

    #[command(subcommand)]
    command: Option<Command>,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Run the admin API and the backup schedule (default)
    Serve {
        #[arg(short, long)]
        port: Option<u16>,
    },
    /// Run one backup now and print the outcome
    Backup,
    /// Restore a backup into the media store and print the outcome
    Restore {
        /// Recorded backup id
        #[arg(long, conflicts_with_all = ["dir", "archive"])]
        id: Option<String>,
        /// Backup run directory (newest archive inside is used)
        #[arg(long, conflicts_with = "archive")]
        dir: Option<PathBuf>,
        /// Archive file (.zip or .zip.enc)
        #[arg(long)]
        archive: Option<PathBuf>,
        /// Falls back to backup.passphrase
        #[arg(long)]
        passphrase: Option<String>,
        #[arg(long)]
        skip_existing_check: bool,
        #[arg(long)]
        force_upload: bool,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();
    let mut config = AppConfig::from_env();

    let config_path = args.config.clone().or_else(|| config.backup_config.clone());
    let pipeline = Config::load(config_path.as_deref())?;

    let level = args
        .log_level
        .clone()
        .or_else(|| config.log_level.clone())
        .unwrap_or_else(|| pipeline.log.level.clone());
    media_backup::utils::logger::init(&level)?;

    if let Some(path) = &config_path {
        tracing::info!("Loaded pipeline config from {}", path.display());
    }

    std::fs::create_dir_all(&config.data_dir)?;
    let db_path = config.db_path.to_string_lossy().to_string();
    let pool = create_pool(&db_path)?;
    migrate(&pool)?;

    let store = Arc::new(CloudinaryStore::new(&pipeline.provider)?);
    let transport = transport_from_config(&pipeline.notify)?;
    let (notifier, notify_task) = NotificationQueue::spawn(transport, DeliveryPolicy::from(&pipeline.notify));

    let command = args.command.unwrap_or(Command::Serve { port: None });
    if let Command::Serve { port: Some(port) } = &command {
        config.port = *port;
    }

    let state = Arc::new(AppState::new(pool, config, pipeline, store, notifier));

    let success = match command {
        Command::Serve { .. } => {
            serve(state.clone()).await?;
            true
        }
        Command::Backup => match state.run_backup().await {
            Some(outcome) => {
                println!("{}", serde_json::to_string_pretty(&outcome)?);
                outcome.success
            }
            None => false,
        },
        Command::Restore {
            id,
            dir,
            archive,
            passphrase,
            skip_existing_check,
            force_upload,
        } => {
            let options = RestoreOptions {
                skip_existing_check,
                force_upload,
            };
            let passphrase = passphrase.or_else(|| state.pipeline.backup.passphrase.clone());
            let restorer = state.restorer();

            let outcome = match (id, dir, archive) {
                (Some(id), _, _) => {
                    let request = RestoreRequest {
                        restore_media: true,
                        options,
                    };
                    restorer
                        .restore_backup(state.records.as_ref(), &id, passphrase.as_deref(), request)
                        .await
                        .media_result
                }
                (None, Some(dir), _) => Some(restorer.restore_dir(&dir, passphrase.as_deref(), options).await),
                (None, None, Some(archive)) => {
                    Some(restorer.restore_archive(&archive, passphrase.as_deref(), options).await)
                }
                (None, None, None) => anyhow::bail!("restore needs one of --id, --dir or --archive"),
            };

            println!("{}", serde_json::to_string_pretty(&outcome)?);
            outcome.map(|o| o.success).unwrap_or(false)
        }
    };

    db::connection::close_pool(&state.db);
    drop(state);
    flush_notifications(notify_task).await;

    if !success {
        std::process::exit(1);
    }
    Ok(())
}

async fn serve(state: Arc<AppState>) -> anyhow::Result<()> {
    let cancel = CancellationToken::new();

    let scheduler = match BackupScheduler::new(state.clone(), cancel.clone()).await {
        Ok(s) => {
            if let Err(e) = s.init_schedules().await {
                tracing::warn!("Failed to initialize schedules: {}", e);
            }
            if let Err(e) = s.start().await {
                tracing::warn!("Failed to start scheduler: {}", e);
            }
            Some(s)
        }
        Err(e) => {
            tracing::warn!("Failed to create scheduler: {}", e);
            None
        }
    };

    let app = routes::create_router(state.clone());

    let addr = format!("0.0.0.0:{}", state.config.port);
    let listener = tokio::net::TcpListener::bind(&addr).await?;
    tracing::info!("Listening on {}", addr);

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal(cancel.clone()))
        .await?;

    tracing::info!("Shutting down...");

    if let Some(s) = scheduler {
        if let Err(e) = s.shutdown().await {
            tracing::warn!("Scheduler shutdown error: {}", e);
        }
    }

    tracing::info!("Server stopped");
    Ok(())
}

/// Wait for the notification task to drain once every queue handle is gone.
async fn flush_notifications(task: JoinHandle<()>) {
    match tokio::time::timeout(NOTIFY_FLUSH_TIMEOUT, task).await {
        Ok(Ok(())) => {}
        Ok(Err(e)) => tracing::warn!("Notification task failed: {}", e),
        Err(_) => tracing::warn!("Gave up waiting for pending notifications"),
    }
}

async fn shutdown_signal(cancel: CancellationToken) {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            tracing::error!("Failed to listen for ctrl+c: {}", e);
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut sig) => {
                sig.recv().await;
            }
            Err(e) => {
                tracing::error!("Failed to listen for SIGTERM: {}", e);
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => tracing::info!("Received SIGINT"),
        _ = terminate => tracing::info!("Received SIGTERM"),
    }

    cancel.cancel();
}
