//! Cascade service binary
//!
//! ```bash
//! # Run the scheduler until Ctrl-C
//! cascade-service --config ./cascade.toml serve
//! cascade-service serve --events incident_created,incident_exhausted
//!
//! # Admin commands against the same database
//! cascade-service trigger subject-42
//! cascade-service ack <incident-id> <watcher-id>
//! cascade-service cancel --subject subject-42
//! cascade-service status <incident-id>
//!
//! # Hand a provider payload to the webhook ingress
//! cascade-service webhook call ./event.json
//! ```

use std::path::PathBuf;

use anyhow::{bail, Context, Result};
use cascade::ingress::{sign, HmacVerifier};
use cascade::{EventFilter, WebhookRequest};
use cascade_service::{telemetry, Runtime, ServiceConfig};
use clap::{Parser, Subcommand, ValueEnum};
use tracing::info;

/// Command-line arguments
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// TOML config file (overrides environment defaults)
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    /// SQLite database path (overrides config and CASCADE_DB_PATH)
    #[arg(long, global = true)]
    db: Option<PathBuf>,

    /// Emit logs as JSON lines
    #[arg(long, global = true, default_value_t = false)]
    log_json: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Run the durable scheduler until interrupted
    Serve {
        /// Only log events of this incident
        #[arg(long)]
        incident: Option<String>,
        /// Only log these event types (comma separated, e.g. incident_created,call_placed)
        #[arg(long, value_delimiter = ',')]
        events: Vec<String>,
    },
    /// Raise a panic trigger for a subject
    Trigger { subject: String },
    /// Acknowledge an incident on behalf of a watcher
    Ack { incident: String, watcher: String },
    /// Cancel an incident, by id or by subject
    Cancel {
        incident: Option<String>,
        #[arg(long, conflicts_with = "incident")]
        subject: Option<String>,
        /// Recorded as canceled_by
        #[arg(long, default_value = "admin")]
        by: String,
    },
    /// Print an incident report as JSON
    Status { incident: String },
    /// Feed a JSON payload file through webhook verification and handling
    Webhook { kind: WebhookKind, file: PathBuf },
}

#[derive(Clone, Copy, Debug, ValueEnum)]
enum WebhookKind {
    Call,
    Chat,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();
    telemetry::init(args.log_json);

    let mut config = ServiceConfig::load(args.config.as_deref())?;
    if let Some(db) = args.db {
        config.database_path = db;
    }
    let runtime = Runtime::build(&config)?;
    let engine = runtime.engine();

    match args.command {
        Command::Serve { incident, events } => {
            let mut filter = EventFilter::new();
            if let Some(incident) = incident.as_deref() {
                filter = filter.incident(incident);
            }
            if !events.is_empty() {
                filter = filter.types(events.iter().map(String::as_str));
            }
            let scheduler = runtime.start_scheduler().await?;
            let events = runtime.spawn_event_log(filter, scheduler.cancel_token());
            info!(db = %config.database_path.display(), "Cascade service ready");
            tokio::signal::ctrl_c().await.context("Failed to listen for shutdown signal")?;
            info!("Shutting down");
            scheduler.shutdown().await;
            events.await.context("Event log task failed")?;
        }
        Command::Trigger { subject } => {
            let outcome = engine.trigger(&subject).await?;
            println!("{}", serde_json::to_string_pretty(&outcome.incident)?);
            if !outcome.created {
                eprintln!("subject already had an active incident");
            }
        }
        Command::Ack { incident, watcher } => {
            if !engine.acknowledge(&incident, &watcher).await? {
                bail!("incident {incident} is not active");
            }
            println!("acknowledged");
        }
        Command::Cancel { incident, subject, by } => {
            let canceled = match (incident, subject) {
                (Some(id), _) => engine.cancel(&id, &by).await?,
                (None, Some(subject)) => engine.cancel_for_subject(&subject).await?,
                (None, None) => bail!("pass an incident id or --subject"),
            };
            if !canceled {
                bail!("nothing to cancel");
            }
            println!("canceled");
        }
        Command::Status { incident } => {
            let report = engine.report(&incident).await?;
            let stats = engine.scheduler().stats().await?;
            println!(
                "{}",
                serde_json::to_string_pretty(&serde_json::json!({ "report": report, "scheduler": stats }))?
            );
        }
        Command::Webhook { kind, file } => {
            let body = std::fs::read(&file).with_context(|| format!("Failed to read {}", file.display()))?;
            let reply = match kind {
                WebhookKind::Call => {
                    let secret = config
                        .call_webhook_secret
                        .as_deref()
                        .context("CASCADE_CALL_WEBHOOK_SECRET is not set")?;
                    let ts = chrono::Utc::now().timestamp();
                    let request = WebhookRequest::new(body.clone())
                        .with_header(HmacVerifier::DEFAULT_TIMESTAMP_HEADER, ts.to_string())
                        .with_header(HmacVerifier::DEFAULT_SIGNATURE_HEADER, sign(secret, ts, &body)?);
                    runtime.ingress().call_webhook(&request).await
                }
                WebhookKind::Chat => {
                    let secret = config
                        .chat_webhook_secret
                        .as_deref()
                        .context("CASCADE_CHAT_WEBHOOK_SECRET is not set")?;
                    let request = WebhookRequest::new(body).with_header(&config.chat_secret_header, secret);
                    runtime.ingress().chat_webhook(&request).await
                }
            };
            println!("{} {}", reply.status, reply.body);
        }
    }
    Ok(())
}
