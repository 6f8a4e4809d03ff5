//! # biztools command line
//!
//! Loads configuration and telemetry, then runs one operation against the
//! configured services and prints the result as JSON.

use std::path::PathBuf;

use anyhow::{Context, Result, bail};
use clap::{Parser, Subcommand};
use serde::Serialize;
use serde_json::Value;

use biztools::config::{AppConfig, ConfigLoader};
use biztools::connectors::{DriveClient, EmailMessage, EmailService, Role, SlackMessage, SlackService};
use biztools::db::{DatabaseConfig, DatabaseConnection, SqlParam};
use biztools::sharing::{PropagationError, PropagationOptions};
use biztools::telemetry;

/// Back-office service wrappers
#[derive(Debug, Parser)]
#[command(name = "biztools", version, about, long_about = None)]
struct Cli {
    /// Directory holding the layered .env files
    #[arg(long)]
    env_dir: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Share a Drive folder and everything below it
    ShareFolder {
        folder_id: String,
        /// Recipient email address (repeatable)
        #[arg(short, long = "email", required = true)]
        emails: Vec<String>,
        /// viewer, commenter or editor
        #[arg(short, long, default_value = "commenter")]
        role: Role,
        /// Skip recipients that already have access
        #[arg(long)]
        skip_existing: bool,
        /// Create calls per grant; overrides BIZTOOLS_SHARE_GRANT_ATTEMPTS
        #[arg(long)]
        attempts: Option<u32>,
    },
    /// Print the id of the first folder with this name
    FindFolder { name: String },
    /// Create a Drive folder
    CreateFolder {
        name: String,
        #[arg(short, long)]
        parent: Option<String>,
    },
    /// Upload a local file into a Drive folder
    Upload {
        path: PathBuf,
        #[arg(short, long)]
        folder_id: String,
        #[arg(short, long, default_value = "application/octet-stream")]
        mime_type: String,
    },
    /// Permanently delete a Drive folder
    DeleteFolder { folder_id: String },
    /// List the users a folder is shared with
    Permissions { folder_id: String },
    /// Post a Slack message
    SlackPost {
        #[arg(short, long)]
        channel: String,
        #[arg(short, long)]
        text: String,
        #[arg(long)]
        thread_ts: Option<String>,
    },
    /// Send an email through Azure Communication Services
    SendEmail {
        #[arg(long)]
        from: String,
        #[arg(long, required = true)]
        to: Vec<String>,
        #[arg(long)]
        subject: String,
        #[arg(long)]
        text: Option<String>,
        #[arg(long)]
        html: Option<String>,
        /// Poll until the send operation settles
        #[arg(long)]
        wait: bool,
    },
    /// Run one SQL statement
    Query {
        sql: String,
        /// Positional parameter as JSON (repeatable), bound to @P1, @P2, ...
        #[arg(short, long = "param")]
        params: Vec<String>,
        /// Return rows as column-keyed objects
        #[arg(long)]
        as_dict: bool,
    },
}

fn print_json<T: Serialize>(value: &T) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

async fn run(command: Commands, config: &AppConfig) -> Result<()> {
    match command {
        Commands::ShareFolder {
            folder_id,
            emails,
            role,
            skip_existing,
            attempts,
        } => {
            let mut options = PropagationOptions::from_config(config);
            options.skip_existing |= skip_existing;
            if let Some(attempts) = attempts {
                options.grant_attempts = attempts.max(1);
            }
            let drive = DriveClient::from_config(config)?.with_share_options(options);

            match drive.share_folder_recursively(&folder_id, &emails, role).await {
                Ok(report) => print_json(&report),
                Err(err @ PropagationError::Incomplete { .. }) => {
                    if let Some(report) = err.report() {
                        print_json(report)?;
                    }
                    Err(err.into())
                }
                Err(err) => Err(err.into()),
            }
        }
        Commands::FindFolder { name } => {
            let drive = DriveClient::from_config(config)?;
            match drive.get_folder_id(&name).await? {
                Some(id) => print_json(&serde_json::json!({ "name": name, "id": id })),
                None => bail!("no folder named '{}'", name),
            }
        }
        Commands::CreateFolder { name, parent } => {
            let drive = DriveClient::from_config(config)?;
            let id = drive.create_folder(&name, parent.as_deref()).await?;
            print_json(&serde_json::json!({ "name": name, "id": id }))
        }
        Commands::Upload {
            path,
            folder_id,
            mime_type,
        } => {
            let drive = DriveClient::from_config(config)?;
            let id = drive.upload_file(&path, &folder_id, &mime_type).await?;
            print_json(&serde_json::json!({ "path": path, "id": id }))
        }
        Commands::DeleteFolder { folder_id } => {
            let drive = DriveClient::from_config(config)?;
            drive.delete_folder(&folder_id).await?;
            print_json(&serde_json::json!({ "deleted": folder_id }))
        }
        Commands::Permissions { folder_id } => {
            let drive = DriveClient::from_config(config)?;
            let mut emails: Vec<String> = drive
                .get_folder_permissions(&folder_id)
                .await?
                .into_iter()
                .collect();
            emails.sort();
            print_json(&emails)
        }
        Commands::SlackPost {
            channel,
            text,
            thread_ts,
        } => {
            let slack = SlackService::from_config(config)?;
            let mut message = SlackMessage::new(channel).text(text);
            if let Some(ts) = thread_ts {
                message = message.in_thread(ts);
            }
            let response = slack.post_message(&message).await;
            slack.close().await;
            print_json(&response?)
        }
        Commands::SendEmail {
            from,
            to,
            subject,
            text,
            html,
            wait,
        } => {
            if text.is_none() && html.is_none() {
                bail!("one of --text or --html is required");
            }
            let email = EmailService::from_config(config)?;
            let mut message = EmailMessage::new(from, subject);
            for address in to {
                message = message.to(address);
            }
            message.content.plain_text = text;
            message.content.html = html;

            let poller = email.begin_send(&message).await?;
            if wait {
                let result = poller.wait().await?;
                print_json(&result)
            } else {
                print_json(&serde_json::json!({
                    "operation_id": poller.operation_id(),
                    "status": poller.last_status(),
                }))
            }
        }
        Commands::Query {
            sql,
            params,
            as_dict,
        } => {
            // Values that are not valid JSON bind as plain text.
            let params: Vec<SqlParam> = params
                .iter()
                .map(|raw| match serde_json::from_str::<Value>(raw) {
                    Ok(value) => SqlParam::from_json(&value),
                    Err(_) => SqlParam::Text(raw.clone()),
                })
                .collect();
            let db = DatabaseConnection::new(DatabaseConfig::from_app_config(config)?);
            let output = db.execute_query(&sql, &params, as_dict).await;
            db.close().await;
            print_json(&output?)
        }
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let loader = match cli.env_dir {
        Some(dir) => ConfigLoader::with_base_dir(dir),
        None => ConfigLoader::new(),
    };
    let config = loader.load().context("loading configuration")?;
    telemetry::init_tracing(&config).context("initializing telemetry")?;

    if let Ok(redacted) = config.redacted_json() {
        tracing::debug!(profile = %config.profile, config = %redacted, "Loaded configuration");
    }

    run(cli.command, &config)
        .await
        .inspect_err(|err| tracing::error!(error = %err, "Command failed"))
}
