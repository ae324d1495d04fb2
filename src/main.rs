use anyhow::{Context, Result};
use std::sync::Arc;

use intake_api_client::auth::{LoginRequest, SessionHooks};
use intake_api_client::config::{self, Command, Config};
use intake_api_client::models::envelope;
use intake_api_client::{AuthenticatedRequestClient, RequestDescriptor};

/// Sends the user back to the sign-in command when the session is lost
struct CliSessionHooks;

impl SessionHooks for CliSessionHooks {
    fn on_auth_expired(&self) {
        tracing::warn!("Session expired, credentials cleared");
        eprintln!("Session expired. Run `intake-client login` to sign in again.");
    }

    fn on_enrichment_failed(&self, source: &str, error: &anyhow::Error) {
        tracing::debug!("Context header {} unavailable: {}", source, error);
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    // Load configuration first (for log level)
    let (config, command) = Config::load()?;
    config.validate()?;

    // Initialize logging with a configured level; stdout is reserved for output
    let log_level = config.log_level.to_lowercase();
    let env_filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(&log_level));

    tracing_subscriber::fmt()
        .with_env_filter(env_filter)
        .with_writer(std::io::stderr)
        .with_target(false)
        .with_thread_ids(false)
        .with_file(true)
        .with_line_number(true)
        .init();

    tracing::debug!(
        "API: {} (login: {}, refresh: {}, variant: {:?})",
        config.api_base_url,
        config.login_path,
        config.refresh_path,
        config.client_variant
    );
    tracing::debug!("Credential store: {}", config.credentials_db.display());

    let client = AuthenticatedRequestClient::from_config(&config, Arc::new(CliSessionHooks))?;

    match command {
        Command::Login { username, password } => {
            let (username, password) = config::prompt_login(username, password)?;
            match client.login(&LoginRequest { username, password }).await {
                Ok(_) => println!("✅ Signed in"),
                Err(e) => {
                    print_json(&envelope(&Err(e)))?;
                    std::process::exit(1);
                }
            }
        }

        Command::Logout => {
            client.logout().await?;
            println!("👋 Signed out");
        }

        Command::Request {
            method,
            endpoint,
            params,
            data,
        } => {
            let mut descriptor = RequestDescriptor::new(method, endpoint);
            if let Some(params) = params {
                descriptor = descriptor.with_params(parse_json_arg("--params", &params)?);
            }
            if let Some(data) = data {
                descriptor = descriptor.with_data(parse_json_arg("--data", &data)?);
            }

            let result = client.request(descriptor).await;
            print_json(&envelope(&result))?;
            if result.is_err() {
                std::process::exit(1);
            }
        }
    }

    Ok(())
}

fn parse_json_arg(flag: &str, raw: &str) -> Result<serde_json::Value> {
    serde_json::from_str(raw).with_context(|| format!("{} must be valid JSON", flag))
}

fn print_json(value: &serde_json::Value) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}
