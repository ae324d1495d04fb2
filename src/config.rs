use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use dialoguer::{Input, Password};
use std::path::PathBuf;

use crate::context::parse_location;
use crate::models::Method;
use crate::transport::parse_base_url;

pub const DEFAULT_LOGIN_PATH: &str = "/auth/login";
pub const DEFAULT_REFRESH_PATH: &str = "/auth/refresh-token";

/// Intake API client
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
pub struct CliArgs {
    /// Base URL of the intake REST API
    #[arg(short = 'u', long, env = "INTAKE_API_URL")]
    pub base_url: Option<String>,

    /// Login endpoint path
    #[arg(long, env = "INTAKE_LOGIN_PATH", default_value = DEFAULT_LOGIN_PATH)]
    pub login_path: String,

    /// Token refresh endpoint path
    #[arg(long, env = "INTAKE_REFRESH_PATH", default_value = DEFAULT_REFRESH_PATH)]
    pub refresh_path: String,

    /// Path to the credential SQLite database
    #[arg(short = 'd', long, env = "INTAKE_CREDENTIALS_DB")]
    pub db_file: Option<String>,

    /// Client variant (web, mobile)
    #[arg(long, env = "CLIENT_VARIANT", default_value = "web")]
    pub variant: String,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, env = "LOG_LEVEL", default_value = "info")]
    pub log_level: String,

    /// HTTP request timeout in seconds
    #[arg(long, env = "HTTP_REQUEST_TIMEOUT", default_value = "60")]
    pub http_timeout: u64,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand, Debug, Clone, PartialEq)]
pub enum Command {
    /// Sign in and store the issued tokens
    Login {
        #[arg(long)]
        username: Option<String>,

        /// Prompted for when omitted
        #[arg(long)]
        password: Option<String>,
    },

    /// Forget the stored tokens
    Logout,

    /// Send an authenticated request and print the response envelope
    Request {
        #[arg(value_enum, ignore_case = true)]
        method: Method,

        endpoint: String,

        /// Query parameters as a JSON object
        #[arg(long)]
        params: Option<String>,

        /// JSON request body
        #[arg(long)]
        data: Option<String>,
    },
}

#[derive(Clone, Debug)]
pub struct Config {
    // API
    pub api_base_url: String,
    pub login_path: String,
    pub refresh_path: String,

    // Token refresh
    pub refresh_debounce_ms: u64,

    // Credentials
    pub credentials_db: PathBuf,

    // Context headers
    pub client_variant: ClientVariant,
    pub locale: Option<String>,
    pub location: Option<(f64, f64)>,

    // HTTP client
    pub http_max_connections: usize,
    pub http_connect_timeout: u64,
    pub http_request_timeout: u64,

    pub log_level: String,
}

#[derive(Clone, Copy, Debug, PartialEq)]
pub enum ClientVariant {
    /// Bearer token only
    Web,
    /// Bearer token plus device, locale and location headers
    Mobile,
}

impl Config {
    /// Load configuration from all sources with priority: CLI > ENV > defaults
    pub fn load() -> Result<(Self, Command)> {
        // Load .env file if it exists
        dotenvy::dotenv().ok();

        let args = CliArgs::parse();
        let command = args.command.clone();
        Ok((Self::from_args(args)?, command))
    }

    /// Build configuration from parsed arguments plus environment-only settings
    pub fn from_args(args: CliArgs) -> Result<Self> {
        let location = match std::env::var("CLIENT_LOCATION") {
            Ok(s) if !s.trim().is_empty() => {
                Some(parse_location(&s).context("Invalid CLIENT_LOCATION")?)
            }
            _ => None,
        };

        let config = Config {
            api_base_url: args
                .base_url
                .or_else(|| std::env::var("INTAKE_API_URL").ok())
                .context("INTAKE_API_URL is required (use -u or set INTAKE_API_URL env var)")?,
            login_path: normalize_path(&args.login_path),
            refresh_path: normalize_path(&args.refresh_path),

            refresh_debounce_ms: env_or("REFRESH_DEBOUNCE_MS", 3000),

            credentials_db: args
                .db_file
                .map(|s| expand_tilde(&s))
                .unwrap_or_else(default_credentials_db),

            client_variant: parse_client_variant(&args.variant),
            locale: std::env::var("CLIENT_LOCALE").ok().filter(|s| !s.is_empty()),
            location,

            http_max_connections: env_or("HTTP_MAX_CONNECTIONS", 20),
            http_connect_timeout: env_or("HTTP_CONNECT_TIMEOUT", 30),
            http_request_timeout: args.http_timeout,

            log_level: args.log_level,
        };

        Ok(config)
    }

    /// Validate configuration
    pub fn validate(&self) -> Result<()> {
        parse_base_url(&self.api_base_url)?;

        if self.login_path == self.refresh_path {
            anyhow::bail!(
                "Login and refresh paths must differ (both are {})",
                self.login_path
            );
        }

        if self.http_request_timeout == 0 {
            anyhow::bail!("HTTP_REQUEST_TIMEOUT must be greater than zero");
        }

        Ok(())
    }
}

fn env_or<T: std::str::FromStr>(key: &str, default: T) -> T {
    std::env::var(key)
        .ok()
        .and_then(|s| s.parse().ok())
        .unwrap_or(default)
}

/// Expand tilde (~) in file paths to user's home directory
fn expand_tilde(path: &str) -> PathBuf {
    if let Some(rest) = path.strip_prefix("~/") {
        if let Some(home) = dirs::home_dir() {
            return home.join(rest);
        }
    }
    PathBuf::from(path)
}

fn default_credentials_db() -> PathBuf {
    dirs::data_local_dir()
        .map(|dir| dir.join("intake-client").join("credentials.sqlite3"))
        .unwrap_or_else(|| PathBuf::from("credentials.sqlite3"))
}

/// Ensure endpoint paths start with a single `/`
fn normalize_path(path: &str) -> String {
    format!("/{}", path.trim().trim_start_matches('/'))
}

/// Parse client variant from string
fn parse_client_variant(s: &str) -> ClientVariant {
    match s.to_lowercase().as_str() {
        "mobile" => ClientVariant::Mobile,
        _ => ClientVariant::Web,
    }
}

// === Interactive Login ===

/// Prompt for whichever sign-in fields were not given on the command line
pub fn prompt_login(
    username: Option<String>,
    password: Option<String>,
) -> Result<(String, String)> {
    let username = match username {
        Some(username) => username,
        None => Input::new()
            .with_prompt("Username")
            .interact_text()
            .context("Failed to read username")?,
    };

    let password = match password {
        Some(password) => password,
        None => Password::new()
            .with_prompt("Password")
            .interact()
            .context("Failed to read password")?,
    };

    if username.trim().is_empty() || password.is_empty() {
        anyhow::bail!("Username and password cannot be empty");
    }

    Ok((username, password))
}
