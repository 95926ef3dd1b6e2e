use clap::Parser;
use feed_engine::FeedConfig;
use serde::Deserialize;

use crate::error::Result;

const DEFAULT_CONFIG_PATH: &str = "config/feed.toml";

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct AppConfig {
    pub base_url: String,
    pub username: String,
    /// Only read from the config file or `FEED_CLI_PASSWORD`.
    pub password: Option<String>,
    pub access_token: Option<String>,
    pub refresh_token: Option<String>,
    /// Run against an in-process feed instead of the server.
    pub offline: bool,
    pub level: String,
    pub timezone: String,
    pub feed: FeedConfig,
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            base_url: "http://127.0.0.1:3000".to_string(),
            username: String::new(),
            password: None,
            access_token: None,
            refresh_token: None,
            offline: false,
            level: "info".to_string(),
            timezone: "Europe/Rome".to_string(),
            feed: FeedConfig::default(),
        }
    }
}

#[derive(Debug, Parser)]
#[command(name = "feed_cli", disable_version_flag = true)]
struct Args {
    /// Optional config file path (TOML).
    #[arg(long)]
    config: Option<String>,
    /// Override base URL (e.g. http://127.0.0.1:3000).
    #[arg(long)]
    base_url: Option<String>,
    /// Override username (password is never read from CLI).
    #[arg(long)]
    username: Option<String>,
    /// Use the in-process feed.
    #[arg(long)]
    offline: bool,
    /// Log level (trace, debug, info, warn, error).
    #[arg(long)]
    level: Option<String>,
    /// Override timezone (IANA name).
    #[arg(long)]
    timezone: Option<String>,
}

pub fn load() -> Result<AppConfig> {
    let args = Args::parse();

    let config_path = args.config.as_deref().unwrap_or(DEFAULT_CONFIG_PATH);
    let mut builder = config::Config::builder();
    builder = builder.add_source(config::File::with_name(config_path).required(false));
    builder = builder.add_source(config::Environment::with_prefix("FEED_CLI").separator("__"));
    let mut settings: AppConfig = builder.build()?.try_deserialize()?;

    if let Some(base_url) = args.base_url {
        settings.base_url = base_url;
    }
    if let Some(username) = args.username {
        settings.username = username;
    }
    if args.offline {
        settings.offline = true;
    }
    if let Some(level) = args.level {
        settings.level = level;
    }
    if let Some(timezone) = args.timezone {
        settings.timezone = timezone;
    }

    Ok(settings)
}
