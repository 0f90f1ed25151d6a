//! Command-line and environment configuration.

use std::{
    net::{IpAddr, Ipv4Addr, SocketAddr},
    path::PathBuf,
};

use clap::Parser;
use termhub_core::ControlDir;
use termhub_transport::{AuthConfig, ServerMode};
use thiserror::Error;
use uuid::Uuid;

/// Terminal buffer streaming server with HQ/Remote routing
#[derive(Parser, Debug)]
#[command(name = "termhub")]
#[command(version)]
pub struct Cli {
    /// Port to listen on
    #[arg(long, env = "TERMHUB_PORT", default_value_t = 4020)]
    pub port: u16,

    /// Address to bind
    #[arg(long, env = "TERMHUB_BIND", default_value_t = IpAddr::V4(Ipv4Addr::LOCALHOST))]
    pub bind: IpAddr,

    /// Control directory holding session folders (default: ~/.vibetunnel/control)
    #[arg(long, env = "TERMHUB_CONTROL_DIR", value_name = "PATH")]
    pub control_dir: Option<PathBuf>,

    /// Run as HQ, accepting remote registrations
    #[arg(long)]
    pub hq: bool,

    /// Register with the HQ at this URL and run as a remote
    #[arg(long, env = "TERMHUB_HQ_URL", conflicts_with = "hq")]
    pub hq_url: Option<String>,

    /// Username for HQ
    #[arg(long, env = "TERMHUB_HQ_USERNAME")]
    pub hq_username: Option<String>,

    /// Password for HQ
    #[arg(long, env = "TERMHUB_HQ_PASSWORD")]
    pub hq_password: Option<String>,

    /// Register with an HQ that runs without authentication
    #[arg(long)]
    pub no_hq_auth: bool,

    /// Name this remote registers under
    #[arg(long, env = "TERMHUB_REMOTE_NAME")]
    pub remote_name: Option<String>,

    /// URL at which HQ can reach this remote
    #[arg(long, env = "TERMHUB_REMOTE_URL")]
    pub remote_url: Option<String>,

    /// Token HQ must present when calling this remote (generated if omitted)
    #[arg(long, env = "TERMHUB_BEARER_TOKEN")]
    pub bearer_token: Option<String>,

    /// Username required from clients
    #[arg(long, env = "TERMHUB_USERNAME", requires = "password")]
    pub username: Option<String>,

    /// Password required from clients
    #[arg(long, env = "TERMHUB_PASSWORD", requires = "username")]
    pub password: Option<String>,
}

/// Invalid flag combination.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum ConfigError {
    #[error("--{0} is required when --hq-url is set")]
    MissingRemoteFlag(&'static str),
    #[error("--hq-username and --hq-password are required unless --no-hq-auth is set")]
    MissingHqCredentials,
}

/// How a remote reaches its HQ.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RemoteSettings {
    pub hq_url: String,
    pub hq_username: String,
    pub hq_password: String,
    pub name: String,
    pub url: String,
    pub bearer_token: String,
}

/// Validated server configuration.
#[derive(Debug, Clone)]
pub struct ServerConfig {
    pub addr: SocketAddr,
    pub control_dir: ControlDir,
    pub mode: ServerMode,
    pub remote: Option<RemoteSettings>,
    pub auth: AuthConfig,
}

impl ServerConfig {
    /// Validate parsed flags.
    ///
    /// # Errors
    /// Returns a `ConfigError` for incomplete remote or HQ settings.
    pub fn from_cli(cli: Cli) -> Result<Self, ConfigError> {
        let remote = match cli.hq_url {
            Some(hq_url) => {
                let name = cli
                    .remote_name
                    .ok_or(ConfigError::MissingRemoteFlag("remote-name"))?;
                let url = cli
                    .remote_url
                    .ok_or(ConfigError::MissingRemoteFlag("remote-url"))?;
                let (hq_username, hq_password) = match (cli.hq_username, cli.hq_password) {
                    (Some(user), Some(pass)) => (user, pass),
                    _ if cli.no_hq_auth => (String::new(), String::new()),
                    _ => return Err(ConfigError::MissingHqCredentials),
                };
                Some(RemoteSettings {
                    hq_url,
                    hq_username,
                    hq_password,
                    name,
                    url,
                    bearer_token: cli
                        .bearer_token
                        .clone()
                        .unwrap_or_else(|| Uuid::new_v4().to_string()),
                })
            }
            None => None,
        };

        let mode = if cli.hq {
            ServerMode::Hq
        } else if remote.is_some() {
            ServerMode::Remote
        } else {
            ServerMode::Standalone
        };

        let mut auth = AuthConfig::open();
        if let (Some(user), Some(pass)) = (&cli.username, &cli.password) {
            auth = auth.with_basic(user, pass);
        }
        // Enforce HQ's token only when auth is otherwise on or it was set explicitly.
        if let Some(remote) = &remote {
            if !auth.is_open() || cli.bearer_token.is_some() {
                auth = auth.with_bearer(remote.bearer_token.clone());
            }
        }

        Ok(Self {
            addr: SocketAddr::new(cli.bind, cli.port),
            control_dir: ControlDir::new(cli.control_dir.unwrap_or_else(ControlDir::default_path)),
            mode,
            remote,
            auth,
        })
    }
}
