use anyhow::{Context, Result};
use clap::{Args, Parser, Subcommand};
use std::{env, fmt, path::PathBuf, str::FromStr};

/// Origins allowed when `CORS_ORIGINS` is empty or unset.
pub const DEV_CORS_ORIGINS: [&str; 2] = ["http://localhost:8000", "http://127.0.0.1:8000"];

pub const DEFAULT_MAX_SIZE_MB: u64 = 25;
pub const DEFAULT_BACKEND_PORT: u16 = 8002;
pub const DEFAULT_PROXY_PORT: u16 = 80;

/// Top-level command line.
#[derive(Parser, Debug)]
#[command(author, version, about = "Image upload service, edge proxy and entrypoint")]
pub struct Cli {
    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand, Debug)]
pub enum Command {
    /// Run the upload backend
    Serve(ServeArgs),
    /// Run the edge proxy in front of the backend and the static frontend
    Proxy(ProxyArgs),
    /// Prepare directories, launch proxy and backend, relay shutdown signals
    Supervise(SuperviseArgs),
}

#[derive(Args, Debug, Default, Clone)]
pub struct ServeArgs {
    /// Host to bind to (overrides HOST)
    #[arg(long)]
    pub host: Option<String>,

    /// Port to bind to (overrides PORT)
    #[arg(long)]
    pub port: Option<u16>,

    /// Directory where uploaded images are stored (overrides IMAGES_ROOT)
    #[arg(long)]
    pub images_root: Option<PathBuf>,

    /// Runtime worker threads in production mode (overrides WORKERS)
    #[arg(long)]
    pub workers: Option<usize>,
}

#[derive(Args, Debug, Clone)]
pub struct ProxyArgs {
    /// Path to the proxy TOML configuration
    #[arg(long)]
    pub config: PathBuf,

    /// Validate the configuration and exit
    #[arg(long)]
    pub check: bool,
}

#[derive(Args, Debug, Clone)]
pub struct SuperviseArgs {
    /// Root for uploaded images, logs and the rendered proxy config
    #[arg(long, default_value = "./data")]
    pub data_dir: PathBuf,

    /// Directory holding the built frontend
    #[arg(long, default_value = "./static")]
    pub static_root: PathBuf,

    /// Public port of the edge proxy
    #[arg(long, default_value_t = DEFAULT_PROXY_PORT)]
    pub proxy_port: u16,

    /// Internal port of the upload backend
    #[arg(long, default_value_t = DEFAULT_BACKEND_PORT)]
    pub backend_port: u16,

    /// Seconds to wait for a child to exit after SIGTERM before killing it
    #[arg(long, default_value_t = 10)]
    pub grace_secs: u64,
}

/// Deployment flavor, read from `ENVIRONMENT`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Environment {
    Production,
    #[default]
    Development,
}

impl Environment {
    pub fn is_development(self) -> bool {
        self == Environment::Development
    }

    /// Reads `ENVIRONMENT`, treating unknown values as development.
    pub fn from_env() -> Self {
        match env::var("ENVIRONMENT") {
            Ok(raw) => raw.parse().unwrap_or_else(|_| {
                tracing::warn!("unknown ENVIRONMENT `{}`, assuming development", raw);
                Environment::Development
            }),
            Err(_) => Environment::Development,
        }
    }
}

impl FromStr for Environment {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "production" | "prod" => Ok(Environment::Production),
            "development" | "dev" => Ok(Environment::Development),
            other => Err(format!("unknown environment `{}`", other)),
        }
    }
}

impl fmt::Display for Environment {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Environment::Production => write!(f, "production"),
            Environment::Development => write!(f, "development"),
        }
    }
}

/// Upload backend configuration.
/// Combines environment variables and CLI arguments.
#[derive(Debug, Clone)]
pub struct BackendConfig {
    pub host: String,
    pub port: u16,
    pub images_root: PathBuf,
    /// Public base URL override, without trailing slash.
    pub base_url: Option<String>,
    pub cors_origins: Vec<String>,
    pub max_size_mb: u64,
    pub environment: Environment,
    pub workers: Option<usize>,
}

impl Default for BackendConfig {
    fn default() -> Self {
        Self {
            host: "0.0.0.0".into(),
            port: DEFAULT_BACKEND_PORT,
            images_root: PathBuf::from("./imagens"),
            base_url: None,
            cors_origins: DEV_CORS_ORIGINS.iter().map(|o| o.to_string()).collect(),
            max_size_mb: DEFAULT_MAX_SIZE_MB,
            environment: Environment::Development,
            workers: None,
        }
    }
}

impl BackendConfig {
    /// Merge CLI arguments over the process environment.
    pub fn from_env_and_args(args: ServeArgs) -> Result<Self> {
        Self::from_lookup(args, |key| env::var(key).ok())
    }

    /// Merge CLI arguments over the variables returned by `lookup`.
    pub fn from_lookup<F>(args: ServeArgs, lookup: F) -> Result<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let defaults = Self::default();

        let env_port = match lookup("PORT") {
            Some(value) => value
                .trim()
                .parse::<u16>()
                .with_context(|| format!("parsing PORT value `{}`", value))?,
            None => defaults.port,
        };
        let env_workers = match lookup("WORKERS") {
            Some(value) => Some(
                value
                    .trim()
                    .parse::<usize>()
                    .with_context(|| format!("parsing WORKERS value `{}`", value))?,
            ),
            None => None,
        };

        let max_size_mb = match lookup("MAX_SIZE_MB") {
            Some(value) => match value.trim().parse::<u64>() {
                Ok(mb) if mb > 0 => mb,
                _ => {
                    tracing::warn!(
                        "invalid MAX_SIZE_MB `{}`, using {}",
                        value,
                        DEFAULT_MAX_SIZE_MB
                    );
                    DEFAULT_MAX_SIZE_MB
                }
            },
            None => DEFAULT_MAX_SIZE_MB,
        };

        let environment = match lookup("ENVIRONMENT") {
            Some(raw) => raw.parse().unwrap_or_else(|_| {
                tracing::warn!("unknown ENVIRONMENT `{}`, assuming development", raw);
                Environment::Development
            }),
            None => Environment::Development,
        };

        let base_url = lookup("BASE_URL")
            .map(|raw| raw.trim().trim_end_matches('/').to_string())
            .filter(|url| !url.is_empty());

        let cors_origins = lookup("CORS_ORIGINS")
            .map(|raw| parse_origins(&raw))
            .filter(|origins| !origins.is_empty())
            .unwrap_or(defaults.cors_origins);

        Ok(Self {
            host: args
                .host
                .or_else(|| lookup("HOST"))
                .unwrap_or(defaults.host),
            port: args.port.unwrap_or(env_port),
            images_root: args
                .images_root
                .or_else(|| lookup("IMAGES_ROOT").map(PathBuf::from))
                .unwrap_or(defaults.images_root),
            base_url,
            cors_origins,
            max_size_mb,
            environment,
            workers: args.workers.or(env_workers).filter(|w| *w > 0),
        })
    }

    pub fn addr(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }

    pub fn max_size_bytes(&self) -> u64 {
        self.max_size_mb * 1024 * 1024
    }
}

/// Split a comma-separated origin list, dropping blanks.
pub fn parse_origins(raw: &str) -> Vec<String> {
    raw.split(',')
        .map(str::trim)
        .filter(|o| !o.is_empty())
        .map(|o| o.trim_end_matches('/').to_string())
        .collect()
}
