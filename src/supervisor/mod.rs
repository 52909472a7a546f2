//! Container entrypoint: prepares the data layout, renders and validates the
//! proxy configuration, launches proxy and backend as sibling processes,
//! waits for the backend to report healthy and relays termination signals.
//!
//! Phases advance strictly in order:
//! `Init → DirsReady → ProxyConfigured → ProxyStarted → ProxyHealthy →
//! BackendStarted → BackendHealthy → Running → ShuttingDown → Exited`.
//! Any startup failure terminates whatever was launched and surfaces as an
//! error, which the binary turns into a non-zero exit code.

pub mod children;
pub mod health;

use crate::{
    config::{Environment, SuperviseArgs},
    proxy::config::ProxyConfig,
    services::storage_service::StorageService,
};
use children::{Children, ManagedChild};
use health::{HealthPolicy, HealthProbe};
use hyper::Uri;
use std::{io, path::PathBuf, time::Duration};
use thiserror::Error;
use tokio::process::Command;
use tracing::{error, info, warn};

const PROXY_SETTLE_DELAY: Duration = Duration::from_secs(2);

#[derive(Debug, Error)]
pub enum SupervisorError {
    #[error("creating {path}: {source}")]
    CreateDir {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
    #[error("storage directory {path} is not writable: {source}")]
    StorageNotWritable {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
    #[error("proxy configuration rejected: {0}")]
    InvalidProxyConfig(String),
    #[error("failed to launch {name}: {source}")]
    Spawn {
        name: &'static str,
        #[source]
        source: io::Error,
    },
    #[error("{name} exited during startup ({status})")]
    ExitedEarly { name: &'static str, status: String },
    #[error("backend did not become healthy after {attempts} attempts")]
    Unhealthy { attempts: u32 },
    #[error("{name} exited unexpectedly ({status})")]
    ChildExited { name: &'static str, status: String },
    #[error(transparent)]
    Io(#[from] io::Error),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum Phase {
    Init,
    DirsReady,
    ProxyConfigured,
    ProxyStarted,
    ProxyHealthy,
    BackendStarted,
    BackendHealthy,
    Running,
    ShuttingDown,
    Exited,
}

/// On-disk layout under the data directory.
#[derive(Debug, Clone)]
pub struct Layout {
    pub data_dir: PathBuf,
    pub images_dir: PathBuf,
    /// Created empty for the orchestrator's log shipping. Children inherit
    /// the supervisor's stdout and stderr and never write here.
    pub logs_dir: PathBuf,
    pub proxy_config: PathBuf,
}

impl Layout {
    pub fn new(data_dir: impl Into<PathBuf>) -> Self {
        let data_dir = data_dir.into();
        Self {
            images_dir: data_dir.join("imagens"),
            logs_dir: data_dir.join("logs"),
            proxy_config: data_dir.join("proxy.toml"),
            data_dir,
        }
    }
}

pub struct Supervisor {
    args: SuperviseArgs,
    layout: Layout,
    environment: Environment,
    /// Binary launched for the `proxy` and `serve` children.
    program: PathBuf,
    health: HealthPolicy,
    phase: Phase,
    children: Children,
}

impl Supervisor {
    pub fn new(args: SuperviseArgs, environment: Environment, program: impl Into<PathBuf>) -> Self {
        Self {
            layout: Layout::new(&args.data_dir),
            args,
            environment,
            program: program.into(),
            health: HealthPolicy::default(),
            phase: Phase::Init,
            children: Children::default(),
        }
    }

    pub fn with_health_policy(mut self, policy: HealthPolicy) -> Self {
        self.health = policy;
        self
    }

    pub fn phase(&self) -> Phase {
        self.phase
    }

    pub fn layout(&self) -> &Layout {
        &self.layout
    }

    fn advance(&mut self, next: Phase) {
        info!(from = ?self.phase, to = ?next, "supervisor phase");
        self.phase = next;
    }

    fn grace(&self) -> Duration {
        Duration::from_secs(self.args.grace_secs)
    }

    /// Run until a termination signal (clean, `Ok`) or a failure (`Err`).
    pub async fn run(mut self) -> Result<(), SupervisorError> {
        let mut signals = Signals::install()?;

        let startup = tokio::select! {
            result = self.start() => Some(result),
            signal = signals.recv() => {
                info!(signal, "signal received during startup");
                None
            }
        };

        let outcome = match startup {
            Some(Ok(())) => {
                self.advance(Phase::Running);
                tokio::select! {
                    signal = signals.recv() => {
                        info!(signal, "signal received, stopping children");
                        Ok(())
                    }
                    (name, status) = self.children.wait_any() => {
                        let status = describe_exit(status);
                        error!(name, status = %status, "child exited unexpectedly");
                        Err(SupervisorError::ChildExited { name, status })
                    }
                }
            }
            Some(Err(err)) => {
                error!(error = %err, phase = ?self.phase, "startup failed");
                Err(err)
            }
            None => Ok(()),
        };

        self.advance(Phase::ShuttingDown);
        let grace = self.grace();
        self.children.terminate_all(grace).await;
        self.advance(Phase::Exited);
        outcome
    }

    async fn start(&mut self) -> Result<(), SupervisorError> {
        self.prepare_dirs().await?;
        self.render_proxy_config().await?;
        self.check_proxy_config().await?;
        self.start_proxy().await?;
        self.start_backend()?;
        self.wait_backend_healthy().await
    }

    /// Create the data layout and make sure images can be written.
    pub async fn prepare_dirs(&mut self) -> Result<(), SupervisorError> {
        for dir in [&self.layout.data_dir, &self.layout.images_dir, &self.layout.logs_dir] {
            tokio::fs::create_dir_all(dir)
                .await
                .map_err(|source| SupervisorError::CreateDir {
                    path: dir.clone(),
                    source,
                })?;
        }

        let storage = StorageService::new(&self.layout.images_dir);
        let writable = match storage.ensure_layout().await {
            Ok(()) => storage.probe_writable().await,
            Err(err) => Err(io::Error::other(err.to_string())),
        };
        writable.map_err(|source| SupervisorError::StorageNotWritable {
            path: self.layout.images_dir.clone(),
            source,
        })?;

        self.advance(Phase::DirsReady);
        Ok(())
    }

    /// Write the fixed deployment proxy config to the data directory.
    pub async fn render_proxy_config(&mut self) -> Result<ProxyConfig, SupervisorError> {
        let config = ProxyConfig::for_deployment(
            self.args.proxy_port,
            self.args.backend_port,
            &self.args.static_root,
        );
        let rendered = config
            .render()
            .map_err(|e| SupervisorError::InvalidProxyConfig(e.to_string()))?;
        tokio::fs::write(&self.layout.proxy_config, rendered).await?;
        info!(path = %self.layout.proxy_config.display(), "rendered proxy config");

        self.advance(Phase::ProxyConfigured);
        Ok(config)
    }

    /// Run `proxy --check` against the rendered file, like `nginx -t`.
    async fn check_proxy_config(&self) -> Result<(), SupervisorError> {
        let status = Command::new(&self.program)
            .arg("proxy")
            .arg("--config")
            .arg(&self.layout.proxy_config)
            .arg("--check")
            .status()
            .await
            .map_err(|source| SupervisorError::Spawn {
                name: "proxy --check",
                source,
            })?;
        if status.success() {
            Ok(())
        } else {
            Err(SupervisorError::InvalidProxyConfig(format!(
                "{} failed validation ({})",
                self.layout.proxy_config.display(),
                status
            )))
        }
    }

    async fn start_proxy(&mut self) -> Result<(), SupervisorError> {
        let mut command = Command::new(&self.program);
        command
            .arg("proxy")
            .arg("--config")
            .arg(&self.layout.proxy_config);
        let proxy = ManagedChild::spawn("proxy", &mut command)
            .map_err(|source| SupervisorError::Spawn { name: "proxy", source })?;
        self.children.proxy = Some(proxy);
        self.advance(Phase::ProxyStarted);

        tokio::time::sleep(PROXY_SETTLE_DELAY).await;
        if let Some(proxy) = self.children.proxy.as_mut() {
            if let Some(status) = proxy.try_exited()? {
                return Err(SupervisorError::ExitedEarly {
                    name: "proxy",
                    status: status.to_string(),
                });
            }
        }
        self.advance(Phase::ProxyHealthy);
        Ok(())
    }

    fn start_backend(&mut self) -> Result<(), SupervisorError> {
        let mut command = self.backend_command();
        let backend = ManagedChild::spawn("backend", &mut command)
            .map_err(|source| SupervisorError::Spawn { name: "backend", source })?;
        self.children.backend = Some(backend);
        self.advance(Phase::BackendStarted);
        Ok(())
    }

    /// `serve` on loopback; verbose logging in development.
    pub fn backend_command(&self) -> Command {
        let mut command = Command::new(&self.program);
        command
            .arg("serve")
            .arg("--host")
            .arg("127.0.0.1")
            .arg("--port")
            .arg(self.args.backend_port.to_string())
            .arg("--images-root")
            .arg(&self.layout.images_dir)
            .env("ENVIRONMENT", self.environment.to_string());
        if std::env::var_os("RUST_LOG").is_none() {
            let level = if self.environment.is_development() { "debug" } else { "info" };
            command.env("RUST_LOG", level);
        }
        command
    }

    fn health_url(&self) -> Result<Uri, SupervisorError> {
        format!("http://127.0.0.1:{}/health", self.args.backend_port)
            .parse()
            .map_err(|e| SupervisorError::Io(io::Error::other(format!("health url: {}", e))))
    }

    /// Poll `/health` with bounded retries; a dead backend fails immediately.
    async fn wait_backend_healthy(&mut self) -> Result<(), SupervisorError> {
        let probe = HealthProbe::new(self.health_url()?, self.health.timeout);

        for attempt in 1..=self.health.attempts {
            if let Some(backend) = self.children.backend.as_mut() {
                if let Some(status) = backend.try_exited()? {
                    return Err(SupervisorError::ExitedEarly {
                        name: "backend",
                        status: status.to_string(),
                    });
                }
            }

            if probe.check().await {
                info!(attempt, url = %probe.url(), "backend healthy");
                self.advance(Phase::BackendHealthy);
                return Ok(());
            }
            warn!(attempt, max = self.health.attempts, "backend not healthy yet");
            if attempt < self.health.attempts {
                tokio::time::sleep(self.health.interval).await;
            }
        }

        Err(SupervisorError::Unhealthy {
            attempts: self.health.attempts,
        })
    }
}

fn describe_exit(status: io::Result<std::process::ExitStatus>) -> String {
    match status {
        Ok(status) => status.to_string(),
        Err(e) => format!("wait failed: {}", e),
    }
}

/// Termination signals, registered before any child is launched so that a
/// signal arriving mid-startup is still relayed.
struct Signals {
    #[cfg(unix)]
    term: tokio::signal::unix::Signal,
    #[cfg(unix)]
    int: tokio::signal::unix::Signal,
}

impl Signals {
    fn install() -> io::Result<Self> {
        #[cfg(unix)]
        {
            use tokio::signal::unix::{SignalKind, signal};
            Ok(Self {
                term: signal(SignalKind::terminate())?,
                int: signal(SignalKind::interrupt())?,
            })
        }
        #[cfg(not(unix))]
        {
            Ok(Self {})
        }
    }

    async fn recv(&mut self) -> &'static str {
        #[cfg(unix)]
        {
            tokio::select! {
                _ = self.term.recv() => "SIGTERM",
                _ = self.int.recv() => "SIGINT",
            }
        }
        #[cfg(not(unix))]
        {
            let _ = tokio::signal::ctrl_c().await;
            "Ctrl+C"
        }
    }
}
