use anyhow::{Context, Result};
use clap::Parser;
use imagens::{
    config::{BackendConfig, Cli, Command, Environment, ProxyArgs, ServeArgs, SuperviseArgs},
    proxy::{self, config::ProxyConfig},
    routes::routes::routes,
    shutdown::shutdown_signal,
    state::AppState,
    supervisor::Supervisor,
};
use std::{io::ErrorKind, num::NonZeroUsize, thread};
use tokio::{net::TcpListener, runtime};
use tracing_subscriber::EnvFilter;

fn main() -> Result<()> {
    let cli = Cli::parse();

    match cli.command {
        Command::Serve(args) => serve(args),
        Command::Proxy(args) => run_proxy(args),
        Command::Supervise(args) => supervise(args),
    }
}

/// `RUST_LOG` wins; otherwise debug in development, info in production.
fn init_tracing(environment: Environment) {
    let default = if environment.is_development() { "debug" } else { "info" };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default));
    tracing_subscriber::fmt().with_env_filter(filter).init();
}

fn serve(args: ServeArgs) -> Result<()> {
    let cfg = BackendConfig::from_env_and_args(args)?;
    init_tracing(cfg.environment);

    let mut builder = runtime::Builder::new_multi_thread();
    builder.enable_all();
    if !cfg.environment.is_development() {
        let workers = cfg.workers.unwrap_or_else(|| {
            thread::available_parallelism()
                .map(NonZeroUsize::get)
                .unwrap_or(1)
        });
        builder.worker_threads(workers.max(1));
    }
    let rt = builder.build().context("building tokio runtime")?;

    rt.block_on(run_backend(cfg))
}

async fn run_backend(cfg: BackendConfig) -> Result<()> {
    tracing::info!("Starting upload backend with config: {:?}", cfg);

    let state = AppState::new(cfg.clone());
    state
        .storage
        .ensure_layout()
        .await
        .with_context(|| format!("preparing images root {}", cfg.images_root.display()))?;
    tracing::info!("Serving images from {}", cfg.images_root.display());

    let app = routes(state);

    let addr = cfg.addr();
    let listener = match TcpListener::bind(&addr).await {
        Ok(listener) => listener,
        Err(err)
            if err.kind() == ErrorKind::PermissionDenied
                && matches!(cfg.host.as_str(), "0.0.0.0" | "::") =>
        {
            let fallback_addr = format!("127.0.0.1:{}", cfg.port);
            tracing::warn!(
                "Permission denied binding to {} ({}). Falling back to {}",
                addr,
                err,
                fallback_addr
            );
            TcpListener::bind(&fallback_addr).await?
        }
        Err(err) => return Err(err.into()),
    };

    tracing::info!("Server listening on http://{}", listener.local_addr()?);
    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    tracing::info!("Backend shutdown complete");
    Ok(())
}

fn run_proxy(args: ProxyArgs) -> Result<()> {
    init_tracing(Environment::from_env());

    let config = ProxyConfig::load(&args.config)?;
    if args.check {
        config
            .validate()
            .with_context(|| format!("{} failed validation", args.config.display()))?;
        tracing::info!("{}: configuration ok", args.config.display());
        return Ok(());
    }

    let rt = runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .context("building tokio runtime")?;
    rt.block_on(proxy::run(config))
}

fn supervise(args: SuperviseArgs) -> Result<()> {
    let environment = Environment::from_env();
    init_tracing(environment);

    let program = std::env::current_exe().context("locating the imagens binary")?;
    let rt = runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .context("building tokio runtime")?;

    rt.block_on(Supervisor::new(args, environment, program).run())?;
    tracing::info!("Supervisor exited cleanly");
    Ok(())
}
