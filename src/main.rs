use clap::Parser;
use ingressd::config::{Config, PathOverrides};
use ingressd::descriptor;
use ingressd::reconcile::{ExitReason, Reconciler};
use ingressd::render::TemplateSet;
use ingressd::resolver::DnsResolver;
use ingressd::supervisor::ProxySupervisor;
use std::path::PathBuf;
use tokio::sync::watch;
use tracing::{error, info};

#[derive(Parser, Debug)]
#[command(name = "ingressd")]
#[command(
    about = "Keeps reverse proxy virtual hosts in sync with backend descriptors",
    long_about = None
)]
struct Args {
    /// Optional TOML settings file
    #[arg(long, env = "INGRESSD_SETTINGS")]
    settings: Option<PathBuf>,

    /// Directory of backend descriptors
    #[arg(long, env = "INGRESSD_CONFIG_PATH")]
    config_path: Option<PathBuf>,

    /// Proxy configuration directory that receives the include file
    #[arg(long, env = "INGRESSD_NGINX_CONFIG_PATH")]
    nginx_config_path: Option<PathBuf>,

    /// Directory rendered fragments are written to
    #[arg(long, env = "INGRESSD_NGINX_CONFIG_RENDER_PATH")]
    nginx_config_render_path: Option<PathBuf>,

    /// Template directory (repeatable, searched in order)
    #[arg(long = "template-path")]
    template_paths: Vec<PathBuf>,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Initialize logging
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive("ingressd=info".parse().expect("valid log directive")),
        )
        .init();

    let args = Args::parse();

    let config = match &args.settings {
        Some(path) => Config::load(path).map_err(|e| {
            error!(path = %path.display(), error = %e, "Failed to load settings");
            e
        })?,
        None => Config::default(),
    };
    let config = config.with_overrides(PathOverrides {
        descriptor_dir: args.config_path,
        proxy_config_dir: args.nginx_config_path,
        render_dir: args.nginx_config_render_path,
        template_dirs: args.template_paths,
    });
    config.validate()?;

    print_startup_banner(&config);

    let entries = descriptor::load_dir(&config.paths.descriptor_dir).map_err(|e| {
        error!(error = %e, "Failed to load descriptors");
        e
    })?;
    info!(
        entry_count = entries.len(),
        entries = ?entries.iter().map(|e| e.name()).collect::<Vec<_>>(),
        "Descriptors loaded"
    );

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    tokio::spawn(async move {
        wait_for_shutdown_signal().await;
        let _ = shutdown_tx.send(true);
    });

    let reconciler = Reconciler::new(
        entries,
        DnsResolver::new(config.timing.resolve_timeout()),
        TemplateSet::from_dirs(config.paths.template_dirs.clone()),
        ProxySupervisor::new(&config),
        config.timing.clone(),
        shutdown_rx,
    );

    match reconciler.run().await {
        Ok(ExitReason::Shutdown) => {
            info!("Shutdown complete");
            Ok(())
        }
        Ok(ExitReason::ProxyExited { code }) => {
            anyhow::bail!("proxy exited unexpectedly (exit code {:?})", code)
        }
        Err(e) => {
            error!(error = %e, fatal = e.is_fatal(), "Reconciliation stopped");
            Err(e.into())
        }
    }
}

async fn wait_for_shutdown_signal() {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};
        let mut sigterm = match signal(SignalKind::terminate()) {
            Ok(s) => s,
            Err(e) => {
                error!(error = %e, "Failed to install SIGTERM handler");
                let _ = tokio::signal::ctrl_c().await;
                info!("Received SIGINT (Ctrl+C), shutting down...");
                return;
            }
        };

        tokio::select! {
            _ = tokio::signal::ctrl_c() => {
                info!("Received SIGINT (Ctrl+C), shutting down...");
            }
            _ = sigterm.recv() => {
                info!("Received SIGTERM, shutting down...");
            }
        }
    }

    #[cfg(not(unix))]
    {
        let _ = tokio::signal::ctrl_c().await;
        info!("Received Ctrl+C, shutting down...");
    }
}

fn print_startup_banner(config: &Config) {
    info!(
        name = env!("CARGO_PKG_NAME"),
        version = env!("CARGO_PKG_VERSION"),
        "Starting ingress controller"
    );
    info!(
        descriptors = %config.paths.descriptor_dir.display(),
        proxy_config = %config.paths.proxy_config_dir.display(),
        render = %config.paths.render_dir.display(),
        templates = ?config.paths.template_dirs,
        "Paths"
    );
    info!(
        binary = %config.proxy.binary,
        main_config = %config.proxy.main_config.display(),
        include_file = %config.proxy.include_file,
        "Proxy settings"
    );
    info!(
        tick_ms = config.timing.tick_ms,
        detect_interval_ms = config.timing.detect_interval_ms,
        liveness_interval_ms = config.timing.liveness_interval_ms,
        resolve_timeout_ms = config.timing.resolve_timeout_ms,
        "Timing settings"
    );
}
