use anyhow::Context;
use clap::Parser;
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};
use vmterm::command::{find_binary, HostCommandRunner};
use vmterm::config::{
    ReaperConfig, VmConfig, DEFAULT_DISK_IMAGE, DEFAULT_IP_BINARY, DEFAULT_MAC_PREFIX,
    DEFAULT_QEMU_BINARY,
};
use vmterm::errors::SessionResult;
use vmterm::machine::{MachineSupervisor, QemuLauncher};
use vmterm::network::NetworkProvisioner;
use vmterm::service::{SessionService, UnavailableSessionService};
use vmterm::{build_router, IdleReaper, SessionRegistry, DEFAULT_HTTP_PORT};

#[derive(Parser, Debug)]
#[command(name = "vmtermd", author, version)]
struct Options {
    /// Address the HTTP server binds to
    #[arg(long, default_value = "0.0.0.0", env = "VMTERM_BIND")]
    bind: String,
    /// Port for the HTTP server
    #[arg(long, default_value_t = DEFAULT_HTTP_PORT, env = "VMTERM_PORT")]
    port: u16,
    /// Directory used for logs
    #[arg(long, default_value = "/var/log/vmterm", env = "VMTERM_LOG_DIR")]
    log_dir: PathBuf,
    /// Network interface tool
    #[arg(long, default_value = DEFAULT_IP_BINARY, env = "VMTERM_IP_BINARY")]
    ip_binary: String,
    /// Emulator started for every machine
    #[arg(long, default_value = DEFAULT_QEMU_BINARY, env = "VMTERM_QEMU_BINARY")]
    qemu_binary: String,
    /// Guest disk image; writes are discarded when the machine exits
    #[arg(long, default_value = DEFAULT_DISK_IMAGE, env = "VMTERM_DISK_IMAGE")]
    disk_image: PathBuf,
    #[arg(long, default_value = "qcow2", env = "VMTERM_DISK_FORMAT")]
    disk_format: String,
    #[arg(long, default_value_t = 256, env = "VMTERM_MEMORY_MB")]
    memory_mb: u32,
    #[arg(long, default_value = "kvm", env = "VMTERM_ACCEL")]
    accel: String,
    /// Do not pass `-sandbox on` to the emulator
    #[arg(long, env = "VMTERM_NO_SECCOMP")]
    no_seccomp: bool,
    /// Sessions without client activity for this long are torn down
    #[arg(long, default_value_t = 600, env = "VMTERM_SESSION_TIMEOUT_SECS")]
    session_timeout_secs: u64,
    /// How often idle sessions are looked for
    #[arg(long, default_value_t = 300, env = "VMTERM_REAP_INTERVAL_SECS")]
    reap_interval_secs: u64,
}

impl Options {
    fn vm_config(&self, binary: String) -> VmConfig {
        VmConfig {
            binary,
            disk_image: self.disk_image.clone(),
            disk_format: self.disk_format.clone(),
            memory_mb: self.memory_mb,
            accel: self.accel.clone(),
            mac_prefix: DEFAULT_MAC_PREFIX.to_string(),
            seccomp: !self.no_seccomp,
        }
    }

    fn reaper_config(&self) -> ReaperConfig {
        ReaperConfig {
            interval: Duration::from_secs(self.reap_interval_secs),
            timeout: Duration::from_secs(self.session_timeout_secs),
        }
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let options = Options::parse();
    let _guard = init_tracing(&options.log_dir);

    run_server(options).await
}

fn init_tracing(log_dir: &Path) -> Option<tracing_appender::non_blocking::WorkerGuard> {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));

    let stdout_layer = tracing_subscriber::fmt::layer().with_target(false);

    if let Err(e) = std::fs::create_dir_all(log_dir) {
        eprintln!(
            "Failed to create log directory {:?}: {}. Logging to file disabled.",
            log_dir, e
        );
        tracing_subscriber::registry()
            .with(filter)
            .with(stdout_layer)
            .init();
        return None;
    }

    let file_appender = tracing_appender::rolling::daily(log_dir, "vmtermd.log");
    let (non_blocking, guard) = tracing_appender::non_blocking(file_appender);

    let file_layer = tracing_subscriber::fmt::layer()
        .with_writer(non_blocking)
        .with_target(false)
        .with_ansi(false);

    tracing_subscriber::registry()
        .with(filter)
        .with(stdout_layer)
        .with(file_layer)
        .init();

    Some(guard)
}

async fn shutdown_signal() {
    if let Err(error) = tokio::signal::ctrl_c().await {
        tracing::error!("failed to listen for shutdown signal: {error}");
    }
    tracing::info!("shutdown signal received");
}

async fn run_server(options: Options) -> anyhow::Result<()> {
    let bind_ip = parse_bind_ip(&options.bind);
    let reaper_cancel = CancellationToken::new();

    let (service, registry): (Arc<dyn SessionService>, Option<Arc<SessionRegistry>>) =
        match build_registry(&options) {
            Ok(registry) => {
                let registry = Arc::new(registry);
                IdleReaper::new(registry.clone(), options.reaper_config())
                    .spawn(reaper_cancel.clone());
                let service: Arc<dyn SessionService> = registry.clone();
                (service, Some(registry))
            }
            Err(error) => {
                tracing::error!(
                    %error,
                    "failed to initialize session service; running in degraded mode"
                );
                let service: Arc<dyn SessionService> =
                    Arc::new(UnavailableSessionService::new(error.to_string()));
                (service, None)
            }
        };

    let app = build_router(service);
    let addr = SocketAddr::new(bind_ip, options.port);
    let listener = TcpListener::bind(addr)
        .await
        .with_context(|| format!("failed to bind listener on {addr}"))?;
    tracing::info!("vmtermd listening on http://{}", addr);

    let served = axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await;

    reaper_cancel.cancel();
    if let Some(registry) = registry {
        let report = registry.shutdown().await;
        if !report.is_clean() {
            tracing::warn!(
                failures = report.failures().len(),
                "some resources could not be released on shutdown"
            );
        }
    }

    served.context("server error")?;
    tracing::info!("server shut down gracefully");
    Ok(())
}

fn build_registry(options: &Options) -> SessionResult<SessionRegistry> {
    let ip_path = find_binary(&options.ip_binary)?;
    let qemu_path = find_binary(&options.qemu_binary)?;
    if !options.disk_image.exists() {
        tracing::warn!(
            image = %options.disk_image.display(),
            "disk image not found; machines will fail to boot"
        );
    }

    let network = NetworkProvisioner::new(Arc::new(HostCommandRunner), ip_path);
    let launcher = QemuLauncher::new(options.vm_config(qemu_path));
    Ok(SessionRegistry::new(
        network,
        MachineSupervisor::new(Arc::new(launcher)),
    ))
}

fn parse_bind_ip(bind: &str) -> IpAddr {
    match bind.parse() {
        Ok(ip) => ip,
        Err(error) => {
            tracing::error!(
                ?error,
                %bind,
                "invalid bind address; defaulting to 0.0.0.0"
            );
            IpAddr::V4(Ipv4Addr::UNSPECIFIED)
        }
    }
}
