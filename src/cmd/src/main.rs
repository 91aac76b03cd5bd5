use clap::Parser;
use common::ShutdownMessage;
use proxy::control;
use proxy::policy::PolicyConfig;
use proxy::server::{ProxyServer, ProxyServerConfig};
use std::net::SocketAddr;
use std::str::FromStr;
use std::time::Duration;
use tokio::sync::watch;
use tracing::{info, warn, Level};
use tracing_subscriber::EnvFilter;
use web_service::http_server::HealthServer;

/// CLI configuration for the MySQL policy-enforcing proxy (§6 "Configuration inputs").
#[derive(Debug, Clone, Parser)]
#[command(name = "my-proxy", about = "Transparent policy-enforcing MySQL proxy")]
struct ProxyServerArgs {
    /// Address the proxy listens on for client connections.
    #[arg(long, env = "PROXY_LISTEN_ADDR", default_value = "0.0.0.0")]
    listen_addr: String,
    #[arg(long, env = "PROXY_LISTEN_PORT", default_value_t = 3306)]
    listen_port: u16,

    /// Address of the real MySQL server this proxy forwards to.
    #[arg(long, env = "PROXY_UPSTREAM_ADDR")]
    upstream_addr: String,
    #[arg(long, env = "PROXY_UPSTREAM_PORT", default_value_t = 3306)]
    upstream_port: u16,

    /// Overrides `global.max_connections` from the policy document when set.
    #[arg(long, env = "PROXY_MAX_CONNECTIONS")]
    max_connections: Option<u32>,
    /// Overrides `global.idle_timeout_seconds` from the policy document when set.
    #[arg(long, env = "PROXY_IDLE_TIMEOUT_SECONDS")]
    idle_timeout_seconds: Option<u64>,

    /// Path to the YAML policy document (§6 "Policy document contract").
    #[arg(long, env = "PROXY_POLICY_FILE")]
    policy_file: String,

    /// Unix domain socket path for the control protocol (§6 "Control socket contract").
    #[arg(long, env = "PROXY_CONTROL_SOCKET", default_value = "/tmp/my-proxy.sock")]
    control_socket: String,

    /// Address the health HTTP surface binds to.
    #[arg(long, env = "PROXY_HEALTH_ADDR", default_value = "0.0.0.0")]
    health_addr: String,
    #[arg(long, env = "PROXY_HEALTH_PORT", default_value_t = 8080)]
    health_port: u16,

    #[arg(long, env = "PROXY_LOG_LEVEL", default_value = "info")]
    log_level: String,

    #[arg(long, env = "PROXY_WORKER_THREADS")]
    worker_threads: Option<usize>,
}

async fn shutdown_signal() -> ShutdownMessage {
    let ctrl_c = async {
        tokio::signal::ctrl_c()
            .await
            .expect("failed to install ctrl_c handler");
    };
    let terminate = async {
        tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
            .expect("failed to install SIGTERM handler")
            .recv()
            .await;
    };
    tokio::select! {
        _ = ctrl_c => ShutdownMessage::Cancel("ctrl_c".to_string()),
        _ = terminate => ShutdownMessage::Cancel("sigterm".to_string()),
    }
}

/// Watches for SIGHUP and reloads the policy document from `policy_file` on every signal,
/// forever. Runs as its own task; a failed reload is logged and the previous config stays live
/// (fail-close: never silently clears the policy on a bad reload).
async fn reload_on_sighup(server: std::sync::Arc<ProxyServer>, policy_file: String) {
    let mut sighup = match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::hangup()) {
        Ok(s) => s,
        Err(e) => {
            warn!(error = %e, "failed to install SIGHUP handler, policy reload via signal disabled");
            return;
        }
    };
    loop {
        sighup.recv().await;
        match PolicyConfig::load(&policy_file) {
            Ok(cfg) => {
                info!(path = %policy_file, "reloading policy from SIGHUP");
                server.reload_policy(Some(cfg));
            }
            Err(e) => {
                warn!(path = %policy_file, error = %e, "policy reload failed, keeping previous config");
            }
        }
    }
}

fn main() -> anyhow::Result<()> {
    let args = ProxyServerArgs::parse();

    let level = Level::from_str(&args.log_level).unwrap_or(Level::INFO);
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new("info,hyper=info,tower=info"))
        .add_directive(level.into());
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_line_number(true)
        .init();

    let mut runtime_builder = tokio::runtime::Builder::new_multi_thread();
    runtime_builder.enable_all().thread_name("my-proxy");
    if let Some(workers) = args.worker_threads {
        runtime_builder.worker_threads(workers);
    }
    let runtime = runtime_builder.build()?;

    info!(?args, "my-proxy starting");

    runtime.block_on(async move {
        let policy_config = PolicyConfig::load(&args.policy_file)?;
        let max_connections = args
            .max_connections
            .unwrap_or(policy_config.global.max_connections);
        let idle_timeout = Duration::from_secs(
            args.idle_timeout_seconds
                .unwrap_or(policy_config.global.idle_timeout_seconds),
        );

        let listen_addr: SocketAddr =
            format!("{}:{}", args.listen_addr, args.listen_port).parse()?;
        let upstream_addr: SocketAddr =
            format!("{}:{}", args.upstream_addr, args.upstream_port).parse()?;
        let health_addr: SocketAddr =
            format!("{}:{}", args.health_addr, args.health_port).parse()?;

        let server = ProxyServer::new(
            ProxyServerConfig {
                listen_addr,
                upstream_addr,
                max_connections,
                idle_timeout,
            },
            Some(policy_config),
        );

        let (shutdown_tx, shutdown_rx) = watch::channel(ShutdownMessage::Init);

        let health_server = server.health();
        let health_addr_copy = health_addr;
        let mut health_shutdown_rx = shutdown_rx.clone();
        tokio::spawn(async move {
            let shutdown = async move {
                let _ = health_shutdown_rx.changed().await;
            };
            if let Err(e) = HealthServer::start(health_addr_copy, health_server, shutdown).await {
                warn!(error = %e, "health server exited with an error");
            }
        });

        let control_server = std::sync::Arc::clone(&server);
        let control_socket = args.control_socket.clone();
        let policy_file_for_control = args.policy_file.clone();
        tokio::spawn(async move {
            if let Err(e) =
                control::serve(control_socket, control_server, Some(policy_file_for_control)).await
            {
                warn!(error = %e, "control socket server exited with an error");
            }
        });

        tokio::spawn(reload_on_sighup(
            std::sync::Arc::clone(&server),
            args.policy_file.clone(),
        ));

        let accept_server = std::sync::Arc::clone(&server);
        let accept_task = tokio::spawn(async move { accept_server.run().await });

        let shutdown_msg = shutdown_signal().await;
        info!(?shutdown_msg, "shutdown signal received");
        shutdown_tx.send(shutdown_msg)?;
        server.stop();
        let _ = accept_task.await;

        anyhow::Ok(())
    })
}
