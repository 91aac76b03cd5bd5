//! The transparent proxy server (§4.9): accept loop, admission control, session registry, and
//! signal-driven lifecycle. Construction happens once at process start from CLI-supplied
//! configuration; everything here is shared across sessions via `Arc`.

pub mod response_streamer;
pub mod session;
pub mod session_context;

use crate::audit::{AuditRecord, LogSink, TracingLogSink};
use crate::policy::engine::PolicyEngine;
use crate::policy::PolicyConfig;
use crate::server::session::{SessionDeps, SessionHandle};
use crate::stats::StatsCollector;

use common::HealthState;
use dashmap::DashMap;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, RwLock};
use std::time::Duration;
use tokio::net::TcpListener;
use tokio::sync::Notify;
use tracing::{info, warn};

/// Static, CLI-supplied configuration the server needs for its own lifetime, as distinct from the
/// hot-reloadable `PolicyConfig` the engine owns.
#[derive(Debug, Clone)]
pub struct ProxyServerConfig {
    pub listen_addr: SocketAddr,
    pub upstream_addr: SocketAddr,
    pub max_connections: u32,
    pub idle_timeout: Duration,
}

/// Owns every collaborator a session needs and the registry of sessions currently running.
pub struct ProxyServer {
    config: ProxyServerConfig,
    policy: Arc<PolicyEngine>,
    stats: Arc<StatsCollector>,
    log_sink: Arc<dyn LogSink>,
    health: Arc<RwLock<HealthState>>,
    sessions: DashMap<u64, Arc<SessionHandle>>,
    next_session_id: AtomicU64,
    stopping: AtomicBool,
    stop_notify: Notify,
}

impl ProxyServer {
    pub fn new(config: ProxyServerConfig, initial_policy: Option<PolicyConfig>) -> Arc<Self> {
        let policy = match initial_policy {
            Some(cfg) => PolicyEngine::with_config(cfg),
            None => PolicyEngine::new(),
        };
        Arc::new(ProxyServer {
            config,
            policy: Arc::new(policy),
            stats: Arc::new(StatsCollector::new()),
            log_sink: Arc::new(TracingLogSink),
            health: Arc::new(RwLock::new(HealthState::healthy())),
            sessions: DashMap::new(),
            next_session_id: AtomicU64::new(1),
            stopping: AtomicBool::new(false),
            stop_notify: Notify::new(),
        })
    }

    pub fn policy(&self) -> Arc<PolicyEngine> {
        Arc::clone(&self.policy)
    }

    pub fn stats(&self) -> Arc<StatsCollector> {
        Arc::clone(&self.stats)
    }

    pub fn health(&self) -> Arc<RwLock<HealthState>> {
        Arc::clone(&self.health)
    }

    pub fn active_session_count(&self) -> usize {
        self.sessions.len()
    }

    /// Swaps the live policy config. Reflected by every evaluation that starts after this call
    /// returns; in-flight evaluations hold their own snapshot (§4.6, §9 "Atomic config swap").
    pub fn reload_policy(&self, new_config: Option<PolicyConfig>) {
        let detail = match &new_config {
            Some(cfg) => format!(
                "{} access rules, {} block patterns",
                cfg.access_control.len(),
                cfg.sql_rules.block_patterns.len()
            ),
            None => "cleared".to_string(),
        };
        self.policy.reload(new_config);
        self.log_sink.record(AuditRecord::PolicyReload {
            success: true,
            detail,
        });
    }

    /// Accepts connections until `stop()` is called. Applies admission control before spawning a
    /// session: once `active_sessions >= max_connections`, new connections are refused and closed,
    /// and the health surface flips unhealthy so a load balancer stops routing here.
    pub async fn run(self: &Arc<Self>) -> std::io::Result<()> {
        let listener = TcpListener::bind(self.config.listen_addr).await?;
        info!(addr = %self.config.listen_addr, "proxy listening");

        loop {
            if self.stopping.load(Ordering::Acquire) {
                return Ok(());
            }
            let accepted = tokio::select! {
                biased;
                _ = self.stop_notify.notified() => return Ok(()),
                res = listener.accept() => res,
            };
            let (socket, peer) = match accepted {
                Ok(pair) => pair,
                Err(e) => {
                    warn!(error = %e, "accept failed");
                    continue;
                }
            };

            if self.active_session_count() >= self.config.max_connections as usize {
                warn!(
                    active = self.active_session_count(),
                    max = self.config.max_connections,
                    "admission control: connection refused"
                );
                *self.health.write().unwrap() =
                    HealthState::unhealthy("max_connections reached");
                drop(socket);
                continue;
            } else if !self.health.read().unwrap().healthy {
                *self.health.write().unwrap() = HealthState::healthy();
            }

            let client_ip = match peer {
                SocketAddr::V4(v4) => *v4.ip(),
                SocketAddr::V6(_) => {
                    warn!(%peer, "rejecting IPv6 client: CIDR matching is IPv4-only by design");
                    drop(socket);
                    continue;
                }
            };
            let client_port = peer.port();
            let session_id = self.next_session_id.fetch_add(1, Ordering::AcqRel);
            let handle = Arc::new(SessionHandle::default());
            self.sessions.insert(session_id, Arc::clone(&handle));

            let deps = SessionDeps {
                policy: Arc::clone(&self.policy),
                log_sink: Arc::clone(&self.log_sink),
                stats: Arc::clone(&self.stats),
                upstream_addr: self.config.upstream_addr,
                idle_timeout: self.config.idle_timeout,
            };
            let this = Arc::clone(self);
            tokio::spawn(async move {
                session::run(session_id, socket, client_ip, client_port, deps, handle).await;
                this.sessions.remove(&session_id);
            });
        }
    }

    /// Idempotent: closes the acceptor (via `stopping`), flips health unhealthy, and asks every
    /// live session to close. Does not wait for sessions to finish their in-flight packet; callers
    /// that need a drained registry should poll `active_session_count()`.
    pub fn stop(&self) {
        if self.stopping.swap(true, Ordering::AcqRel) {
            return;
        }
        *self.health.write().unwrap() = HealthState::unhealthy("shutting down");
        for entry in self.sessions.iter() {
            entry.value().close();
        }
        self.stop_notify.notify_waiters();
        info!("proxy server stop requested");
    }
}
