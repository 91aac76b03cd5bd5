//! Structured audit records (§4.7, §9 ambient logging). The core never depends on a specific
//! external sink — only on the `LogSink` seam — so an out-of-process JSON-line collector can be
//! swapped in without touching session code.

use crate::policy::engine::Action;

#[derive(Debug, Clone)]
pub enum AuditRecord {
    ConnectionOpened {
        session_id: u64,
        client_ip: std::net::Ipv4Addr,
        client_port: u16,
    },
    ConnectionClosed {
        session_id: u64,
        reason: &'static str,
    },
    QueryDecision {
        session_id: u64,
        action: Action,
        matched_rule: String,
        reason: String,
        duration_micros: u128,
    },
    PolicyReload {
        success: bool,
        detail: String,
    },
}

/// Seam between session/session-engine code and wherever audit records ultimately land. The only
/// shipped implementation emits through `tracing`; an external collector tails the process log.
pub trait LogSink: Send + Sync {
    fn record(&self, record: AuditRecord);
}

#[derive(Debug, Default, Clone, Copy)]
pub struct TracingLogSink;

impl LogSink for TracingLogSink {
    fn record(&self, record: AuditRecord) {
        match record {
            AuditRecord::ConnectionOpened {
                session_id,
                client_ip,
                client_port,
            } => {
                tracing::info!(session_id, %client_ip, client_port, "connection_opened");
            }
            AuditRecord::ConnectionClosed { session_id, reason } => {
                tracing::info!(session_id, reason, "connection_closed");
            }
            AuditRecord::QueryDecision {
                session_id,
                action,
                matched_rule,
                reason,
                duration_micros,
            } => match action {
                Action::Allow => {
                    tracing::info!(session_id, ?action, matched_rule, duration_micros, "query_decision");
                }
                Action::Block | Action::Log => {
                    tracing::warn!(
                        session_id,
                        ?action,
                        matched_rule,
                        reason,
                        duration_micros,
                        "query_decision"
                    );
                }
            },
            AuditRecord::PolicyReload { success, detail } => {
                if success {
                    tracing::info!(detail, "policy_reload");
                } else {
                    tracing::warn!(detail, "policy_reload_failed");
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn tracing_sink_accepts_every_record_variant() {
        let sink = TracingLogSink;
        sink.record(AuditRecord::ConnectionOpened {
            session_id: 1,
            client_ip: std::net::Ipv4Addr::new(127, 0, 0, 1),
            client_port: 5000,
        });
        sink.record(AuditRecord::QueryDecision {
            session_id: 1,
            action: Action::Block,
            matched_rule: "block-statement".to_string(),
            reason: "DROP is blocked".to_string(),
            duration_micros: 42,
        });
        sink.record(AuditRecord::ConnectionClosed {
            session_id: 1,
            reason: "client_quit",
        });
        sink.record(AuditRecord::PolicyReload {
            success: true,
            detail: "loaded 3 rules".to_string(),
        });
    }
}
