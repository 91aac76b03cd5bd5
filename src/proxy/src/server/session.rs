//! The per-connection coroutine (§4.7): handshake relay, command loop, block/allow dispatch.
//!
//! States: `Handshaking -> Ready -> ProcessingQuery -> (Ready | Closing) -> Closed`. A session is
//! one `tokio::spawn`ed task; every handler runs to completion before the next begins, so
//! client-read -> classify -> evaluate -> server-write -> response-relay -> logging -> stats is
//! naturally sequential with no session-internal locking.

use crate::audit::{AuditRecord, LogSink};
use crate::policy::engine::{Action, PolicyEngine};
use crate::protocol::mysql::basic::client_handshake_response;
use crate::protocol::mysql::constants::CommandCode;
use crate::protocol::mysql::error_codes::ErrorKind;
use crate::protocol::mysql::packet::packet_reader::PacketReader;
use crate::protocol::mysql::packet::packet_writer::PacketWriter;
use crate::protocol::mysql::packet::writers::write_err_packet;
use crate::server::response_streamer::{stream_response, CommandKind};
use crate::server::session_context::SessionContext;
use crate::sql::classifier::classify;
use crate::sql::injection::InjectionDetector;
use crate::stats::StatsCollector;

use num_traits::FromPrimitive;
use std::io::{self, Write};
use std::net::{Ipv4Addr, SocketAddr};
use std::sync::Arc;
use std::time::Duration;
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::TcpStream;
use tokio::sync::Notify;
use tracing::{info, warn};

/// Shared collaborators every session needs. Cheap to clone: everything inside is an `Arc`.
#[derive(Clone)]
pub struct SessionDeps {
    pub policy: Arc<PolicyEngine>,
    pub log_sink: Arc<dyn LogSink>,
    pub stats: Arc<StatsCollector>,
    pub upstream_addr: SocketAddr,
    pub idle_timeout: Duration,
}

/// One live session's cancellation handle, held by the session registry. `close` wakes the
/// session's pending read with no error of its own; the session observes the cancellation on its
/// next loop iteration and proceeds through its normal close path.
#[derive(Default)]
pub struct SessionHandle {
    cancel: Notify,
}

impl SessionHandle {
    pub fn close(&self) {
        self.cancel.notify_one();
    }
}

/// Runs one client connection to completion. Every I/O failure ends the session through the same
/// accounting path (stats decrement, close audit record) rather than panicking or leaking a count.
pub async fn run(
    session_id: u64,
    client: TcpStream,
    client_ip: Ipv4Addr,
    client_port: u16,
    deps: SessionDeps,
    handle: Arc<SessionHandle>,
) {
    deps.stats.connection_opened();
    let mut ctx = SessionContext::new(session_id, client_ip, client_port);

    let outcome = run_inner(client, &mut ctx, &deps, &handle).await;
    let reason = match &outcome {
        Ok(()) => "closed",
        Err(e) => {
            warn!(session_id, error = %e, "session ended with an error");
            "error"
        }
    };
    deps.stats.connection_closed();
    deps.log_sink.record(AuditRecord::ConnectionClosed {
        session_id,
        reason,
    });
}

async fn run_inner(
    client: TcpStream,
    ctx: &mut SessionContext,
    deps: &SessionDeps,
    handle: &SessionHandle,
) -> io::Result<()> {
    let (client_read, client_write) = client.into_split();
    let mut client_reader = PacketReader::new(client_read);
    let mut client_writer = PacketWriter::new(client_write);

    let upstream = match TcpStream::connect(deps.upstream_addr).await {
        Ok(s) => s,
        Err(e) => {
            // The handshake hasn't started, so there's no server sequence id to reply under
            // other than 0.
            let _ = write_err_packet(
                ErrorKind::CrConnectionError,
                format!("upstream connect failed: {e}").as_bytes(),
                0,
                &mut client_writer,
            )
            .await;
            return Err(io::Error::new(io::ErrorKind::ConnectionRefused, e));
        }
    };
    let (backend_read, backend_write) = upstream.into_split();
    let mut backend_reader = PacketReader::new(backend_read);
    let mut backend_writer = PacketWriter::new(backend_write);

    relay_handshake(
        &mut client_reader,
        &mut client_writer,
        &mut backend_reader,
        &mut backend_writer,
        ctx,
    )
    .await?;

    ctx.handshake_done = true;
    deps.log_sink.record(AuditRecord::ConnectionOpened {
        session_id: ctx.session_id,
        client_ip: ctx.client_ip,
        client_port: ctx.client_port,
    });
    info!(session_id = ctx.session_id, user = %ctx.db_user, "handshake complete");

    command_loop(
        &mut client_reader,
        &mut client_writer,
        &mut backend_reader,
        &mut backend_writer,
        ctx,
        deps,
        handle,
    )
    .await
}

/// Opaquely forwards handshake bytes in both directions, extracting `user`/`initial_db` from the
/// client's Handshake Response v41 payload as it passes through. Ends the relay when the server
/// sends its final OK or ERR. Any malformed handshake field is session-fatal (§4.2: no
/// "empty auth response is fine" relaxation).
async fn relay_handshake(
    client_reader: &mut PacketReader<OwnedReadHalf>,
    client_writer: &mut PacketWriter<OwnedWriteHalf>,
    backend_reader: &mut PacketReader<OwnedReadHalf>,
    backend_writer: &mut PacketWriter<OwnedWriteHalf>,
    ctx: &mut SessionContext,
) -> io::Result<()> {
    let mut extracted_fields = false;
    loop {
        let (seq, server_pkt) = backend_reader.next_async().await?.ok_or_else(|| {
            io::Error::new(
                io::ErrorKind::UnexpectedEof,
                "upstream closed during handshake",
            )
        })?;
        client_writer.set_seq(seq);
        client_writer.write_all(&server_pkt)?;
        client_writer.end_packet().await?;
        client_writer.flush_all().await?;

        if server_pkt.is_ok_packet() || server_pkt.is_err_packet() {
            return Ok(());
        }

        let (cseq, client_pkt) = client_reader.next_async().await?.ok_or_else(|| {
            io::Error::new(
                io::ErrorKind::UnexpectedEof,
                "client closed during handshake",
            )
        })?;

        if !extracted_fields {
            let handshake = client_handshake_response(&client_pkt)?;
            ctx.db_user = handshake.db_user_string();
            ctx.initial_db_name = handshake
                .database
                .as_ref()
                .map(|d| String::from_utf8_lossy(d).into_owned());
            extracted_fields = true;
        }

        backend_writer.set_seq(cseq);
        backend_writer.write_all(&client_pkt)?;
        backend_writer.end_packet().await?;
        backend_writer.flush_all().await?;
    }
}

async fn command_loop(
    client_reader: &mut PacketReader<OwnedReadHalf>,
    client_writer: &mut PacketWriter<OwnedWriteHalf>,
    backend_reader: &mut PacketReader<OwnedReadHalf>,
    backend_writer: &mut PacketWriter<OwnedWriteHalf>,
    ctx: &SessionContext,
    deps: &SessionDeps,
    handle: &SessionHandle,
) -> io::Result<()> {
    loop {
        let next = tokio::select! {
            biased;
            _ = handle.cancel.notified() => {
                info!(session_id = ctx.session_id, "session closed by request");
                return Ok(());
            }
            res = tokio::time::timeout(deps.idle_timeout, client_reader.next_async()) => res,
        };

        let read_result = match next {
            Ok(r) => r,
            Err(_elapsed) => {
                warn!(session_id = ctx.session_id, "idle timeout, closing session");
                deps.log_sink.record(AuditRecord::ConnectionClosed {
                    session_id: ctx.session_id,
                    reason: "idle_timeout",
                });
                return Ok(());
            }
        };

        let (seq, packet) = match read_result? {
            Some(pair) => pair,
            None => return Ok(()),
        };

        if packet.is_empty() {
            return Err(io::Error::new(
                io::ErrorKind::InvalidData,
                "empty command packet",
            ));
        }

        let command = CommandCode::from_u8(packet[0]);
        match command {
            Some(CommandCode::ComQuit) => {
                backend_writer.set_seq(seq);
                backend_writer.write_all(&packet)?;
                backend_writer.end_packet().await?;
                backend_writer.flush_all().await?;
                return Ok(());
            }
            Some(CommandCode::ComQuery) => {
                handle_query(
                    seq,
                    &packet,
                    client_writer,
                    backend_reader,
                    backend_writer,
                    ctx,
                    deps,
                )
                .await?;
            }
            Some(CommandCode::ComStmtPrepare)
            | Some(CommandCode::ComStmtExecute)
            | Some(CommandCode::ComStmtReset) => {
                write_err_packet(
                    ErrorKind::ErNotSupportedYet,
                    b"Prepared statements are not supported by proxy policy enforcement",
                    seq.wrapping_add(1),
                    client_writer,
                )
                .await?;
            }
            _ => {
                backend_writer.set_seq(seq);
                backend_writer.write_all(&packet)?;
                backend_writer.end_packet().await?;
                backend_writer.flush_all().await?;
                stream_response(CommandKind::Other, backend_reader, client_writer).await?;
            }
        }
    }
}

async fn handle_query(
    seq: u8,
    packet: &[u8],
    client_writer: &mut PacketWriter<OwnedWriteHalf>,
    backend_reader: &mut PacketReader<OwnedReadHalf>,
    backend_writer: &mut PacketWriter<OwnedWriteHalf>,
    ctx: &SessionContext,
    deps: &SessionDeps,
) -> io::Result<()> {
    let started = tokio::time::Instant::now();
    let raw_sql = String::from_utf8_lossy(&packet[1..]).into_owned();
    deps.stats.query_seen();

    let result = match classify(&raw_sql) {
        Ok(parsed) => {
            // Run the standalone injection detector purely for audit enrichment: the policy
            // engine's own `sql_rules.block_patterns` step is authoritative for the Block/Allow
            // decision (§4.6 step 4). Re-deriving the detector from the same config snapshot
            // keeps its fail-close-on-empty behavior load-bearing even if the policy engine's
            // internal check were ever bypassed (§4.4).
            if let Some(cfg) = deps.policy.current() {
                let detector = InjectionDetector::new(&cfg.sql_rules.block_patterns);
                let injection = detector.check(&raw_sql);
                if injection.detected {
                    warn!(
                        session_id = ctx.session_id,
                        pattern = ?injection.pattern,
                        "injection detector flagged query"
                    );
                }
            }
            deps.policy.evaluate(&parsed, ctx)
        }
        Err(e) => deps.policy.evaluate_error(&e, ctx),
    };

    let duration_micros = started.elapsed().as_micros();

    if result.action == Action::Block {
        write_err_packet(
            ErrorKind::ErAccessDeniedError,
            b"Access denied by policy",
            seq.wrapping_add(1),
            client_writer,
        )
        .await?;
        deps.stats.query_blocked();
        deps.log_sink.record(AuditRecord::QueryDecision {
            session_id: ctx.session_id,
            action: result.action,
            matched_rule: result.matched_rule,
            reason: result.reason,
            duration_micros,
        });
        return Ok(());
    }

    backend_writer.set_seq(seq);
    backend_writer.write_all(packet)?;
    backend_writer.end_packet().await?;
    backend_writer.flush_all().await?;
    stream_response(CommandKind::ComQuery, backend_reader, client_writer).await?;

    deps.log_sink.record(AuditRecord::QueryDecision {
        session_id: ctx.session_id,
        action: result.action,
        matched_rule: result.matched_rule,
        reason: result.reason,
        duration_micros,
    });
    Ok(())
}
