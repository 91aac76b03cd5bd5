//! End-to-end session tests: a real client socket and a real (fake) upstream socket, talking
//! actual framed MySQL packets through `session::run`, covering the allow/block/hot-reload
//! scenarios end to end rather than at the classifier or policy-engine layer alone.

use proxy::audit::TracingLogSink;
use proxy::policy::{PolicyConfig, PolicyEngine};
use proxy::protocol::mysql::packet::packet_reader::PacketReader;
use proxy::protocol::mysql::packet::packet_writer::PacketWriter;
use proxy::server::session::{self, SessionDeps, SessionHandle};
use proxy::stats::StatsCollector;

use std::io::Write as _;
use std::net::Ipv4Addr;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::net::{TcpListener, TcpStream};

const BASE_POLICY_YAML: &str = r#"
global:
  log_level: info
  max_connections: 100
  idle_timeout_seconds: 300
access_control:
  - user: "*"
    allowed_tables: ["*"]
    allowed_operations: ["*"]
sql_rules:
  block_statements: ["DROP"]
  block_patterns: ["union\\s+select"]
procedure_control:
  mode: blacklist
  names: []
  block_dynamic_sql: false
  block_create_alter: false
"#;

/// The exact Handshake Response v41 payload (user/db `default`) used by
/// `protocol::mysql::basic`'s own parse test, stripped of its 4-byte frame header.
const HANDSHAKE_RESPONSE_PAYLOAD: &[u8] = &[
    0x8d, 0xa6, 0xff, 0x09, 0x00, 0x00, 0x00, 0x01, 0x21, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00,
    0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00,
    0x64, 0x65, 0x66, 0x61, 0x75, 0x6c, 0x74, 0x00, 0x14, 0xf7, 0xd1, 0x6c, 0xe9, 0x0d, 0x2f,
    0x34, 0xb0, 0x2f, 0xd8, 0x1d, 0x18, 0xc7, 0xa4, 0xe8, 0x98, 0x97, 0x67, 0xeb, 0xad, 0x64,
    0x65, 0x66, 0x61, 0x75, 0x6c, 0x74, 0x00, 0x6d, 0x79, 0x73, 0x71, 0x6c, 0x5f, 0x6e, 0x61,
    0x74, 0x69, 0x76, 0x65, 0x5f, 0x70, 0x61, 0x73, 0x73, 0x77, 0x6f, 0x72, 0x64, 0x00,
];

fn ok_payload() -> Vec<u8> {
    let mut p = vec![0x00u8];
    p.extend_from_slice(&[0, 0]); // affected_rows, last_insert_id (lenenc 0)
    p.extend_from_slice(&[0x02, 0x00]); // status flags
    p.extend_from_slice(&[0x00, 0x00]); // warnings
    p
}

/// Drives a single fake upstream connection: relays a minimal handshake, then replies OK to every
/// `ComQuery` it receives while recording the query text it was asked to run.
async fn fake_upstream(listener: TcpListener, seen: Arc<Mutex<Vec<String>>>) {
    let (stream, _) = listener.accept().await.expect("upstream accept");
    let (read, write) = stream.into_split();
    let mut reader = PacketReader::new(read);
    let mut writer = PacketWriter::new(write);

    // Initial greeting: anything that isn't an OK/ERR header keeps the handshake relay going.
    writer.set_seq(0);
    writer.write_all(&[0x0a]).unwrap();
    writer.end_packet().await.unwrap();
    writer.flush_all().await.unwrap();

    // The client's (relayed) handshake response; contents aren't inspected here.
    reader.next_async().await.unwrap().expect("handshake response");

    writer.set_seq(2);
    writer.write_all(&ok_payload()).unwrap();
    writer.end_packet().await.unwrap();
    writer.flush_all().await.unwrap();

    loop {
        let (_, packet) = match reader.next_async().await.unwrap() {
            Some(pair) => pair,
            None => return,
        };
        if packet.is_empty() {
            return;
        }
        match packet[0] {
            1 => return, // ComQuit
            3 => {
                let sql = String::from_utf8_lossy(&packet[1..]).into_owned();
                seen.lock().unwrap().push(sql);
                writer.set_seq(1);
                writer.write_all(&ok_payload()).unwrap();
                writer.end_packet().await.unwrap();
                writer.flush_all().await.unwrap();
            }
            _ => return,
        }
    }
}

#[tokio::test]
async fn blocked_statement_never_reaches_upstream_and_reload_takes_effect_immediately() {
    let upstream_listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let upstream_addr = upstream_listener.local_addr().unwrap();
    let seen_queries = Arc::new(Mutex::new(Vec::new()));
    tokio::spawn(fake_upstream(upstream_listener, Arc::clone(&seen_queries)));

    let policy = Arc::new(PolicyEngine::with_config(
        PolicyConfig::from_yaml_str(BASE_POLICY_YAML).unwrap(),
    ));
    let deps = SessionDeps {
        policy: Arc::clone(&policy),
        log_sink: Arc::new(TracingLogSink),
        stats: Arc::new(StatsCollector::new()),
        upstream_addr,
        idle_timeout: Duration::from_secs(5),
    };
    let handle = Arc::new(SessionHandle::default());

    let client_listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let client_addr = client_listener.local_addr().unwrap();
    tokio::spawn(async move {
        let (stream, peer) = client_listener.accept().await.unwrap();
        session::run(1, stream, Ipv4Addr::new(127, 0, 0, 1), peer.port(), deps, handle).await;
    });

    let client = TcpStream::connect(client_addr).await.unwrap();
    let (read, write) = client.into_split();
    let mut reader = PacketReader::new(read);
    let mut writer = PacketWriter::new(write);

    // Greeting relayed from the fake upstream.
    reader.next_async().await.unwrap().expect("greeting");

    writer.set_seq(1);
    writer.write_all(HANDSHAKE_RESPONSE_PAYLOAD).unwrap();
    writer.end_packet().await.unwrap();
    writer.flush_all().await.unwrap();

    let (_, handshake_ok) = reader.next_async().await.unwrap().expect("handshake ok");
    assert!(handshake_ok.is_ok_packet());

    // Blocked: `DROP` is in `block_statements`. The proxy must answer with ERR 1045 itself and
    // never forward the statement.
    writer.set_seq(0);
    writer.write_all(b"\x03DROP TABLE users").unwrap();
    writer.end_packet().await.unwrap();
    writer.flush_all().await.unwrap();

    let (_, blocked_response) = reader.next_async().await.unwrap().expect("block response");
    assert!(blocked_response.is_err_packet());
    assert_eq!(
        u16::from_le_bytes([blocked_response[1], blocked_response[2]]),
        1045
    );
    assert!(seen_queries.lock().unwrap().is_empty());

    // Allowed: a plain SELECT is forwarded and the upstream's OK is relayed back.
    writer.set_seq(0);
    writer.write_all(b"\x03SELECT 1").unwrap();
    writer.end_packet().await.unwrap();
    writer.flush_all().await.unwrap();

    let (_, allowed_response) = reader.next_async().await.unwrap().expect("allow response");
    assert!(allowed_response.is_ok_packet());
    assert_eq!(seen_queries.lock().unwrap().as_slice(), ["SELECT 1"]);

    // Hot reload: lift the DROP block on the already-open session. The very next query on the
    // same connection must observe the new policy without a reconnect.
    policy.reload(Some(
        PolicyConfig::from_yaml_str(&BASE_POLICY_YAML.replace(
            "block_statements: [\"DROP\"]",
            "block_statements: []",
        ))
        .unwrap(),
    ));

    writer.set_seq(0);
    writer.write_all(b"\x03DROP TABLE users").unwrap();
    writer.end_packet().await.unwrap();
    writer.flush_all().await.unwrap();

    let (_, reloaded_response) = reader.next_async().await.unwrap().expect("post-reload response");
    assert!(reloaded_response.is_ok_packet());
    assert_eq!(
        seen_queries.lock().unwrap().as_slice(),
        ["SELECT 1", "DROP TABLE users"]
    );

    writer.set_seq(0);
    writer.write_all(&[1]).unwrap(); // ComQuit
    writer.end_packet().await.unwrap();
    writer.flush_all().await.unwrap();
}

#[tokio::test]
async fn prepared_statements_are_rejected_without_reaching_upstream() {
    let upstream_listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let upstream_addr = upstream_listener.local_addr().unwrap();
    let seen_queries = Arc::new(Mutex::new(Vec::new()));
    tokio::spawn(fake_upstream(upstream_listener, Arc::clone(&seen_queries)));

    let policy = Arc::new(PolicyEngine::with_config(
        PolicyConfig::from_yaml_str(BASE_POLICY_YAML).unwrap(),
    ));
    let deps = SessionDeps {
        policy,
        log_sink: Arc::new(TracingLogSink),
        stats: Arc::new(StatsCollector::new()),
        upstream_addr,
        idle_timeout: Duration::from_secs(5),
    };
    let handle = Arc::new(SessionHandle::default());

    let client_listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let client_addr = client_listener.local_addr().unwrap();
    tokio::spawn(async move {
        let (stream, peer) = client_listener.accept().await.unwrap();
        session::run(1, stream, Ipv4Addr::new(127, 0, 0, 1), peer.port(), deps, handle).await;
    });

    let client = TcpStream::connect(client_addr).await.unwrap();
    let (read, write) = client.into_split();
    let mut reader = PacketReader::new(read);
    let mut writer = PacketWriter::new(write);

    reader.next_async().await.unwrap().expect("greeting");
    writer.set_seq(1);
    writer.write_all(HANDSHAKE_RESPONSE_PAYLOAD).unwrap();
    writer.end_packet().await.unwrap();
    writer.flush_all().await.unwrap();
    reader.next_async().await.unwrap().expect("handshake ok");

    // COM_STMT_PREPARE (22)
    writer.set_seq(0);
    writer.write_all(b"\x16SELECT * FROM users WHERE id = ?").unwrap();
    writer.end_packet().await.unwrap();
    writer.flush_all().await.unwrap();

    let (_, response) = reader.next_async().await.unwrap().expect("prepare rejection");
    assert!(response.is_err_packet());
    assert_eq!(u16::from_le_bytes([response[1], response[2]]), 1235);
    assert!(seen_queries.lock().unwrap().is_empty());
}
