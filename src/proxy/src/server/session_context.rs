//! `SessionContext` (§3): created on accept, mutated only during the handshake, then read-only
//! for the rest of the session's life.

use std::net::Ipv4Addr;
use std::time::Instant;

#[derive(Debug, Clone)]
pub struct SessionContext {
    /// Process-unique, monotonically increasing.
    pub session_id: u64,
    pub client_ip: Ipv4Addr,
    pub client_port: u16,
    pub db_user: String,
    pub initial_db_name: Option<String>,
    pub connected_at: Instant,
    pub handshake_done: bool,
}

impl SessionContext {
    pub fn new(session_id: u64, client_ip: Ipv4Addr, client_port: u16) -> Self {
        SessionContext {
            session_id,
            client_ip,
            client_port,
            db_user: String::new(),
            initial_db_name: None,
            connected_at: Instant::now(),
            handshake_done: false,
        }
    }
}
