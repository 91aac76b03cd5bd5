use thiserror::Error;

/// Failures that occur while framing, relaying, or extracting fields from the MySQL wire
/// protocol. Every variant is session-fatal: the caller closes both sockets.
#[derive(Debug, Error)]
pub enum ProtocolError {
    #[error("malformed packet: {0}")]
    MalformedPacket(String),
    #[error("unsupported command: {0:#x}")]
    UnsupportedCommand(u8),
    #[error("failed to connect upstream: {0}")]
    UpstreamConnect(#[source] std::io::Error),
}

impl From<ProtocolError> for std::io::Error {
    fn from(e: ProtocolError) -> Self {
        std::io::Error::new(std::io::ErrorKind::InvalidData, e.to_string())
    }
}

/// Failure from the SQL classifier. Forces `PolicyEngine::evaluate_error`, which always returns
/// `Block`.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
#[error("invalid sql: {0}")]
pub struct ClassifyError(pub String);

/// Failures loading or validating a policy document.
#[derive(Debug, Error)]
pub enum PolicyConfigError {
    #[error("sql_rules.block_patterns must not be empty")]
    EmptyBlockPatterns,
    #[error("invalid policy document: {0}")]
    Yaml(#[from] serde_yaml::Error),
    #[error("failed to read policy file: {0}")]
    Io(#[from] std::io::Error),
}
