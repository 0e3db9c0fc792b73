#[derive(Debug)]
pub enum TransportError {
    /// Connection dropped or could not be established
    ConnectionLost(String),
    /// Channel closed underneath us; the connection may still be alive
    ChannelClosed(String),
    /// Broker refused the operation (unknown exchange, access refused, ...)
    Broker(String),
    Serialization(serde_json::Error),
    Cancelled,
}

impl TransportError {
    /// Transient errors are worth a reconnect and another attempt.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            TransportError::ConnectionLost(_) | TransportError::ChannelClosed(_)
        )
    }
}

impl std::fmt::Display for TransportError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            TransportError::ConnectionLost(msg) => write!(f, "Connection lost: {}", msg),
            TransportError::ChannelClosed(msg) => write!(f, "Channel closed: {}", msg),
            TransportError::Broker(msg) => write!(f, "Broker error: {}", msg),
            TransportError::Serialization(e) => write!(f, "Serialization error: {}", e),
            TransportError::Cancelled => write!(f, "Operation cancelled"),
        }
    }
}

impl std::error::Error for TransportError {}

impl From<serde_json::Error> for TransportError {
    fn from(err: serde_json::Error) -> Self {
        TransportError::Serialization(err)
    }
}

impl From<lapin::Error> for TransportError {
    fn from(err: lapin::Error) -> Self {
        match err {
            lapin::Error::IOError(_) | lapin::Error::InvalidConnectionState(_) => {
                TransportError::ConnectionLost(err.to_string())
            }
            lapin::Error::InvalidChannelState(_) | lapin::Error::InvalidChannel(_) => {
                TransportError::ChannelClosed(err.to_string())
            }
            _ => TransportError::Broker(err.to_string()),
        }
    }
}
