use thiserror::Error;

#[derive(Error, Debug)]
pub enum Error {
    #[error("Instance {service}/{instance_id} is not registered")]
    NotFound { service: String, instance_id: String },

    #[error("Delta cursor {since} is outside the retained window (retained {oldest}..={latest})")]
    StaleCursor { since: u64, oldest: u64, latest: u64 },

    #[error("Peer {peer} unreachable: {reason}")]
    PeerUnreachable { peer: String, reason: String },

    #[error("Peer {peer} rejected the request: {reason}")]
    PeerRejected { peer: String, reason: String },

    #[error("Validation failed: {0}")]
    Validation(String),

    #[error("Invalid configuration: {0}")]
    Config(String),

    #[error("Clock drift exceeded: remote={remote_physical}ms local={local_physical}ms max={max_drift_ms}ms")]
    ClockDrift {
        remote_physical: u64,
        local_physical: u64,
        max_drift_ms: u64,
    },

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Other error: {0}")]
    Other(#[from] anyhow::Error),
}

impl Error {
    pub fn not_found(service: &str, instance_id: &str) -> Self {
        Self::NotFound {
            service: service.to_string(),
            instance_id: instance_id.to_string(),
        }
    }

    pub fn validation(reason: impl Into<String>) -> Self {
        Self::Validation(reason.into())
    }
}

pub type Result<T> = std::result::Result<T, Error>;
