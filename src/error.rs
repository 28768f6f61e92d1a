use thiserror::Error;

#[derive(Debug, Error)]
pub enum SnapError {
    #[error("host not found, cloud id {cloud_id}, ips {ips:?}")]
    HostNotFound { cloud_id: String, ips: Vec<String> },
    #[error("host id is not an integer: {0}")]
    InvalidHostId(String),
    #[error("unexpected host record shape: {0}")]
    UnexpectedShape(String),
    #[error("{op} failed, code {code}: {message}")]
    Downstream {
        op: &'static str,
        code: i64,
        message: String,
    },
    #[error("{op} request failed: {source}")]
    Transport {
        op: &'static str,
        source: reqwest::Error,
    },
    #[error("{op} response could not be decoded: {source}")]
    Decode {
        op: &'static str,
        source: serde_json::Error,
    },
    #[error("snapshot cache error: {0}")]
    Cache(#[from] redis::RedisError),
}

impl SnapError {
    pub fn outcome_label(&self) -> &'static str {
        match self {
            SnapError::HostNotFound { .. } => "not_found",
            SnapError::InvalidHostId(_) => "invalid_host_id",
            _ => "failed",
        }
    }

    /// Name of the downstream operation that failed, if any.
    pub fn op(&self) -> Option<&'static str> {
        match self {
            SnapError::Downstream { op, .. }
            | SnapError::Transport { op, .. }
            | SnapError::Decode { op, .. } => Some(op),
            _ => None,
        }
    }

    pub fn is_input_anomaly(&self) -> bool {
        matches!(
            self,
            SnapError::HostNotFound { .. } | SnapError::InvalidHostId(_)
        )
    }
}
