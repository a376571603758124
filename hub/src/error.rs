use axum::http::StatusCode;
use uuid::Uuid;

/// Domain errors surfaced by the hub core.
///
/// Expected conditions (missing rows, terminal-state violations, session
/// problems) are typed so the HTTP and gRPC layers can map them; anything
/// infrastructural wraps through `Internal`.
#[derive(Debug, thiserror::Error)]
pub enum HubError {
    #[error("{0} not found")]
    NotFound(String),

    #[error("already exists: {0}")]
    AlreadyExists(String),

    #[error("{0}")]
    InvalidInput(String),

    #[error("invalid transition: {0}")]
    InvalidTransition(String),

    #[error("cluster {0} is disabled")]
    ClusterDisabled(Uuid),

    #[error("cluster {0} not found")]
    ClusterNotFound(Uuid),

    #[error("agent_disconnected")]
    AgentDisconnected,

    #[error("session_invalid")]
    SessionInvalid,

    #[error("channel_full")]
    ChannelFull,

    #[error("channel_closed")]
    ChannelClosed,

    #[error("timed_out")]
    TimedOut,

    #[error("cancelled")]
    Cancelled,

    #[error(transparent)]
    Internal(#[from] anyhow::Error),
}

impl HubError {
    pub fn http_status(&self) -> StatusCode {
        match self {
            HubError::NotFound(_) | HubError::ClusterNotFound(_) => StatusCode::NOT_FOUND,
            HubError::InvalidInput(_) => StatusCode::BAD_REQUEST,
            HubError::AlreadyExists(_)
            | HubError::InvalidTransition(_)
            | HubError::ClusterDisabled(_)
            | HubError::ChannelFull => StatusCode::CONFLICT,
            HubError::SessionInvalid => StatusCode::UNAUTHORIZED,
            HubError::TimedOut => StatusCode::GATEWAY_TIMEOUT,
            HubError::AgentDisconnected | HubError::ChannelClosed => {
                StatusCode::SERVICE_UNAVAILABLE
            }
            HubError::Cancelled => StatusCode::CONFLICT,
            HubError::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

impl From<HubError> for tonic::Status {
    fn from(e: HubError) -> tonic::Status {
        let message = e.to_string();
        match e {
            HubError::NotFound(_) | HubError::ClusterNotFound(_) => {
                tonic::Status::not_found(message)
            }
            HubError::AlreadyExists(_) => tonic::Status::already_exists(message),
            HubError::InvalidInput(_) => tonic::Status::invalid_argument(message),
            HubError::SessionInvalid => tonic::Status::unauthenticated(message),
            HubError::InvalidTransition(_)
            | HubError::ClusterDisabled(_)
            | HubError::Cancelled => tonic::Status::failed_precondition(message),
            HubError::ChannelFull => tonic::Status::resource_exhausted(message),
            HubError::AgentDisconnected | HubError::ChannelClosed => {
                tonic::Status::unavailable(message)
            }
            HubError::TimedOut => tonic::Status::deadline_exceeded(message),
            HubError::Internal(_) => tonic::Status::internal(message),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn not_found_reads_naturally() {
        let id = Uuid::new_v4();
        let e = HubError::NotFound(format!("cluster {id}"));
        assert!(e.to_string().contains("not found"));
        assert_eq!(e.http_status(), StatusCode::NOT_FOUND);
    }

    #[test]
    fn terminal_violations_are_conflicts() {
        let e = HubError::InvalidTransition("operation already finished".into());
        assert_eq!(e.http_status(), StatusCode::CONFLICT);
    }
}
