use thiserror::Error;

/// Failures that end a tunnel session. Every variant sends the worker back
/// through the retry delay to a fresh connect.
#[derive(Debug, Error)]
pub enum SessionError {
    #[error("connect to broker: {0:#}")]
    Connect(anyhow::Error),
    #[error("authenticate: {0:#}")]
    Auth(anyhow::Error),
    #[error("register tunnel: {0:#}")]
    Register(anyhow::Error),
    #[error("accept stream: {0:#}")]
    Accept(anyhow::Error),
}

impl SessionError {
    /// Short label shown in the status line in front of the cause.
    pub fn label(&self) -> &'static str {
        match self {
            SessionError::Connect(_) => "create conn err",
            SessionError::Auth(_) => "auth err",
            SessionError::Register(_) => "prepare err",
            SessionError::Accept(_) => "stream accept err",
        }
    }

    pub fn cause(&self) -> &anyhow::Error {
        match self {
            SessionError::Connect(e)
            | SessionError::Auth(e)
            | SessionError::Register(e)
            | SessionError::Accept(e) => e,
        }
    }
}

/// Failures confined to a single relayed stream. The session keeps serving.
#[derive(Debug, Error)]
pub enum StreamError {
    #[error("dial local {addr}: {source}")]
    Dial {
        addr: std::net::SocketAddr,
        #[source]
        source: std::io::Error,
    },
    #[error("{0}")]
    Relay(#[from] std::io::Error),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn labels_match_session_phase() {
        let e = SessionError::Connect(anyhow::anyhow!("refused"));
        assert_eq!(e.label(), "create conn err");
        assert_eq!(e.cause().to_string(), "refused");

        assert_eq!(SessionError::Auth(anyhow::anyhow!("x")).label(), "auth err");
        assert_eq!(
            SessionError::Register(anyhow::anyhow!("x")).label(),
            "prepare err"
        );
        assert_eq!(
            SessionError::Accept(anyhow::anyhow!("x")).label(),
            "stream accept err"
        );
    }

    #[test]
    fn display_keeps_context_chain() {
        let cause = anyhow::anyhow!("connection refused").context("dial 10.0.0.1:4100");
        let e = SessionError::Connect(cause);
        assert_eq!(
            e.to_string(),
            "connect to broker: dial 10.0.0.1:4100: connection refused"
        );
    }
}
