use thiserror::Error;
use uuid::Uuid;

#[derive(Error, Debug)]
pub enum Error {
    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    #[error("{0} not found")]
    NotFound(String),

    #[error("session {0} is not active")]
    SessionInactive(String),

    #[error("{0} already exists")]
    Duplicate(String),

    #[error("request {0} is already terminal")]
    AlreadyTerminal(Uuid),

    #[error("chat transport error: {0}")]
    Transport(String),

    #[error("pending request ceiling reached ({0})")]
    Overloaded(usize),

    #[error("wait budget elapsed before the request became terminal")]
    WaitElapsed,

    #[error("storage error: {0}")]
    Store(String),

    #[error("JSON serialization/deserialization failed: {0}")]
    Json(#[from] serde_json::Error),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn error_display_messages() {
        let err = Error::NotFound("session s1".into());
        assert_eq!(err.to_string(), "session s1 not found");

        let err = Error::SessionInactive("s1".into());
        assert_eq!(err.to_string(), "session s1 is not active");

        let id = Uuid::nil();
        let err = Error::AlreadyTerminal(id);
        assert_eq!(
            err.to_string(),
            format!("request {id} is already terminal")
        );

        let err = Error::Overloaded(100);
        assert_eq!(err.to_string(), "pending request ceiling reached (100)");
    }

    #[test]
    fn json_error_converts() {
        let parse_err = serde_json::from_str::<serde_json::Value>("{not json").unwrap_err();
        let err: Error = parse_err.into();
        assert!(err.to_string().contains("JSON"));
    }
}
