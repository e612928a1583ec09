use thiserror::Error;

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum ConclaveError {
    #[error("http error: {0}")]
    Http(String),
    #[error("unexpected response: {0}")]
    Protocol(String),
    #[error("invalid token")]
    InvalidToken,
    #[error("no such node: {0}")]
    NoSuchNode(String),
    #[error("no such conference: {0}")]
    NoSuchConference(String),
    #[error("pin required (guest pin required: {guest_pin_required})")]
    RequiredPin { guest_pin_required: bool },
    #[error("invalid pin")]
    InvalidPin,
    #[error("single sign-on required ({} identity providers)", idps.len())]
    RequiredSso { idps: Vec<String> },
    #[error("single sign-on redirect to {url}")]
    SsoRedirect { url: String },
    #[error("no active call")]
    NoActiveCall,
    #[error("no credentials for ufrag '{0}'")]
    UnknownUfrag(String),
    #[error("invalid candidate: {0}")]
    InvalidCandidate(String),
    #[error("message is empty")]
    EmptyMessage,
    #[error("media error: {0}")]
    Media(String),
    #[error("configuration error: {0}")]
    Config(String),
    #[error("session closed")]
    Closed,
}

impl ConclaveError {
    /// Whether a retry of the same request may succeed.
    pub fn is_transient(&self) -> bool {
        matches!(self, ConclaveError::Http(_))
    }
}
