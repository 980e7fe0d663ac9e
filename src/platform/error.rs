use std::fmt;

/// Errors that can occur while delivering a notification or talking to a
/// platform API.
#[derive(Debug, thiserror::Error)]
pub enum NotifyError {
    #[error("unsupported destination scheme: {0}")]
    UnsupportedScheme(String),

    #[error("problem parsing destination: {0}")]
    Destination(String),

    #[error("configuration error: {0}")]
    Config(String),

    /// The endpoint could not be reached at all (connect, DNS, timeout).
    #[error("endpoint unreachable: {0}")]
    Unreachable(#[source] reqwest::Error),

    /// The endpoint answered, but not with something we accept.
    #[error(transparent)]
    BadResponse(#[from] BadResponse),

    #[error("operation cancelled")]
    Cancelled,

    #[error("pull and push update modes are mutually exclusive")]
    ModeConflict,

    #[error("failed to decode provided update batch: {0}")]
    InvalidUpdate(String),

    #[error("smtp delivery failed: {0}")]
    Smtp(String),
}

impl NotifyError {
    pub fn is_unreachable(&self) -> bool {
        matches!(self, NotifyError::Unreachable(_))
    }

    pub fn is_bad_response(&self) -> bool {
        matches!(self, NotifyError::BadResponse(_))
    }

    pub fn is_cancelled(&self) -> bool {
        matches!(self, NotifyError::Cancelled)
    }
}

/// Protocol-level failures: the remote side answered badly.
#[derive(Debug, thiserror::Error)]
pub enum BadResponse {
    #[error("unexpected API status code {status}{}", Described(.description))]
    Status {
        status: u16,
        description: Option<String>,
    },

    #[error("failed to decode json response: {0}")]
    Decode(String),

    #[error("received empty result")]
    EmptyResult,
}

struct Described<'a>(&'a Option<String>);

impl fmt::Display for Described<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.0 {
            Some(description) if !description.is_empty() => {
                write!(f, ", error: {:?}", description)
            }
            _ => Ok(()),
        }
    }
}
