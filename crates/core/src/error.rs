/// Result alias that carries the custom [`RemixError`] type.
pub type Result<T> = std::result::Result<T, RemixError>;

/// Common error type for the core crate.
#[derive(Debug, thiserror::Error)]
pub enum RemixError {
    /// Free-form failure surfaced to the application as a readable message.
    #[error("{0}")]
    Message(String),
    /// Wrapper around standard IO errors.
    #[error("{0}")]
    Io(#[from] std::io::Error),
    /// Analysis, config or beatmap JSON could not be parsed.
    #[error("{0}")]
    Json(#[from] serde_json::Error),
    /// The per-song analysis cannot drive a remix (e.g. it has no beats).
    #[error("invalid analysis: {0}")]
    InvalidAnalysis(String),
    /// A beat did not align to exactly one beat of the song's tempo.
    #[error("beat {index} should span exactly one beat but spans {beats}")]
    BeatAlignment { index: usize, beats: f64 },
    /// The walker stepped past the final beat without branching.
    #[error("walk ran past the final beat after beat {index}")]
    WalkExhausted { index: usize },
    /// A shared lock was poisoned by a panicking thread.
    #[error("{0} has been poisoned")]
    Poisoned(&'static str),
    /// A loop thread panicked instead of returning its state.
    #[error("{0} thread panicked")]
    WorkerPanicked(&'static str),
    /// The host audio or timeline backend rejected a request.
    #[error("host error: {0}")]
    Host(String),
}

impl RemixError {
    /// Creates a new error that simply wraps the provided message.
    pub fn msg<T: Into<String>>(msg: T) -> Self {
        Self::Message(msg.into())
    }

    /// Creates an [`RemixError::InvalidAnalysis`] error.
    pub fn invalid_analysis<T: Into<String>>(msg: T) -> Self {
        Self::InvalidAnalysis(msg.into())
    }

    /// Creates an [`RemixError::Host`] error.
    pub fn host<T: Into<String>>(msg: T) -> Self {
        Self::Host(msg.into())
    }
}

impl From<&str> for RemixError {
    fn from(value: &str) -> Self {
        Self::msg(value)
    }
}

impl From<String> for RemixError {
    fn from(value: String) -> Self {
        Self::Message(value)
    }
}
