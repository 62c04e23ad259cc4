use thiserror::Error;

pub type TlResult<T> = Result<T, TlError>;

#[derive(Debug, Error)]
pub enum TlError {
    #[error("i/o failure: {0}")]
    Io(#[from] std::io::Error),

    #[error("json failure: {0}")]
    Json(#[from] serde_json::Error),

    #[error("storage error: {0}")]
    Storage(String),

    #[error("configuration error: {0}")]
    Config(String),

    #[error("invalid request: {0}")]
    InvalidRequest(String),

    #[error("malformed typing log at offset {offset}: {reason}")]
    MalformedLog { offset: usize, reason: String },

    #[error("typing log decompression failed: {0}")]
    DecompressionFailure(String),

    #[error("remote source rate limited `{endpoint}`{retry_suffix}")]
    RateLimited {
        endpoint: String,
        retry_suffix: String,
    },

    #[error("lock `{lock}` is held{holder_suffix}")]
    Busy { lock: String, holder_suffix: String },

    #[error("transport failure: {0}")]
    Transport(String),

    #[error(
        "consistency violation for {partition}/{account} #{sequence}: {details}"
    )]
    ConsistencyViolation {
        partition: String,
        account: String,
        sequence: u64,
        details: String,
    },
}

impl TlError {
    #[must_use]
    pub fn malformed(offset: usize, reason: impl Into<String>) -> Self {
        Self::MalformedLog {
            offset,
            reason: reason.into(),
        }
    }

    #[must_use]
    pub fn rate_limited(endpoint: impl Into<String>, retry_after_secs: Option<u64>) -> Self {
        let retry_suffix = match retry_after_secs {
            Some(secs) => format!("; retry after {secs}s"),
            None => String::new(),
        };
        Self::RateLimited {
            endpoint: endpoint.into(),
            retry_suffix,
        }
    }

    #[must_use]
    pub fn busy(lock: impl Into<String>, holder: Option<&str>) -> Self {
        let holder_suffix = match holder.map(str::trim) {
            Some(holder) if !holder.is_empty() => format!(" by {holder}"),
            _ => String::new(),
        };
        Self::Busy {
            lock: lock.into(),
            holder_suffix,
        }
    }

    /// `Busy` and `RateLimited` are ordinary outcomes the caller can act on by
    /// retrying later; everything else is an internal failure.
    #[must_use]
    pub const fn is_actionable(&self) -> bool {
        matches!(self, Self::Busy { .. } | Self::RateLimited { .. })
    }

    /// Text safe to show to an end user. Internal detail stays in `Display`.
    #[must_use]
    pub fn user_message(&self) -> String {
        match self {
            Self::Busy { .. } => {
                "Another import is in progress, please try again shortly".to_owned()
            }
            Self::RateLimited { .. } => {
                "The remote source is rate limiting requests; progress was saved and the \
                 import will resume where it left off"
                    .to_owned()
            }
            Self::InvalidRequest(reason) => format!("Invalid request: {reason}"),
            _ => "Something went wrong, no races were lost".to_owned(),
        }
    }

    /// Stable, unique, machine-readable error code for every variant.
    #[must_use]
    pub const fn error_code(&self) -> &'static str {
        match self {
            Self::Io(_) => "TL-IO",
            Self::Json(_) => "TL-JSON",
            Self::Storage(_) => "TL-STORAGE",
            Self::Config(_) => "TL-CONFIG",
            Self::InvalidRequest(_) => "TL-INVALID-REQUEST",
            Self::MalformedLog { .. } => "TL-MALFORMED-LOG",
            Self::DecompressionFailure(_) => "TL-DECOMPRESSION",
            Self::RateLimited { .. } => "TL-RATE-LIMITED",
            Self::Busy { .. } => "TL-BUSY",
            Self::Transport(_) => "TL-TRANSPORT",
            Self::ConsistencyViolation { .. } => "TL-CONSISTENCY",
        }
    }
}

impl From<rusqlite::Error> for TlError {
    fn from(error: rusqlite::Error) -> Self {
        Self::Storage(error.to_string())
    }
}

impl From<reqwest::Error> for TlError {
    fn from(error: reqwest::Error) -> Self {
        Self::Transport(error.to_string())
    }
}
