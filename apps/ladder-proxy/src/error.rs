use http::StatusCode;
use thiserror::Error;

/// Failures that abort a single proxied request.
///
/// None of these are fatal to the process; the server maps each kind to a
/// status code with [`LadderError::status_code`].
#[derive(Debug, Error)]
pub enum LadderError {
    #[error("error parsing URL '{input}': {reason}")]
    UrlParse { input: String, reason: String },
    #[error("cannot resolve relative path '{path}' {reason}")]
    UnresolvableRelativePath { path: String, reason: String },
    #[error("domain not allowed: {0}")]
    DomainNotAllowed(String),
    #[error("invalid rule pattern '{pattern}': {source}")]
    RuleRegex {
        pattern: String,
        #[source]
        source: regex::Error,
    },
    #[error("fetch failed: {0}")]
    Fetch(String),
    #[error("error reading response body: {0}")]
    BodyRead(String),
    #[error("failed to load ruleset: {0}")]
    RulesetLoad(String),
    #[error(transparent)]
    Io(#[from] std::io::Error),
}

impl LadderError {
    pub(crate) fn url_parse(input: impl Into<String>, reason: impl ToString) -> Self {
        LadderError::UrlParse {
            input: input.into(),
            reason: reason.to_string(),
        }
    }

    pub(crate) fn unresolvable(path: impl Into<String>, reason: impl Into<String>) -> Self {
        LadderError::UnresolvableRelativePath {
            path: path.into(),
            reason: reason.into(),
        }
    }

    pub fn status_code(&self) -> StatusCode {
        match self {
            LadderError::UrlParse { .. } | LadderError::UnresolvableRelativePath { .. } => {
                StatusCode::BAD_REQUEST
            }
            LadderError::DomainNotAllowed(_) => StatusCode::FORBIDDEN,
            LadderError::Fetch(_) | LadderError::BodyRead(_) => StatusCode::BAD_GATEWAY,
            LadderError::RuleRegex { .. } | LadderError::RulesetLoad(_) | LadderError::Io(_) => {
                StatusCode::INTERNAL_SERVER_ERROR
            }
        }
    }
}

pub type LadderResult<T> = Result<T, LadderError>;
