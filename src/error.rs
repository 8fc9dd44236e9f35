//! Error types and exit codes

use crate::inventory::Provider;
use thiserror::Error;

pub const EXIT_NO_SCOPE: i32 = 1;
pub const EXIT_USAGE: i32 = 2;
pub const EXIT_PROVIDER_AUTH: i32 = 3;
pub const EXIT_PROVIDER_API: i32 = 4;
pub const EXIT_SMC: i32 = 5;
pub const EXIT_PUBLISH: i32 = 6;

/// Inventory fetch errors
#[derive(Error, Debug)]
pub enum FetchError {
    #[error("authentication failed: {0}")]
    Auth(String),

    #[error("API error: {0}")]
    Api(String),

    #[error("{0} not found. Please install it and make sure it is in PATH")]
    ToolMissing(&'static str),

    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("JSON parse error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Security Management Center errors
#[derive(Error, Debug)]
pub enum SmcError {
    #[error("invalid SMC configuration: {0}")]
    Config(String),

    #[error("SMC login failed: {0}")]
    Login(String),

    #[error("SMC entry point not found: {0}")]
    MissingEntryPoint(String),

    #[error("SMC did not return a location for {0}")]
    MissingLocation(String),

    #[error("SMC returned {status} for {url}: {body}")]
    Status { status: u16, url: String, body: String },

    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("JSON parse error: {0}")]
    Json(#[from] serde_json::Error),
}

impl From<::config::ConfigError> for SmcError {
    fn from(e: ::config::ConfigError) -> Self {
        SmcError::Config(e.to_string())
    }
}

/// Run-level failure, one variant per exit code class
#[derive(Error, Debug)]
pub enum Error {
    #[error("no usable {provider} scope: {reason}")]
    NoScope { provider: Provider, reason: String },

    #[error("{provider} inventory: {source}")]
    Fetch {
        provider: Provider,
        #[source]
        source: FetchError,
    },

    #[error(transparent)]
    Smc(#[from] SmcError),

    #[error("{failed} of {total} group(s) failed to publish")]
    PublishFailed { failed: usize, total: usize },
}

impl Error {
    pub fn fetch(provider: Provider, source: FetchError) -> Self {
        Error::Fetch { provider, source }
    }

    pub fn exit_code(&self) -> i32 {
        match self {
            Error::NoScope { .. } => EXIT_NO_SCOPE,
            Error::Fetch {
                source: FetchError::Auth(_),
                ..
            } => EXIT_PROVIDER_AUTH,
            Error::Fetch { .. } => EXIT_PROVIDER_API,
            Error::Smc(_) => EXIT_SMC,
            Error::PublishFailed { .. } => EXIT_PUBLISH,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn exit_codes_are_distinct_per_class() {
        let codes = [
            Error::NoScope {
                provider: Provider::Azure,
                reason: "no subscriptions".into(),
            }
            .exit_code(),
            Error::fetch(Provider::Aws, FetchError::Auth("denied".into())).exit_code(),
            Error::fetch(Provider::Aws, FetchError::Api("throttled".into())).exit_code(),
            Error::Smc(SmcError::Login("bad key".into())).exit_code(),
            Error::PublishFailed { failed: 1, total: 3 }.exit_code(),
        ];

        assert_eq!(codes, [1, 3, 4, 5, 6]);
        assert!(!codes.contains(&EXIT_USAGE));
    }

    #[test]
    fn tool_missing_is_an_api_class_failure() {
        let err = Error::fetch(Provider::Gcp, FetchError::ToolMissing("gcloud"));
        assert_eq!(err.exit_code(), EXIT_PROVIDER_API);
        assert!(err.to_string().starts_with("gcp inventory: gcloud not found"));
    }
}
