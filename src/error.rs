use miette::Diagnostic;
use thiserror::Error;

#[derive(Debug, Error, Diagnostic)]
pub enum EngineError {
    #[error("failed to load config from {path}")]
    ConfigLoad {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to parse config from {path}: {message}")]
    ConfigParse { path: String, message: String },

    #[error("validation error: {message}")]
    Validation { message: String },

    #[error("{context}")]
    Io {
        context: String,
        #[source]
        source: std::io::Error,
    },

    #[error("fetch failed: {message}")]
    Fetch {
        message: String,
        #[source]
        source: Box<dyn std::error::Error + Send + Sync>,
    },

    #[error("bad response from {url}: {message}")]
    ServerResponse { url: String, message: String },

    #[error("ticket store {path}: {message}")]
    #[diagnostic(help("the store file may be corrupt; move it aside to start with an empty store"))]
    TicketStore { path: String, message: String },

    #[error("no ticket for product '{product_id}'")]
    TicketNotFound { product_id: String },

    #[error("disk image {path}: {message}")]
    DiskImage { path: String, message: String },

    #[error("{context}: background task failed")]
    Task {
        context: String,
        #[source]
        source: tokio::task::JoinError,
    },

    #[error("failed to run {command}")]
    Command {
        command: String,
        #[source]
        source: std::io::Error,
    },
}

impl EngineError {
    pub(crate) fn io(context: impl Into<String>, source: std::io::Error) -> Self {
        EngineError::Io {
            context: context.into(),
            source,
        }
    }
}
