//! Fatal startup conditions. None of these are retried: the supervisor logs
//! them and returns before the scheduler enters its run state.

use std::path::PathBuf;

#[derive(thiserror::Error, Debug)]
pub enum StartupError {
    #[error("Could not start the server on {addr}: {source}")]
    Bind {
        addr: String,
        #[source]
        source: std::io::Error,
    },

    #[error("SSL is enabled but no {0} is configured")]
    TlsNotConfigured(&'static str),

    #[error("Could not find the SSL certfile or certkey: {}", .0.display())]
    TlsMaterialMissing(PathBuf),

    #[error("SSL error: {0}")]
    TlsInvalid(String),

    #[error("SSL mode is not supported on Windows")]
    TlsUnsupported,

    #[error("Could not install signal handlers: {0}")]
    Signals(#[source] std::io::Error),

    #[error("Could not build the async runtime: {0}")]
    Runtime(#[source] std::io::Error),
}

impl StartupError {
    pub fn is_tls(&self) -> bool {
        matches!(
            self,
            Self::TlsNotConfigured(_) | Self::TlsMaterialMissing(_) | Self::TlsInvalid(_) | Self::TlsUnsupported
        )
    }
}
