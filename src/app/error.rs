use std::{io, net::SocketAddr, path::PathBuf};

#[derive(thiserror::Error, Debug)]
pub(crate) enum ConfigError {
    #[error("invalid {field}: {reason}")]
    InvalidField { field: &'static str, reason: String },

    #[error("failed to read config file {path:?}: {source}")]
    ReadFile {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("malformed config file {path:?}: {source}")]
    ParseFile {
        path: PathBuf,
        #[source]
        source: toml::de::Error,
    },
}

impl ConfigError {
    pub(crate) fn invalid(field: &'static str, reason: impl ToString) -> Self {
        Self::InvalidField {
            field,
            reason: reason.to_string(),
        }
    }

    #[cfg(test)]
    pub(crate) fn field(&self) -> Option<&'static str> {
        match self {
            Self::InvalidField { field, .. } => Some(*field),
            _ => None,
        }
    }
}

/// Fatal failure of one service. Any of these stops the whole process.
#[derive(thiserror::Error, Debug)]
pub(crate) enum ServiceError {
    #[error("{service} failed to bind on {addr}: {source}")]
    Bind {
        service: &'static str,
        addr: SocketAddr,
        #[source]
        source: io::Error,
    },

    #[error("{service} stopped serving: {source}")]
    Serve {
        service: &'static str,
        #[source]
        source: io::Error,
    },

    #[error("{service} panicked")]
    Panicked { service: &'static str },
}

impl ServiceError {
    pub(crate) fn service(&self) -> &'static str {
        match self {
            Self::Bind { service, .. } | Self::Serve { service, .. } | Self::Panicked { service } => {
                *service
            }
        }
    }
}

macro_rules! io_error {
    ($kind:ident, $msg:expr) => {
        return Err(::std::io::Error::new(::std::io::ErrorKind::$kind, $msg))
    };
    ($msg:expr) => {
        return Err(::std::io::Error::new(::std::io::ErrorKind::Other, $msg))
    };
}
pub(crate) use io_error;
