//! Error types shared across the daemon

use std::io;
use std::path::PathBuf;
use thiserror::Error;

/// Failure to load a backend descriptor. Any of these aborts startup.
#[derive(Debug, Error)]
pub enum DescriptorError {
    #[error("failed to read descriptor {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("descriptor {path} is missing required field '{field}'")]
    MissingField { path: PathBuf, field: &'static str },

    #[error("descriptor {path} has invalid backend.ip '{value}'")]
    InvalidAddress { path: PathBuf, value: String },
}

/// Failure while rendering a fragment for one entry
#[derive(Debug, Error)]
pub enum RenderError {
    /// A template precondition did not hold (e.g. a required file is absent)
    #[error("missing file: {}", .0.display())]
    MissingFile(PathBuf),

    /// Anything else the template engine reported
    #[error("template error: {0}")]
    Template(#[from] minijinja::Error),
}

impl RenderError {
    /// Expected, self-healing failures are logged without diagnostic detail
    pub fn is_precondition(&self) -> bool {
        matches!(self, RenderError::MissingFile(_))
    }
}

/// Failure reported by the proxy supervisor
#[derive(Debug, Error)]
pub enum ProxyError {
    #[error("failed to spawn proxy '{binary}': {source}")]
    Spawn {
        binary: String,
        #[source]
        source: io::Error,
    },

    #[error("failed to write {path}: {source}")]
    Write {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("failed to persist {path}: {source}")]
    Persist {
        path: PathBuf,
        #[source]
        source: tempfile::PersistError,
    },

    #[error("failed to prepare include file {path}: {source}")]
    IncludeFile {
        path: PathBuf,
        #[source]
        source: Box<ProxyError>,
    },

    #[error("failed to run config test: {0}")]
    ValidateSpawn(#[source] io::Error),

    #[error("config test failed (exit code {code:?}): {stderr}")]
    ValidationFailed { code: Option<i32>, stderr: String },

    #[error("failed to signal proxy: {0}")]
    Signal(#[source] io::Error),

    #[error("proxy is not running")]
    NotRunning,
}

impl ProxyError {
    /// Fatal errors stop the daemon; everything else waits for the next change
    pub fn is_fatal(&self) -> bool {
        matches!(self, ProxyError::Spawn { .. } | ProxyError::IncludeFile { .. })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_render_error_classification() {
        let missing = RenderError::MissingFile(PathBuf::from("/etc/ssl/site.pem"));
        assert!(missing.is_precondition());
        assert_eq!(missing.to_string(), "missing file: /etc/ssl/site.pem");

        let other = RenderError::Template(minijinja::Error::new(
            minijinja::ErrorKind::TemplateNotFound,
            "basic.tmpl",
        ));
        assert!(!other.is_precondition());
    }

    #[test]
    fn test_proxy_error_classification() {
        let spawn = ProxyError::Spawn {
            binary: "nginx".to_string(),
            source: io::Error::new(io::ErrorKind::NotFound, "no such file"),
        };
        assert!(spawn.is_fatal());

        let validation = ProxyError::ValidationFailed {
            code: Some(1),
            stderr: "unexpected \"}\"".to_string(),
        };
        assert!(!validation.is_fatal());
        assert!(!ProxyError::NotRunning.is_fatal());

        let write = ProxyError::Write {
            path: PathBuf::from("/etc/nginx/vhosts.d/svc-a.conf"),
            source: io::Error::new(io::ErrorKind::PermissionDenied, "denied"),
        };
        assert!(!write.is_fatal());

        let include = ProxyError::IncludeFile {
            path: PathBuf::from("/etc/nginx/http.d/ingress-include.conf"),
            source: Box::new(write),
        };
        assert!(include.is_fatal());
    }

    #[test]
    fn test_descriptor_error_message() {
        let err = DescriptorError::MissingField {
            path: PathBuf::from("/config/svc-a.conf"),
            field: "backend.host",
        };
        assert_eq!(
            err.to_string(),
            "descriptor /config/svc-a.conf is missing required field 'backend.host'"
        );
    }
}
