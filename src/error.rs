use std::io;
use std::path::PathBuf;

use openssl::error::ErrorStack;
use thiserror::Error;

use crate::provision::Phase;

/// Errors produced while issuing credentials or writing artifacts.
#[derive(Debug, Error)]
pub enum Error {
    /// RSA key generation failed
    #[error("failed to generate key for {role:?}")]
    KeyGeneration {
        role: String,
        #[source]
        source: ErrorStack,
    },

    /// Building or signing a certificate failed
    #[error("failed to sign certificate for {subject:?}")]
    Signing {
        subject: String,
        #[source]
        source: ErrorStack,
    },

    /// The catalog references a signer that has not been issued yet.
    ///
    /// This is a catalog definition bug, never a runtime condition.
    #[error("identity {role:?} is signed by {signer:?}, which has not been materialized")]
    UnknownSigner { role: String, signer: String },

    /// The signer exists but is not a self-signed authority
    #[error("identity {role:?} is signed by {signer:?}, which is not a root CA")]
    SignerNotCa { role: String, signer: String },

    #[error("identity {0:?} is declared more than once")]
    DuplicateIdentity(String),

    #[error("identity {0:?} has not been materialized")]
    MissingIdentity(String),

    #[error("template {0:?} not found")]
    TemplateNotFound(String),

    #[error("failed to render template {name:?}")]
    Render {
        name: String,
        #[source]
        source: minijinja::Error,
    },

    /// Key material requested with group/other permission bits
    #[error("refusing to write {path:?} with mode {mode:04o}: key material must be owner-only")]
    InsecurePermission { path: String, mode: u32 },

    #[error("artifact {0:?} was already written during this run")]
    DuplicateArtifact(String),

    #[error("failed to write {path:?}")]
    Write {
        path: String,
        #[source]
        source: io::Error,
    },

    #[error("failed to encode {what}")]
    Encoding {
        what: String,
        #[source]
        source: ErrorStack,
    },

    #[error("failed to serialize kubeconfig {name:?}")]
    Kubeconfig {
        name: String,
        #[source]
        source: serde_yaml::Error,
    },

    #[error("invalid cluster properties in {path:?}: {reason}")]
    Config { path: PathBuf, reason: String },

    #[error("{phase} failed")]
    Phase {
        phase: Phase,
        #[source]
        source: Box<Error>,
    },
}

impl Error {
    pub(crate) fn in_phase(self, phase: Phase) -> Self {
        Error::Phase {
            phase,
            source: Box::new(self),
        }
    }

    /// Returns the underlying error with any phase context stripped.
    pub fn root(&self) -> &Error {
        match self {
            Error::Phase { source, .. } => source.root(),
            other => other,
        }
    }

    /// Returns the phase that failed, if this error came out of a pipeline run.
    pub fn phase(&self) -> Option<Phase> {
        match self {
            Error::Phase { phase, .. } => Some(*phase),
            _ => None,
        }
    }
}

pub type Result<T> = std::result::Result<T, Error>;
