//! Bootstrap PKI for a cluster master and its nodes.
//!
//! [`Provisioner::prepare`] issues every certificate in the identity catalog,
//! builds the kubeconfig access bundles and renders the static configuration
//! files, all in memory. The master and node flows then write that material
//! through a [`SecureWriter`] to any [`Filesystem`].

pub mod catalog;
pub mod cert;
pub mod config;
pub mod error;
pub mod filesystem;
pub mod kubeconfig;
pub mod provision;
pub mod serial;
pub mod template;
pub mod writer;

pub use catalog::{Identities, IdentityDescriptor, DEFAULT_CATALOG};
pub use cert::{CertAndKey, CertificateAuthority, KeySettings, Profile, San, Subject};
pub use config::ClusterProperties;
pub use error::{Error, Result};
pub use filesystem::{Entry, FileInfo, Filesystem, LocalFilesystem, MemoryFilesystem, TarGzFilesystem};
pub use kubeconfig::AccessBundle;
pub use provision::{Materialized, Phase, Provisioner, MASTER_FLOW, NODE_FLOW};
pub use template::{EmbeddedTemplates, MemoryTemplates, TemplateSource};
pub use writer::{Artifact, ArtifactClass, SecureWriter};
