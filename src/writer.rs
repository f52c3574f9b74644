//! The only path generated material takes to storage.
//!
//! Invariants enforced before anything reaches the [`Filesystem`]:
//! key material and confidential files are owner-only, shared scratch
//! directories are `1777`, and no path is written twice in one run.

use std::collections::BTreeSet;
use std::io;
use std::path::Path;

use tracing::{debug, info};

use crate::error::{Error, Result};
use crate::filesystem::{FileInfo, Filesystem, Mode};

/// Sensitivity of an artifact's contents.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ArtifactClass {
    Public,
    /// Private keys, and anything embedding one.
    KeyMaterial,
    /// Passwords and cloud credentials.
    Confidential,
}

/// A file staged for writing.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Artifact {
    pub path: String,
    pub contents: Vec<u8>,
    pub info: FileInfo,
    pub class: ArtifactClass,
}

impl Artifact {
    pub fn new(path: impl Into<String>, contents: Vec<u8>, info: FileInfo, class: ArtifactClass) -> Self {
        Artifact {
            path: path.into(),
            contents,
            info,
            class,
        }
    }

    pub fn certificate(path: impl Into<String>, pem: Vec<u8>) -> Self {
        Self::new(path, pem, FileInfo::root(0o644), ArtifactClass::Public)
    }

    pub fn private_key(path: impl Into<String>, pem: Vec<u8>) -> Self {
        Self::new(path, pem, FileInfo::root(0o600), ArtifactClass::KeyMaterial)
    }

    pub fn kubeconfig(path: impl Into<String>, yaml: Vec<u8>) -> Self {
        Self::new(path, yaml, FileInfo::root(0o600), ArtifactClass::KeyMaterial)
    }

    /// Whether the artifact may only be readable by its owner.
    ///
    /// Key-like paths count even when the caller mislabelled the class.
    pub fn requires_owner_only(&self) -> bool {
        self.class != ArtifactClass::Public || is_key_path(&self.path)
    }
}

/// A directory staged for creation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DirectoryArtifact {
    pub path: String,
    pub info: FileInfo,
}

fn is_key_path(path: &str) -> bool {
    let private_key = path.ends_with(".key") && !path.ends_with(".public.key");
    private_key || path.ends_with(".kubeconfig")
}

/// Shared scratch directories, created world-writable with the sticky bit.
pub fn is_scratch_directory(path: &str) -> bool {
    Path::new(path).file_name().map_or(false, |name| name == "tmp")
}

const GROUP_OTHER_BITS: u32 = 0o077;
const SCRATCH_MODE: u32 = 0o1777;

/// Accepts only canonical relative paths, so each file has exactly one spelling.
fn check_path(path: &str) -> Result<()> {
    let canonical = path
        .split('/')
        .all(|segment| !matches!(segment, "" | "." | ".."));
    if canonical {
        Ok(())
    } else {
        Err(Error::Write {
            path: path.to_owned(),
            source: io::Error::new(io::ErrorKind::InvalidInput, "artifact paths must be canonical and relative"),
        })
    }
}

/// Applies the permission policy and hands artifacts to a [`Filesystem`].
pub struct SecureWriter<'a> {
    fs: &'a mut dyn Filesystem,
    written: BTreeSet<String>,
}

impl<'a> SecureWriter<'a> {
    pub fn new(fs: &'a mut dyn Filesystem) -> Self {
        SecureWriter {
            fs,
            written: BTreeSet::new(),
        }
    }

    /// Paths written so far, files and directories alike.
    pub fn written(&self) -> impl Iterator<Item = &str> {
        self.written.iter().map(String::as_str)
    }

    fn claim(&self, path: &str) -> Result<()> {
        check_path(path)?;
        if self.written.contains(path) {
            return Err(Error::DuplicateArtifact(path.to_owned()));
        }
        Ok(())
    }

    pub fn write(&mut self, artifact: &Artifact) -> Result<()> {
        self.claim(&artifact.path)?;

        if artifact.requires_owner_only() && artifact.info.mode & GROUP_OTHER_BITS != 0 {
            return Err(Error::InsecurePermission {
                path: artifact.path.clone(),
                mode: artifact.info.mode,
            });
        }

        self.fs
            .write_file(&artifact.path, &artifact.contents, &artifact.info)
            .map_err(|source| Error::Write {
                path: artifact.path.clone(),
                source,
            })?;
        self.written.insert(artifact.path.clone());

        info!(
            path = %artifact.path,
            owner = %artifact.info.owner,
            group = %artifact.info.group,
            mode = %Mode(artifact.info.mode),
            "wrote artifact"
        );
        Ok(())
    }

    pub fn mkdir(&mut self, dir: &DirectoryArtifact) -> Result<()> {
        self.claim(&dir.path)?;

        let mut info = dir.info.clone();
        if is_scratch_directory(&dir.path) && info.mode != SCRATCH_MODE {
            debug!(path = %dir.path, requested = %Mode(info.mode), "forcing scratch directory mode");
            info.mode = SCRATCH_MODE;
        }

        self.fs
            .make_directory(&dir.path, &info)
            .map_err(|source| Error::Write {
                path: dir.path.clone(),
                source,
            })?;
        self.written.insert(dir.path.clone());

        info!(path = %dir.path, mode = %Mode(info.mode), "created directory");
        Ok(())
    }
}
