//! Destinations artifacts can be written to.
//!
//! Paths handed to a [`Filesystem`] are logical, slash-separated and relative;
//! each implementation decides where they end up.

use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::fs::{self, Permissions};
use std::io::{self, Write};
use std::os::unix::fs::PermissionsExt;
use std::path::{Component, Path, PathBuf};
use std::time::{SystemTime, UNIX_EPOCH};

use flate2::write::GzEncoder;
use flate2::Compression;
use tempfile::NamedTempFile;
use uzers::{get_group_by_name, get_user_by_name};

/// Owner, group and POSIX mode of a written file or directory.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FileInfo {
    pub owner: String,
    pub group: String,
    pub mode: u32,
}

impl FileInfo {
    pub fn new(owner: impl Into<String>, group: impl Into<String>, mode: u32) -> Self {
        FileInfo {
            owner: owner.into(),
            group: group.into(),
            mode,
        }
    }

    pub fn root(mode: u32) -> Self {
        Self::new("root", "root", mode)
    }
}

/// Displays a mode the way `ls`-adjacent tools print it, e.g. `0600`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Mode(pub u32);

impl fmt::Display for Mode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:04o}", self.0)
    }
}

/// Storage collaborator used by the artifact writer.
pub trait Filesystem {
    fn write_file(&mut self, path: &str, contents: &[u8], info: &FileInfo) -> io::Result<()>;

    fn make_directory(&mut self, path: &str, info: &FileInfo) -> io::Result<()>;
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Entry {
    File { contents: Vec<u8>, info: FileInfo },
    Directory { info: FileInfo },
}

impl Entry {
    pub fn info(&self) -> &FileInfo {
        match self {
            Entry::File { info, .. } | Entry::Directory { info } => info,
        }
    }
}

/// Keeps everything in memory. Useful for tests and dry runs.
#[derive(Debug, Default)]
pub struct MemoryFilesystem {
    entries: BTreeMap<String, Entry>,
    fail_on: Option<String>,
}

impl MemoryFilesystem {
    pub fn new() -> Self {
        Self::default()
    }

    /// Makes writes of `path` fail, to exercise error handling.
    pub fn fail_on(mut self, path: impl Into<String>) -> Self {
        self.fail_on = Some(path.into());
        self
    }

    pub fn entries(&self) -> &BTreeMap<String, Entry> {
        &self.entries
    }

    pub fn get(&self, path: &str) -> Option<&Entry> {
        self.entries.get(path)
    }

    pub fn paths(&self) -> BTreeSet<String> {
        self.entries.keys().cloned().collect()
    }

    fn record(&mut self, path: &str, entry: Entry) -> io::Result<()> {
        if self.fail_on.as_deref() == Some(path) {
            return Err(io::Error::new(io::ErrorKind::Other, "injected write failure"));
        }
        self.entries.insert(path.to_owned(), entry);
        Ok(())
    }
}

impl Filesystem for MemoryFilesystem {
    fn write_file(&mut self, path: &str, contents: &[u8], info: &FileInfo) -> io::Result<()> {
        self.record(
            path,
            Entry::File {
                contents: contents.to_vec(),
                info: info.clone(),
            },
        )
    }

    fn make_directory(&mut self, path: &str, info: &FileInfo) -> io::Result<()> {
        self.record(path, Entry::Directory { info: info.clone() })
    }
}

/// Streams artifacts into a gzip-compressed tarball, ownership and modes in the headers.
pub struct TarGzFilesystem<W: Write> {
    archive: tar::Builder<GzEncoder<W>>,
    mtime: u64,
}

impl<W: Write> TarGzFilesystem<W> {
    pub fn new(writer: W) -> Self {
        let mtime = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_secs())
            .unwrap_or_default();
        TarGzFilesystem {
            archive: tar::Builder::new(GzEncoder::new(writer, Compression::default())),
            mtime,
        }
    }

    /// Writes the tar trailer, flushes the gzip stream and hands back the writer.
    pub fn finish(self) -> io::Result<W> {
        self.archive.into_inner()?.finish()
    }

    fn header(&self, entry_type: tar::EntryType, info: &FileInfo, size: u64) -> io::Result<tar::Header> {
        let mut header = tar::Header::new_gnu();
        header.set_entry_type(entry_type);
        header.set_username(&info.owner)?;
        header.set_groupname(&info.group)?;
        // Names are authoritative; ids are only filled in when this host knows them.
        if let Ok(uid) = resolve_uid(&info.owner) {
            header.set_uid(uid.into());
        }
        if let Ok(gid) = resolve_gid(&info.group) {
            header.set_gid(gid.into());
        }
        header.set_mode(info.mode);
        header.set_size(size);
        header.set_mtime(self.mtime);
        Ok(header)
    }
}

impl<W: Write> Filesystem for TarGzFilesystem<W> {
    fn write_file(&mut self, path: &str, contents: &[u8], info: &FileInfo) -> io::Result<()> {
        let mut header = self.header(tar::EntryType::Regular, info, contents.len() as u64)?;
        self.archive.append_data(&mut header, path, contents)
    }

    fn make_directory(&mut self, path: &str, info: &FileInfo) -> io::Result<()> {
        let mut header = self.header(tar::EntryType::Directory, info, 0)?;
        self.archive.append_data(&mut header, path, io::empty())
    }
}

/// Writes below a root directory on the local disk.
///
/// Files are staged in a temporary file next to the destination, given their
/// final mode (and ownership, when enabled) before any content is written,
/// then renamed into place. Ownership is only applied when enabled, since
/// changing it generally needs root.
#[derive(Debug, Clone)]
pub struct LocalFilesystem {
    root: PathBuf,
    apply_ownership: bool,
}

impl LocalFilesystem {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        LocalFilesystem {
            root: root.into(),
            apply_ownership: false,
        }
    }

    pub fn with_ownership(mut self, apply: bool) -> Self {
        self.apply_ownership = apply;
        self
    }

    fn resolve(&self, path: &str) -> io::Result<PathBuf> {
        let relative = Path::new(path);
        if !relative.components().all(|c| matches!(c, Component::Normal(_))) {
            return Err(io::Error::new(
                io::ErrorKind::InvalidInput,
                format!("{path:?} is not a plain relative path"),
            ));
        }
        Ok(self.root.join(relative))
    }

    fn apply_info(&self, dest: &Path, info: &FileInfo) -> io::Result<()> {
        if self.apply_ownership {
            let uid = resolve_uid(&info.owner)?;
            let gid = resolve_gid(&info.group)?;
            std::os::unix::fs::chown(dest, Some(uid), Some(gid))?;
        }
        // Staged files start at 0600 and new directories follow the umask.
        fs::set_permissions(dest, Permissions::from_mode(info.mode))
    }
}

impl Filesystem for LocalFilesystem {
    fn write_file(&mut self, path: &str, contents: &[u8], info: &FileInfo) -> io::Result<()> {
        let dest = self.resolve(path)?;
        let parent = dest.parent().unwrap_or(self.root.as_path());
        fs::create_dir_all(parent)?;

        let mut staged = NamedTempFile::new_in(parent)?;
        self.apply_info(staged.path(), info)?;
        staged.write_all(contents)?;
        staged.as_file().sync_all()?;
        staged.persist(&dest).map_err(|e| e.error)?;
        Ok(())
    }

    fn make_directory(&mut self, path: &str, info: &FileInfo) -> io::Result<()> {
        let dest = self.resolve(path)?;
        fs::create_dir_all(&dest)?;
        if !fs::symlink_metadata(&dest)?.is_dir() {
            return Err(io::Error::new(
                io::ErrorKind::AlreadyExists,
                format!("{} exists and is not a directory", dest.display()),
            ));
        }
        self.apply_info(&dest, info)
    }
}

fn not_found(kind: &str, name: &str) -> io::Error {
    io::Error::new(io::ErrorKind::NotFound, format!("no such {kind}: {name:?}"))
}

/// Numeric names are taken as ids; anything else goes through the system user database.
fn resolve_uid(name: &str) -> io::Result<u32> {
    if let Ok(id) = name.parse() {
        return Ok(id);
    }
    get_user_by_name(name)
        .map(|user| user.uid())
        .ok_or_else(|| not_found("user", name))
}

fn resolve_gid(name: &str) -> io::Result<u32> {
    if let Ok(id) = name.parse() {
        return Ok(id);
    }
    get_group_by_name(name)
        .map(|group| group.gid())
        .ok_or_else(|| not_found("group", name))
}
