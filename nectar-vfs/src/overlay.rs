use std::collections::BTreeMap;
use std::fs::{self, File, OpenOptions};
use std::io::{self, Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, SystemTime};

use tracing::debug;

use crate::error::{Result, VfsError};
use crate::file::ZipEntry;
use crate::node::{clean_path, Metadata, DIR_SIZE};
#[cfg(not(unix))]
use crate::node::{S_IFDIR, S_IFREG};
use crate::zipfs::ZipFs;

/// Open disposition for [`OverlayFs::open_with`], mirroring the subset of
/// POSIX open flags the SFTP and SCP layers need.
#[derive(Clone, Copy, Debug, Default)]
pub struct OpenMode {
    pub read: bool,
    pub write: bool,
    pub append: bool,
    pub create: bool,
    pub create_new: bool,
    pub truncate: bool,
}

impl OpenMode {
    pub fn read_only() -> Self {
        OpenMode {
            read: true,
            ..Default::default()
        }
    }

    pub fn create_truncate() -> Self {
        OpenMode {
            write: true,
            create: true,
            truncate: true,
            ..Default::default()
        }
    }

    fn is_write(&self) -> bool {
        self.write || self.append || self.create || self.create_new || self.truncate
    }
}

/// Copy-on-write composite: an immutable zip-backed lower tree under a
/// scratch directory on the host. Reads prefer the upper layer; writes only
/// ever touch it.
pub struct OverlayFs {
    lower: Arc<ZipFs>,
    upper: PathBuf,
}

impl OverlayFs {
    pub fn new<P: Into<PathBuf>>(lower: Arc<ZipFs>, upper: P) -> Result<Self> {
        let upper = upper.into();
        fs::create_dir_all(&upper)?;
        Ok(OverlayFs { lower, upper })
    }

    pub fn lower(&self) -> &Arc<ZipFs> {
        &self.lower
    }

    /// Map a virtual absolute path into the scratch directory. The path is
    /// lexically cleaned first, so `..` can never escape the scratch root.
    fn upper_path(&self, path: &str) -> PathBuf {
        let clean = clean_path("/", path);
        self.upper.join(clean.trim_start_matches('/'))
    }

    fn upper_lstat(&self, path: &str) -> Option<Metadata> {
        let host = self.upper_path(path);
        let meta = fs::symlink_metadata(&host).ok()?;
        Some(host_metadata(&host, &meta))
    }

    pub fn stat(&self, path: &str) -> Result<Metadata> {
        let path = clean_path("/", path);
        if let Some(meta) = self.upper_lstat(&path) {
            return Ok(meta);
        }
        self.lower.stat(&path)
    }

    pub fn lstat(&self, path: &str) -> Result<Metadata> {
        let path = clean_path("/", path);
        if let Some(meta) = self.upper_lstat(&path) {
            return Ok(meta);
        }
        self.lower.lstat(&path)
    }

    pub fn exists(&self, path: &str) -> bool {
        self.stat(path).is_ok()
    }

    pub fn is_dir(&self, path: &str) -> bool {
        self.stat(path).map(|m| m.is_dir()).unwrap_or(false)
    }

    /// Merged, name-sorted listing. Upper entries shadow lower ones.
    pub fn read_dir(&self, path: &str) -> Result<Vec<Metadata>> {
        let path = clean_path("/", path);
        let mut entries: BTreeMap<String, Metadata> = BTreeMap::new();
        let mut found = false;

        match self.lower.read_dir(&path) {
            Ok(list) => {
                found = true;
                for meta in list {
                    entries.insert(meta.name.clone(), meta);
                }
            }
            Err(VfsError::NotFound) | Err(VfsError::NotADirectory) => {}
            Err(e) => return Err(e),
        }

        let host = self.upper_path(&path);
        if host.is_dir() {
            found = true;
            for entry in fs::read_dir(&host)? {
                let entry = entry?;
                let meta = fs::symlink_metadata(entry.path())?;
                let converted = host_metadata(&entry.path(), &meta);
                entries.insert(converted.name.clone(), converted);
            }
        }

        if !found {
            return match self.stat(&path) {
                Ok(_) => Err(VfsError::NotADirectory),
                Err(e) => Err(e),
            };
        }
        Ok(entries.into_values().collect())
    }

    pub fn open(&self, path: &str) -> Result<FileHandle> {
        self.open_with(path, OpenMode::read_only())
    }

    pub fn create(&self, path: &str) -> Result<FileHandle> {
        self.open_with(path, OpenMode::create_truncate())
    }

    pub fn open_with(&self, path: &str, mode: OpenMode) -> Result<FileHandle> {
        let path = clean_path("/", path);
        if !mode.is_write() {
            let host = self.upper_path(&path);
            if host.exists() {
                if host.is_dir() {
                    return Err(VfsError::IsADirectory);
                }
                let file = File::open(&host).map_err(VfsError::from_upper)?;
                return Ok(FileHandle {
                    path,
                    inner: HandleKind::Upper { file },
                });
            }
            let entry = self.lower.open(&path)?;
            let meta = self.lower.stat(&path)?;
            return Ok(FileHandle {
                path,
                inner: HandleKind::Lower { entry, meta },
            });
        }

        // Writes land in the scratch layer. The destination's parent must
        // exist somewhere in the merged view before we mirror it above.
        let parent = parent_of(&path);
        let parent_meta = self.stat(&parent)?;
        if !parent_meta.is_dir() {
            return Err(VfsError::NotADirectory);
        }
        let host = self.upper_path(&path);
        if let Some(dir) = host.parent() {
            fs::create_dir_all(dir)?;
        }

        let merged_exists = self.exists(&path);
        if mode.create_new && merged_exists {
            return Err(VfsError::AlreadyExists);
        }

        // Modifying an existing lower file in place: pull its bytes up first
        // so offsets past the write still read back the original content.
        if !mode.truncate && !host.exists() {
            if let Ok(mut entry) = self.lower.open(&path) {
                let mut up = File::create(&host)?;
                io::copy(&mut entry, &mut up)?;
                debug!(path = %path, "copied lower file into scratch layer");
            }
        }

        let mut opts = OpenOptions::new();
        opts.read(true).write(mode.write || mode.truncate || mode.create);
        if mode.append {
            opts.append(true);
        }
        if mode.create || mode.create_new {
            opts.create(true);
        }
        if mode.create_new {
            opts.create_new(true);
        }
        if mode.truncate {
            opts.truncate(true);
        }
        let file = opts.open(&host).map_err(VfsError::from_upper)?;
        Ok(FileHandle {
            path,
            inner: HandleKind::Upper { file },
        })
    }

    pub fn mkdir(&self, path: &str) -> Result<()> {
        let path = clean_path("/", path);
        if self.exists(&path) {
            return Err(VfsError::AlreadyExists);
        }
        let parent = parent_of(&path);
        if !self.is_dir(&parent) {
            return Err(VfsError::NotFound);
        }
        let host = self.upper_path(&path);
        if let Some(dir) = host.parent() {
            fs::create_dir_all(dir)?;
        }
        fs::create_dir(&host).map_err(VfsError::from_upper)
    }

    pub fn mkdir_all(&self, path: &str) -> Result<()> {
        let path = clean_path("/", path);
        if let Ok(meta) = self.stat(&path) {
            return if meta.is_dir() {
                Ok(())
            } else {
                Err(VfsError::NotADirectory)
            };
        }
        fs::create_dir_all(self.upper_path(&path)).map_err(VfsError::from_upper)
    }

    pub fn remove_file(&self, path: &str) -> Result<()> {
        let path = clean_path("/", path);
        let host = self.upper_path(&path);
        if host.exists() {
            return fs::remove_file(&host).map_err(VfsError::from_upper);
        }
        if self.lower.exists(&path) {
            return Err(VfsError::PermissionDenied);
        }
        Err(VfsError::NotFound)
    }

    pub fn remove_dir(&self, path: &str) -> Result<()> {
        let path = clean_path("/", path);
        let host = self.upper_path(&path);
        if host.exists() {
            return fs::remove_dir(&host).map_err(VfsError::from_upper);
        }
        if self.lower.exists(&path) {
            return Err(VfsError::PermissionDenied);
        }
        Err(VfsError::NotFound)
    }

    pub fn rename(&self, from: &str, to: &str) -> Result<()> {
        let from = clean_path("/", from);
        let to = clean_path("/", to);
        let src = self.upper_path(&from);
        if !src.exists() {
            return if self.lower.exists(&from) {
                Err(VfsError::PermissionDenied)
            } else {
                Err(VfsError::NotFound)
            };
        }
        let dst = self.upper_path(&to);
        if let Some(dir) = dst.parent() {
            fs::create_dir_all(dir)?;
        }
        fs::rename(&src, &dst).map_err(VfsError::from_upper)
    }

    pub fn set_times(&self, path: &str, atime: i64, mtime: i64) -> Result<()> {
        let path = clean_path("/", path);
        let host = self.upper_path(&path);
        if !host.exists() {
            return if self.lower.exists(&path) {
                Err(VfsError::PermissionDenied)
            } else {
                Err(VfsError::NotFound)
            };
        }
        let file = OpenOptions::new()
            .write(true)
            .open(&host)
            .map_err(VfsError::from_upper)?;
        let times = fs::FileTimes::new()
            .set_accessed(epoch_to_system(atime))
            .set_modified(epoch_to_system(mtime));
        file.set_times(times).map_err(VfsError::from_upper)
    }

    /// Preorder walk rooted at `path`, the shape SCP source mode needs:
    /// every directory before its (name-sorted) children.
    pub fn walk(&self, path: &str) -> Result<Vec<(String, Metadata)>> {
        let path = clean_path("/", path);
        let meta = self.stat(&path)?;
        let mut out = Vec::new();
        self.walk_inner(&path, meta, &mut out)?;
        Ok(out)
    }

    fn walk_inner(
        &self,
        path: &str,
        meta: Metadata,
        out: &mut Vec<(String, Metadata)>,
    ) -> Result<()> {
        let is_dir = meta.is_dir();
        out.push((path.to_string(), meta));
        if is_dir {
            for child in self.read_dir(path)? {
                let child_path = clean_path(path, &child.name);
                self.walk_inner(&child_path, child, out)?;
            }
        }
        Ok(())
    }
}

fn parent_of(path: &str) -> String {
    clean_path(path, "..")
}

fn epoch_to_system(secs: i64) -> SystemTime {
    if secs >= 0 {
        SystemTime::UNIX_EPOCH + Duration::from_secs(secs as u64)
    } else {
        SystemTime::UNIX_EPOCH
    }
}

#[cfg(unix)]
fn host_metadata(path: &Path, meta: &fs::Metadata) -> Metadata {
    use std::os::unix::fs::MetadataExt;
    let name = path
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_default();
    Metadata {
        name,
        mode: meta.mode(),
        uid: meta.uid(),
        gid: meta.gid(),
        size: if meta.is_dir() { DIR_SIZE } else { meta.len() },
        atime: meta.atime(),
        mtime: meta.mtime(),
        ctime: meta.ctime(),
        link_target: fs::read_link(path)
            .ok()
            .map(|t| t.to_string_lossy().into_owned()),
    }
}

#[cfg(not(unix))]
fn host_metadata(path: &Path, meta: &fs::Metadata) -> Metadata {
    let name = path
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_default();
    let kind_bits = if meta.is_dir() { S_IFDIR } else { S_IFREG };
    let mtime = meta
        .modified()
        .ok()
        .and_then(|t| t.duration_since(SystemTime::UNIX_EPOCH).ok())
        .map(|d| d.as_secs() as i64)
        .unwrap_or(0);
    Metadata {
        name,
        mode: kind_bits | if meta.permissions().readonly() { 0o444 } else { 0o644 },
        uid: 0,
        gid: 0,
        size: if meta.is_dir() { DIR_SIZE } else { meta.len() },
        atime: mtime,
        mtime,
        ctime: mtime,
        link_target: None,
    }
}

enum HandleKind {
    Lower { entry: ZipEntry, meta: Metadata },
    Upper { file: File },
}

/// An open file in the overlay, from whichever layer answered.
pub struct FileHandle {
    path: String,
    inner: HandleKind,
}

impl FileHandle {
    pub fn path(&self) -> &str {
        &self.path
    }

    pub fn metadata(&self) -> io::Result<Metadata> {
        match &self.inner {
            HandleKind::Lower { meta, .. } => Ok(meta.clone()),
            HandleKind::Upper { file } => {
                let meta = file.metadata()?;
                Ok(host_metadata(Path::new(&self.path), &meta))
            }
        }
    }

    pub fn read_at(&mut self, out: &mut [u8], offset: u64) -> io::Result<usize> {
        match &mut self.inner {
            HandleKind::Lower { entry, .. } => entry.read_at(out, offset),
            HandleKind::Upper { file } => {
                file.seek(SeekFrom::Start(offset))?;
                // A short read here only means EOF, never "try again".
                let mut filled = 0;
                while filled < out.len() {
                    match file.read(&mut out[filled..]) {
                        Ok(0) => break,
                        Ok(n) => filled += n,
                        Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                        Err(e) => return Err(e),
                    }
                }
                Ok(filled)
            }
        }
    }

    pub fn write_at(&mut self, data: &[u8], offset: u64) -> io::Result<usize> {
        match &mut self.inner {
            HandleKind::Lower { .. } => Err(io::Error::new(
                io::ErrorKind::PermissionDenied,
                "read-only filesystem",
            )),
            HandleKind::Upper { file } => {
                file.seek(SeekFrom::Start(offset))?;
                file.write(data)
            }
        }
    }
}

impl Read for FileHandle {
    fn read(&mut self, out: &mut [u8]) -> io::Result<usize> {
        match &mut self.inner {
            HandleKind::Lower { entry, .. } => entry.read(out),
            HandleKind::Upper { file } => file.read(out),
        }
    }
}

impl Write for FileHandle {
    fn write(&mut self, data: &[u8]) -> io::Result<usize> {
        match &mut self.inner {
            HandleKind::Lower { .. } => Err(io::Error::new(
                io::ErrorKind::PermissionDenied,
                "read-only filesystem",
            )),
            HandleKind::Upper { file } => file.write(data),
        }
    }

    fn flush(&mut self) -> io::Result<()> {
        match &mut self.inner {
            HandleKind::Lower { .. } => Ok(()),
            HandleKind::Upper { file } => file.flush(),
        }
    }
}

impl Seek for FileHandle {
    fn seek(&mut self, pos: SeekFrom) -> io::Result<u64> {
        match &mut self.inner {
            HandleKind::Lower { entry, .. } => entry.seek(pos),
            HandleKind::Upper { file } => file.seek(pos),
        }
    }
}
