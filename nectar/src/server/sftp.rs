use std::collections::HashMap;
use std::sync::Arc;

use nectar_vfs::{clean_path, FileHandle, Metadata, OpenMode, OverlayFs, VfsError};
use russh_sftp::protocol::{
    Attrs, Data, File, FileAttributes, Handle, Name, OpenFlags, Status, StatusCode, Version,
};
use tokio::io::{AsyncRead, AsyncWrite};
use tracing::{debug, error, info};

/// Entries returned per READDIR batch.
const READDIR_PAGE: usize = 120;

/// All live handles of one SFTP session. The three maps are one entity:
/// every id in `dirs` or `eof` also exists as an issued handle, and `close`
/// clears all of them together.
#[derive(Default)]
struct HandleTable {
    files: HashMap<u32, FileHandle>,
    dirs: HashMap<u32, DirListing>,
    eof: HashMap<u32, bool>,
    next: u32,
}

struct DirListing {
    entries: Vec<File>,
    offset: usize,
}

impl HandleTable {
    /// The value captured before the increment is the issued handle.
    fn next_handle(&mut self) -> u32 {
        let handle = self.next;
        self.next += 1;
        handle
    }

    fn insert_file(&mut self, file: FileHandle) -> u32 {
        let handle = self.next_handle();
        self.files.insert(handle, file);
        handle
    }

    fn insert_dir(&mut self, listing: DirListing) -> u32 {
        let handle = self.next_handle();
        self.dirs.insert(handle, listing);
        handle
    }

    fn remove(&mut self, handle: u32) -> bool {
        let had_file = self.files.remove(&handle).is_some();
        let had_dir = self.dirs.remove(&handle).is_some();
        self.eof.remove(&handle);
        had_file || had_dir
    }
}

/// SFTP v3 endpoint bound to the overlay filesystem. The `russh-sftp` crate
/// owns the wire framing; everything the client can observe — handles,
/// pagination, attributes, status codes — is decided here.
pub struct SftpSession {
    fs: Arc<OverlayFs>,
    cwd: String,
    handles: HandleTable,
    version: Option<u32>,
}

impl SftpSession {
    pub fn new(fs: Arc<OverlayFs>, home: &str) -> Self {
        SftpSession {
            fs,
            cwd: home.to_string(),
            handles: HandleTable::default(),
            version: None,
        }
    }

    fn resolve(&self, path: &str) -> String {
        clean_path(&self.cwd, path)
    }

    fn status_ok(&self, id: u32) -> Status {
        Status {
            id,
            status_code: StatusCode::Ok,
            error_message: "OK".to_string(),
            language_tag: "en-US".to_string(),
        }
    }

    fn status_err(&self, id: u32, code: StatusCode, msg: &str) -> Status {
        Status {
            id,
            status_code: code,
            error_message: msg.to_string(),
            language_tag: "en-US".to_string(),
        }
    }

    fn parse_handle(&self, handle: &str) -> Result<u32, StatusCode> {
        handle.parse().map_err(|_| StatusCode::NoSuchFile)
    }
}

fn map_err(err: &VfsError) -> StatusCode {
    match err {
        VfsError::NotFound => StatusCode::NoSuchFile,
        VfsError::PermissionDenied => StatusCode::PermissionDenied,
        _ => StatusCode::Failure,
    }
}

fn attrs_from(meta: &Metadata) -> FileAttributes {
    FileAttributes {
        size: Some(meta.size),
        uid: Some(meta.uid),
        gid: Some(meta.gid),
        permissions: Some(meta.mode),
        atime: Some(meta.atime as u32),
        mtime: Some(meta.mtime as u32),
        ..Default::default()
    }
}

fn open_mode(flags: OpenFlags) -> OpenMode {
    OpenMode {
        read: flags.contains(OpenFlags::READ),
        write: flags.contains(OpenFlags::WRITE),
        append: flags.contains(OpenFlags::APPEND),
        create: flags.contains(OpenFlags::CREATE),
        create_new: flags.contains(OpenFlags::EXCLUDE),
        truncate: flags.contains(OpenFlags::TRUNCATE),
    }
}

impl russh_sftp::server::Handler for SftpSession {
    type Error = StatusCode;

    fn unimplemented(&self) -> Self::Error {
        StatusCode::BadMessage
    }

    async fn init(
        &mut self,
        version: u32,
        extensions: HashMap<String, String>,
    ) -> Result<Version, Self::Error> {
        self.version = Some(version);
        debug!(?version, ?extensions, "sftp init");
        let mut reply = Version::new();
        reply
            .extensions
            .insert("posix-rename@openssh.com".to_string(), "1".to_string());
        reply
            .extensions
            .insert("statvfs@openssh.com".to_string(), "2".to_string());
        reply
            .extensions
            .insert("fstatvfs@openssh.com".to_string(), "2".to_string());
        Ok(reply)
    }

    async fn realpath(&mut self, id: u32, path: String) -> Result<Name, Self::Error> {
        let full = self.resolve(&path);
        let meta = self.fs.stat(&full).map_err(|e| map_err(&e))?;
        Ok(Name {
            id,
            files: vec![File::new(full, attrs_from(&meta))],
        })
    }

    async fn opendir(&mut self, id: u32, path: String) -> Result<Handle, Self::Error> {
        let full = self.resolve(&path);
        let listing = self.fs.read_dir(&full).map_err(|e| map_err(&e))?;
        let entries = listing
            .iter()
            .map(|meta| File::new(meta.name.clone(), attrs_from(meta)))
            .collect();
        let handle = self.handles.insert_dir(DirListing { entries, offset: 0 });
        debug!(path = %full, handle, "sftp opendir");
        Ok(Handle {
            id,
            handle: handle.to_string(),
        })
    }

    async fn readdir(&mut self, id: u32, handle: String) -> Result<Name, Self::Error> {
        let handle = self.parse_handle(&handle)?;
        let listing = self.handles.dirs.get_mut(&handle).ok_or(StatusCode::NoSuchFile)?;
        if listing.offset >= listing.entries.len() {
            return Err(StatusCode::Eof);
        }
        let end = (listing.offset + READDIR_PAGE).min(listing.entries.len());
        let page = listing.entries[listing.offset..end].to_vec();
        listing.offset = end;
        Ok(Name { id, files: page })
    }

    async fn close(&mut self, id: u32, handle: String) -> Result<Status, Self::Error> {
        let handle = self.parse_handle(&handle)?;
        if self.handles.remove(handle) {
            Ok(self.status_ok(id))
        } else {
            Ok(self.status_err(id, StatusCode::NoSuchFile, "invalid handle"))
        }
    }

    async fn stat(&mut self, id: u32, path: String) -> Result<Attrs, Self::Error> {
        let full = self.resolve(&path);
        let meta = self.fs.stat(&full).map_err(|e| map_err(&e))?;
        Ok(Attrs {
            id,
            attrs: attrs_from(&meta),
        })
    }

    async fn lstat(&mut self, id: u32, path: String) -> Result<Attrs, Self::Error> {
        let full = self.resolve(&path);
        let meta = self.fs.lstat(&full).map_err(|e| map_err(&e))?;
        Ok(Attrs {
            id,
            attrs: attrs_from(&meta),
        })
    }

    async fn fstat(&mut self, id: u32, handle: String) -> Result<Attrs, Self::Error> {
        let handle = self.parse_handle(&handle)?;
        let file = self.handles.files.get(&handle).ok_or(StatusCode::NoSuchFile)?;
        let meta = file.metadata().map_err(|_| StatusCode::Failure)?;
        Ok(Attrs {
            id,
            attrs: attrs_from(&meta),
        })
    }

    async fn open(
        &mut self,
        id: u32,
        filename: String,
        pflags: OpenFlags,
        _attrs: FileAttributes,
    ) -> Result<Handle, Self::Error> {
        let full = self.resolve(&filename);
        let file = self
            .fs
            .open_with(&full, open_mode(pflags))
            .map_err(|e| map_err(&e))?;
        let handle = self.handles.insert_file(file);
        debug!(path = %full, handle, ?pflags, "sftp open");
        Ok(Handle {
            id,
            handle: handle.to_string(),
        })
    }

    async fn read(
        &mut self,
        id: u32,
        handle: String,
        offset: u64,
        len: u32,
    ) -> Result<Data, Self::Error> {
        let handle = self.parse_handle(&handle)?;
        let file = self
            .handles
            .files
            .get_mut(&handle)
            .ok_or(StatusCode::NoSuchFile)?;
        let mut buf = vec![0u8; len as usize];
        let n = file
            .read_at(&mut buf, offset)
            .map_err(|_| StatusCode::Failure)?;
        if n == 0 {
            self.handles.eof.insert(handle, true);
            return Err(StatusCode::Eof);
        }
        if n < len as usize {
            self.handles.eof.insert(handle, true);
        }
        buf.truncate(n);
        Ok(Data { id, data: buf })
    }

    async fn write(
        &mut self,
        id: u32,
        handle: String,
        offset: u64,
        data: Vec<u8>,
    ) -> Result<Status, Self::Error> {
        let handle = self.parse_handle(&handle)?;
        let file = self
            .handles
            .files
            .get_mut(&handle)
            .ok_or(StatusCode::NoSuchFile)?;
        let mut written = 0usize;
        while written < data.len() {
            match file.write_at(&data[written..], offset + written as u64) {
                Ok(0) => return Err(StatusCode::Failure),
                Ok(n) => written += n,
                Err(e) if e.kind() == std::io::ErrorKind::PermissionDenied => {
                    return Err(StatusCode::PermissionDenied)
                }
                Err(_) => return Err(StatusCode::Failure),
            }
        }
        Ok(self.status_ok(id))
    }

    async fn mkdir(
        &mut self,
        id: u32,
        path: String,
        _attrs: FileAttributes,
    ) -> Result<Status, Self::Error> {
        let full = self.resolve(&path);
        match self.fs.mkdir(&full) {
            Ok(()) => Ok(self.status_ok(id)),
            Err(e) => Ok(self.status_err(id, map_err(&e), "mkdir failed")),
        }
    }

    // Everything else (remove, rename, setstat, symlinks, extensions)
    // falls through to `unimplemented` and replies BAD_MESSAGE.
}

/// Serve the `sftp` subsystem on a session channel. The home directory is
/// created in the scratch layer up front so uploads have somewhere to land.
pub async fn run_sftp<S>(stream: S, fs: Arc<OverlayFs>, home: &str) -> anyhow::Result<()>
where
    S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    if !fs.exists(home) {
        if let Err(e) = fs.mkdir_all(home) {
            error!(home, error = %e, "could not create session home");
        }
    }
    info!(home, "sftp subsystem started");
    let handler = SftpSession::new(fs, home);
    russh_sftp::server::run(stream, handler).await;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::os::sys::test_support::sys_fixture;
    use russh_sftp::server::Handler;

    fn session() -> (SftpSession, crate::os::sys::test_support::SysFixture) {
        let fx = sys_fixture();
        let session = SftpSession::new(fx.sys.fs.clone(), "/home/bob");
        (session, fx)
    }

    #[test]
    fn test_unlisted_ops_reply_bad_message() {
        let (s, _fx) = session();
        assert_eq!(s.unimplemented(), StatusCode::BadMessage);
    }

    #[tokio::test]
    async fn test_init_advertises_extensions() {
        let (mut s, _fx) = session();
        let version = s.init(3, HashMap::new()).await.unwrap();
        assert_eq!(version.version, 3);
        assert_eq!(
            version.extensions.get("posix-rename@openssh.com"),
            Some(&"1".to_string())
        );
        assert_eq!(
            version.extensions.get("statvfs@openssh.com"),
            Some(&"2".to_string())
        );
        assert_eq!(
            version.extensions.get("fstatvfs@openssh.com"),
            Some(&"2".to_string())
        );
    }

    #[tokio::test]
    async fn test_realpath_joins_cwd() {
        let (mut s, _fx) = session();
        let name = s.realpath(1, "notes.txt".to_string()).await.unwrap();
        assert_eq!(name.files.len(), 1);
        assert_eq!(name.files[0].filename, "/home/bob/notes.txt");
    }

    #[tokio::test]
    async fn test_stat_attrs_carry_image_metadata() {
        let (mut s, _fx) = session();
        let attrs = s.stat(2, "/bin/ls".to_string()).await.unwrap().attrs;
        assert_eq!(attrs.size, Some(6));
        assert_eq!(attrs.uid, Some(0));
        assert_eq!(attrs.gid, Some(0));
        assert_eq!(attrs.permissions, Some(0o100755));
    }

    #[tokio::test]
    async fn test_stat_missing_is_no_such_file() {
        let (mut s, _fx) = session();
        let err = s.stat(3, "/nope".to_string()).await.unwrap_err();
        assert_eq!(err, StatusCode::NoSuchFile);
    }

    #[tokio::test]
    async fn test_readdir_paginates_once_then_eof() {
        let (mut s, _fx) = session();
        let handle = s.opendir(4, "/bin".to_string()).await.unwrap().handle;
        let batch = s.readdir(5, handle.clone()).await.unwrap();
        let names: Vec<&str> = batch.files.iter().map(|f| f.filename.as_str()).collect();
        assert_eq!(names, vec!["cat", "ls"]);
        let err = s.readdir(6, handle.clone()).await.unwrap_err();
        assert_eq!(err, StatusCode::Eof);
        let status = s.close(7, handle).await.unwrap();
        assert_eq!(status.status_code, StatusCode::Ok);
    }

    #[tokio::test]
    async fn test_upload_round_trip() {
        let (mut s, _fx) = session();
        let handle = s
            .open(
                8,
                "/home/bob/x".to_string(),
                OpenFlags::CREATE | OpenFlags::WRITE,
                FileAttributes::default(),
            )
            .await
            .unwrap()
            .handle;
        let status = s
            .write(9, handle.clone(), 0, b"hello\n".to_vec())
            .await
            .unwrap();
        assert_eq!(status.status_code, StatusCode::Ok);
        s.close(10, handle).await.unwrap();

        let handle = s
            .open(
                11,
                "/home/bob/x".to_string(),
                OpenFlags::READ,
                FileAttributes::default(),
            )
            .await
            .unwrap()
            .handle;
        let data = s.read(12, handle.clone(), 0, 6).await.unwrap();
        assert_eq!(data.data, b"hello\n");
        let err = s.read(13, handle.clone(), 6, 16).await.unwrap_err();
        assert_eq!(err, StatusCode::Eof);
        s.close(14, handle).await.unwrap();
    }

    #[tokio::test]
    async fn test_write_to_lower_layer_is_denied() {
        let (mut s, _fx) = session();
        let handle = s
            .open(
                15,
                "/bin/ls".to_string(),
                OpenFlags::READ,
                FileAttributes::default(),
            )
            .await
            .unwrap()
            .handle;
        let err = s
            .write(16, handle, 0, b"overwrite".to_vec())
            .await
            .unwrap_err();
        assert_eq!(err, StatusCode::PermissionDenied);
    }

    #[tokio::test]
    async fn test_mkdir_in_overlay() {
        let (mut s, _fx) = session();
        let status = s
            .mkdir(17, "drop".to_string(), FileAttributes::default())
            .await
            .unwrap();
        assert_eq!(status.status_code, StatusCode::Ok);
        let attrs = s.stat(18, "/home/bob/drop".to_string()).await.unwrap().attrs;
        assert_eq!(attrs.permissions.unwrap() & 0o170000, 0o040000);
    }

    #[tokio::test]
    async fn test_close_invalid_handle() {
        let (mut s, _fx) = session();
        let status = s.close(19, "42".to_string()).await.unwrap();
        assert_eq!(status.status_code, StatusCode::NoSuchFile);
    }

    #[tokio::test]
    async fn test_handle_counter_is_pre_increment() {
        let mut table = HandleTable::default();
        let listing = DirListing {
            entries: Vec::new(),
            offset: 0,
        };
        let first = table.insert_dir(listing);
        assert_eq!(first, 0);
        let second = table.insert_dir(DirListing {
            entries: Vec::new(),
            offset: 0,
        });
        assert_eq!(second, 1);
        assert!(table.remove(first));
        assert!(!table.remove(first));
    }
}
