use std::io::{Read, Seek, SeekFrom, Write};
use std::sync::Arc;

use nectar_vfs::{clean_path, OpenMode, OverlayFs, VfsError, ZipFs};
use tempfile::TempDir;
use zip::write::FileOptions;
use zip::ZipWriter;

/// Build the extra-field bytes a unixy zip tool would attach: `0x7875`
/// (UID/GID) followed by `0x5455` (mtime + atime).
fn unix_extra(uid: u32, gid: u32, mtime: u32, atime: u32) -> Vec<u8> {
    let mut extra = vec![0x75, 0x78, 11, 0, 1, 4];
    extra.extend_from_slice(&uid.to_le_bytes());
    extra.push(4);
    extra.extend_from_slice(&gid.to_le_bytes());
    extra.extend_from_slice(&[0x55, 0x54, 9, 0, 0x03]);
    extra.extend_from_slice(&mtime.to_le_bytes());
    extra.extend_from_slice(&atime.to_le_bytes());
    extra
}

fn build_image(dir: &TempDir) -> std::path::PathBuf {
    let path = dir.path().join("filesystem.zip");
    let file = std::fs::File::create(&path).unwrap();
    let mut zw = ZipWriter::new(file);

    zw.add_directory("bin/", FileOptions::default().unix_permissions(0o755))
        .unwrap();
    zw.start_file("bin/ls", FileOptions::default().unix_permissions(0o755))
        .unwrap();
    zw.write_all(b"ELF-ls").unwrap();
    zw.start_file("bin/cat", FileOptions::default().unix_permissions(0o755))
        .unwrap();
    zw.write_all(b"ELF-cat").unwrap();

    zw.start_file_with_extra_data(
        "home/bob/notes.txt",
        FileOptions::default().unix_permissions(0o644),
    )
    .unwrap();
    zw.write_all(&unix_extra(1001, 1001, 1_500_000_000, 1_500_000_050))
        .unwrap();
    zw.end_extra_data().unwrap();
    zw.write_all(b"hello from the archive\n").unwrap();

    zw.add_symlink(
        "home/bob/link",
        "notes.txt",
        FileOptions::default().unix_permissions(0o777),
    )
    .unwrap();

    zw.finish().unwrap();
    path
}

fn overlay(dir: &TempDir) -> OverlayFs {
    let image = build_image(dir);
    let lower = Arc::new(ZipFs::open_image(&image).unwrap());
    OverlayFs::new(lower, dir.path().join("scratch")).unwrap()
}

#[test]
fn test_zip_content_round_trip() {
    let dir = TempDir::new().unwrap();
    let fs = overlay(&dir);

    let mut f = fs.open("/home/bob/notes.txt").unwrap();
    let mut body = String::new();
    f.read_to_string(&mut body).unwrap();
    assert_eq!(body, "hello from the archive\n");

    // Independent read positions per open.
    let mut a = fs.open("/bin/ls").unwrap();
    let mut b = fs.open("/bin/ls").unwrap();
    let mut buf = [0u8; 3];
    a.read_exact(&mut buf).unwrap();
    assert_eq!(&buf, b"ELF");
    let mut all = Vec::new();
    b.read_to_end(&mut all).unwrap();
    assert_eq!(all, b"ELF-ls");
}

#[test]
fn test_zip_extras_surface_in_stat() {
    let dir = TempDir::new().unwrap();
    let fs = overlay(&dir);

    let meta = fs.stat("/home/bob/notes.txt").unwrap();
    assert_eq!(meta.uid, 1001);
    assert_eq!(meta.gid, 1001);
    assert_eq!(meta.mtime, 1_500_000_000);
    assert_eq!(meta.atime, 1_500_000_050);
    assert_eq!(meta.permissions(), 0o644);
}

#[test]
fn test_symlink_follow_and_lstat() {
    let dir = TempDir::new().unwrap();
    let fs = overlay(&dir);

    let followed = fs.stat("/home/bob/link").unwrap();
    assert!(followed.is_file());
    assert_eq!(followed.size, "hello from the archive\n".len() as u64);

    let link = fs.lstat("/home/bob/link").unwrap();
    assert!(link.is_symlink());
    assert_eq!(link.link_target.as_deref(), Some("notes.txt"));

    let mut via_link = fs.open("/home/bob/link").unwrap();
    let mut body = String::new();
    via_link.read_to_string(&mut body).unwrap();
    assert_eq!(body, "hello from the archive\n");
}

#[test]
fn test_lower_layer_rejects_writes() {
    let dir = TempDir::new().unwrap();
    let fs = overlay(&dir);

    let mut f = fs.open("/bin/ls").unwrap();
    assert!(f.write(b"nope").is_err());
    assert!(matches!(
        fs.remove_file("/bin/ls"),
        Err(VfsError::PermissionDenied)
    ));
    assert!(matches!(
        fs.rename("/bin/ls", "/bin/ls2"),
        Err(VfsError::PermissionDenied)
    ));
}

#[test]
fn test_overlay_write_round_trip_and_shadowing() {
    let dir = TempDir::new().unwrap();
    let fs = overlay(&dir);

    let mut f = fs.create("/home/bob/upload.bin").unwrap();
    assert_eq!(f.path(), "/home/bob/upload.bin");
    f.write_all(b"payload bytes").unwrap();
    drop(f);

    let mut back = fs.open("/home/bob/upload.bin").unwrap();
    let mut body = Vec::new();
    back.read_to_end(&mut body).unwrap();
    assert_eq!(body, b"payload bytes");

    // Shadow a lower file by the same name; the upper copy wins.
    let mut f = fs.create("/home/bob/notes.txt").unwrap();
    f.write_all(b"overwritten").unwrap();
    drop(f);
    let mut body = String::new();
    fs.open("/home/bob/notes.txt")
        .unwrap()
        .read_to_string(&mut body)
        .unwrap();
    assert_eq!(body, "overwritten");

    // The merged listing carries both layers, upper winning on collision.
    let names: Vec<String> = fs
        .read_dir("/home/bob")
        .unwrap()
        .into_iter()
        .map(|m| m.name)
        .collect();
    assert_eq!(names, vec!["link", "notes.txt", "upload.bin"]);
    let shadowed = fs.stat("/home/bob/notes.txt").unwrap();
    assert_eq!(shadowed.size, "overwritten".len() as u64);
}

#[test]
fn test_copy_up_preserves_unwritten_bytes() {
    let dir = TempDir::new().unwrap();
    let fs = overlay(&dir);

    let mut f = fs
        .open_with(
            "/home/bob/notes.txt",
            OpenMode {
                write: true,
                ..Default::default()
            },
        )
        .unwrap();
    f.write_at(b"HELLO", 0).unwrap();
    drop(f);

    let mut body = String::new();
    fs.open("/home/bob/notes.txt")
        .unwrap()
        .read_to_string(&mut body)
        .unwrap();
    assert_eq!(body, "HELLO from the archive\n");
}

#[test]
fn test_mkdir_and_remove_in_scratch() {
    let dir = TempDir::new().unwrap();
    let fs = overlay(&dir);

    fs.mkdir("/home/bob/dropzone").unwrap();
    assert!(fs.is_dir("/home/bob/dropzone"));
    assert!(matches!(
        fs.mkdir("/home/bob/dropzone"),
        Err(VfsError::AlreadyExists)
    ));
    assert!(matches!(
        fs.mkdir("/no/such/parent"),
        Err(VfsError::NotFound)
    ));
    fs.remove_dir("/home/bob/dropzone").unwrap();
    assert!(!fs.exists("/home/bob/dropzone"));
}

#[test]
fn test_set_times_only_touches_scratch_files() {
    let dir = TempDir::new().unwrap();
    let fs = overlay(&dir);

    assert!(matches!(
        fs.set_times("/home/bob/notes.txt", 1_600_000_000, 1_600_000_000),
        Err(VfsError::PermissionDenied)
    ));

    let mut f = fs.create("/home/bob/stamped").unwrap();
    f.write_all(b"x").unwrap();
    drop(f);
    fs.set_times("/home/bob/stamped", 1_600_000_000, 1_600_000_000)
        .unwrap();
    let meta = fs.stat("/home/bob/stamped").unwrap();
    assert_eq!(meta.mtime, 1_600_000_000);
}

#[test]
fn test_seek_within_lower_file() {
    let dir = TempDir::new().unwrap();
    let fs = overlay(&dir);

    let mut f = fs.open("/home/bob/notes.txt").unwrap();
    f.seek(SeekFrom::Start(6)).unwrap();
    let mut rest = String::new();
    f.read_to_string(&mut rest).unwrap();
    assert_eq!(rest, "from the archive\n");
}

#[test]
fn test_clean_path_reexport() {
    assert_eq!(clean_path("/home/bob", "../../etc/passwd"), "/etc/passwd");
}
