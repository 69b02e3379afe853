use std::collections::VecDeque;
use std::fs::File;
use std::io::Read;
use std::path::Path;
use std::sync::{Arc, Mutex};

use tracing::{debug, warn};
use zip::ZipArchive;

use crate::error::{Result, VfsError};
use crate::file::ZipEntry;
use crate::node::{clean_path, Metadata, Node, DIR_SIZE, S_IFDIR, S_IFLNK, S_IFMT, S_IFREG};

const EXTRA_UNIX_IDS: u16 = 0x7875;
const EXTRA_UNIX_TIMES: u16 = 0x5455;

/// Symlink chains longer than this are treated as loops (ELOOP).
const MAX_LINK_DEPTH: usize = 40;

/// The read-only lower layer: a tree built from a zip archive's central
/// directory. Entry payloads stay compressed until someone opens them.
pub struct ZipFs {
    archive: Arc<Mutex<ZipArchive<File>>>,
    root: Node,
}

#[derive(Default)]
struct ExtraInfo {
    uid: Option<u32>,
    gid: Option<u32>,
    atime: Option<i64>,
    mtime: Option<i64>,
    ctime: Option<i64>,
}

/// Parse the UNIX extra fields carried by zip entries: `0x7875` (UID/GID,
/// little-endian variable-width ints) and `0x5455` (extended timestamps).
/// Malformed fields are skipped rather than failing the whole image.
fn parse_extra(data: &[u8]) -> ExtraInfo {
    let mut info = ExtraInfo::default();
    let mut pos = 0usize;
    while pos + 4 <= data.len() {
        let id = u16::from_le_bytes([data[pos], data[pos + 1]]);
        let len = u16::from_le_bytes([data[pos + 2], data[pos + 3]]) as usize;
        pos += 4;
        if pos + len > data.len() {
            break;
        }
        let field = &data[pos..pos + len];
        match id {
            EXTRA_UNIX_IDS => {
                // version(1) uid_size(1) uid gid_size(1) gid
                if field.len() >= 2 {
                    let mut fp = 1usize;
                    let uid_len = field[fp] as usize;
                    fp += 1;
                    if fp + uid_len + 1 <= field.len() {
                        info.uid = read_le_varint(&field[fp..fp + uid_len]);
                        fp += uid_len;
                        let gid_len = field[fp] as usize;
                        fp += 1;
                        if fp + gid_len <= field.len() {
                            info.gid = read_le_varint(&field[fp..fp + gid_len]);
                        }
                    }
                }
            }
            EXTRA_UNIX_TIMES => {
                // flags(1) [mtime][atime][ctime], each a LE u32 epoch
                if !field.is_empty() {
                    let flags = field[0];
                    let mut fp = 1usize;
                    for (bit, slot) in [
                        (0x01u8, &mut info.mtime),
                        (0x02, &mut info.atime),
                        (0x04, &mut info.ctime),
                    ] {
                        if flags & bit != 0 && fp + 4 <= field.len() {
                            let raw = u32::from_le_bytes([
                                field[fp],
                                field[fp + 1],
                                field[fp + 2],
                                field[fp + 3],
                            ]);
                            *slot = Some(raw as i64);
                            fp += 4;
                        }
                    }
                }
            }
            _ => {}
        }
        pos += len;
    }
    info
}

fn read_le_varint(field: &[u8]) -> Option<u32> {
    match field.len() {
        1 => Some(field[0] as u32),
        2 => Some(u16::from_le_bytes([field[0], field[1]]) as u32),
        4 => Some(u32::from_le_bytes([field[0], field[1], field[2], field[3]])),
        8 => {
            let v = u64::from_le_bytes(field.try_into().ok()?);
            Some(v as u32)
        }
        _ => None,
    }
}

impl ZipFs {
    /// Build the tree from the archive's central directory. Symlink targets
    /// are the only payloads read eagerly; everything else stays compressed.
    pub fn open_image<P: AsRef<Path>>(path: P) -> Result<Self> {
        let file = File::open(path.as_ref())?;
        let mut archive =
            ZipArchive::new(file).map_err(|e| VfsError::BadImage(e.to_string()))?;

        let mut root = Node::new_dir("", 0o755, 0, 0, 0);
        let count = archive.len();
        for index in 0..count {
            let mut entry = match archive.by_index(index) {
                Ok(e) => e,
                Err(e) => {
                    warn!(index, error = %e, "skipping unreadable zip entry");
                    continue;
                }
            };
            let raw_name = entry.name().replace('\\', "/");
            let parts: Vec<&str> = raw_name.split('/').filter(|c| !c.is_empty()).collect();
            if parts.is_empty() {
                continue;
            }

            let extra = parse_extra(entry.extra_data());
            let uid = extra.uid.unwrap_or(0);
            let gid = extra.gid.unwrap_or(0);
            let mtime = extra.mtime.unwrap_or_else(|| dos_epoch(&entry));
            let atime = extra.atime.unwrap_or(mtime);
            let ctime = extra.ctime.unwrap_or(mtime);

            let mode = entry.unix_mode().unwrap_or(if entry.is_dir() {
                S_IFDIR | 0o755
            } else {
                S_IFREG | 0o644
            });
            let is_dir = entry.is_dir() || mode & S_IFMT == S_IFDIR;
            let is_link = mode & S_IFMT == S_IFLNK;

            let leaf_name = (*parts.last().unwrap_or(&"")).to_string();
            let node = if is_dir {
                Node {
                    meta: Metadata {
                        name: leaf_name,
                        mode: S_IFDIR | (mode & 0o7777),
                        uid,
                        gid,
                        size: DIR_SIZE,
                        atime,
                        mtime,
                        ctime,
                        link_target: None,
                    },
                    zip_index: Some(index),
                    children: Default::default(),
                }
            } else if is_link {
                let mut target = String::new();
                if let Err(e) = entry.read_to_string(&mut target) {
                    warn!(name = %raw_name, error = %e, "unreadable symlink target");
                }
                Node {
                    meta: Metadata {
                        name: leaf_name,
                        mode,
                        uid,
                        gid,
                        size: target.len() as u64,
                        atime,
                        mtime,
                        ctime,
                        link_target: Some(target),
                    },
                    zip_index: Some(index),
                    children: Default::default(),
                }
            } else {
                Node {
                    meta: Metadata {
                        name: leaf_name,
                        mode: S_IFREG | (mode & 0o7777),
                        uid,
                        gid,
                        size: entry.size(),
                        atime,
                        mtime,
                        ctime,
                        link_target: None,
                    },
                    zip_index: Some(index),
                    children: Default::default(),
                }
            };
            drop(entry);
            root.insert_path(&parts, node);
        }
        debug!(entries = count, "filesystem image indexed");

        Ok(ZipFs {
            archive: Arc::new(Mutex::new(archive)),
            root,
        })
    }

    /// Component-by-component lookup. Intermediate symlinks are always
    /// followed; the final component only when `follow_last` is set.
    fn lookup(&self, path: &str, follow_last: bool) -> Result<&Node> {
        let clean = clean_path("/", path);
        let mut pending: VecDeque<String> = clean
            .split('/')
            .filter(|c| !c.is_empty())
            .map(str::to_string)
            .collect();
        let mut cur = &self.root;
        let mut done: Vec<String> = Vec::new();
        let mut depth = 0usize;

        while let Some(comp) = pending.pop_front() {
            if !cur.is_dir() {
                return Err(VfsError::NotADirectory);
            }
            let child = cur.children.get(&comp).ok_or(VfsError::NotFound)?;
            let last = pending.is_empty();
            if child.meta.is_symlink() && (!last || follow_last) {
                depth += 1;
                if depth > MAX_LINK_DEPTH {
                    return Err(VfsError::LinkLoop);
                }
                let target = child.meta.link_target.as_deref().unwrap_or("");
                let parent = if done.is_empty() {
                    "/".to_string()
                } else {
                    format!("/{}", done.join("/"))
                };
                let resolved = clean_path(&parent, target);
                let mut restart: VecDeque<String> = resolved
                    .split('/')
                    .filter(|c| !c.is_empty())
                    .map(str::to_string)
                    .collect();
                restart.extend(pending.drain(..));
                pending = restart;
                cur = &self.root;
                done.clear();
                continue;
            }
            done.push(comp);
            cur = child;
        }
        Ok(cur)
    }

    pub fn stat(&self, path: &str) -> Result<Metadata> {
        Ok(self.lookup(path, true)?.meta.clone())
    }

    pub fn lstat(&self, path: &str) -> Result<Metadata> {
        Ok(self.lookup(path, false)?.meta.clone())
    }

    pub fn exists(&self, path: &str) -> bool {
        self.lookup(path, true).is_ok()
    }

    /// Sorted listing of a directory's children.
    pub fn read_dir(&self, path: &str) -> Result<Vec<Metadata>> {
        let node = self.lookup(path, true)?;
        if !node.is_dir() {
            return Err(VfsError::NotADirectory);
        }
        Ok(node.children.values().map(|n| n.meta.clone()).collect())
    }

    /// Open a file for reading. Directories are not openable; symlinks are
    /// followed. Each call gets an independent read position.
    pub fn open(&self, path: &str) -> Result<ZipEntry> {
        let node = self.lookup(path, true)?;
        if node.is_dir() {
            return Err(VfsError::IsADirectory);
        }
        let index = node.zip_index.ok_or(VfsError::NotFound)?;
        Ok(ZipEntry::new(
            Arc::clone(&self.archive),
            index,
            node.meta.size,
        ))
    }
}

/// Fall back to the entry's DOS timestamp when no `0x5455` field is present.
fn dos_epoch(entry: &zip::read::ZipFile<'_>) -> i64 {
    let dt = entry.last_modified();
    days_from_civil(dt.year() as i64, dt.month() as i64, dt.day() as i64) * 86400
        + dt.hour() as i64 * 3600
        + dt.minute() as i64 * 60
        + dt.second() as i64
}

// Howard Hinnant's days-from-civil, counting days since 1970-01-01.
fn days_from_civil(y: i64, m: i64, d: i64) -> i64 {
    let y = if m <= 2 { y - 1 } else { y };
    let era = if y >= 0 { y } else { y - 399 } / 400;
    let yoe = y - era * 400;
    let mp = (m + 9) % 12;
    let doy = (153 * mp + 2) / 5 + d - 1;
    let doe = yoe * 365 + yoe / 4 - yoe / 100 + doy;
    era * 146097 + doe - 719468
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_extra_unix_ids_and_times() {
        // 0x7875: version 1, 4-byte uid 1001, 4-byte gid 1002
        let mut data = vec![0x75, 0x78, 11, 0, 1, 4];
        data.extend_from_slice(&1001u32.to_le_bytes());
        data.push(4);
        data.extend_from_slice(&1002u32.to_le_bytes());
        // 0x5455: mtime + atime
        data.extend_from_slice(&[0x55, 0x54, 9, 0, 0x03]);
        data.extend_from_slice(&1_500_000_000u32.to_le_bytes());
        data.extend_from_slice(&1_500_000_100u32.to_le_bytes());

        let info = parse_extra(&data);
        assert_eq!(info.uid, Some(1001));
        assert_eq!(info.gid, Some(1002));
        assert_eq!(info.mtime, Some(1_500_000_000));
        assert_eq!(info.atime, Some(1_500_000_100));
        assert_eq!(info.ctime, None);
    }

    #[test]
    fn test_parse_extra_truncated_field_is_ignored() {
        let data = vec![0x75, 0x78, 20, 0, 1, 4];
        let info = parse_extra(&data);
        assert_eq!(info.uid, None);
    }

    #[test]
    fn test_days_from_civil() {
        assert_eq!(days_from_civil(1970, 1, 1), 0);
        assert_eq!(days_from_civil(2017, 3, 17), 17242);
    }
}
