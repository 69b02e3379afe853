use std::fs::{File, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use std::time::{SystemTime, UNIX_EPOCH};

use anyhow::Result;
use byteorder::{LittleEndian, WriteBytesExt};
use rand::Rng;
use tracing::warn;

use super::{Direction, SessionRecorder};

const OP_OPEN: i32 = 1;
const OP_CLOSE: i32 = 2;
const OP_WRITE: i32 = 3;

const DIR_READ: i32 = 1;
const DIR_WRITE: i32 = 2;

/// UML tty-log transcript: little-endian records of
/// `op | tty | len | dir | sec | usec` followed by `len` payload bytes.
pub struct UmlRecorder {
    file: Mutex<File>,
    path: PathBuf,
    tty: u32,
}

fn now_parts() -> (u32, u32) {
    let now = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default();
    (now.as_secs() as u32, now.subsec_micros())
}

fn write_record(
    file: &mut File,
    op: i32,
    tty: u32,
    dir: i32,
    payload: &[u8],
) -> std::io::Result<()> {
    let (sec, usec) = now_parts();
    file.write_i32::<LittleEndian>(op)?;
    file.write_u32::<LittleEndian>(tty)?;
    file.write_i32::<LittleEndian>(payload.len() as i32)?;
    file.write_i32::<LittleEndian>(dir)?;
    file.write_u32::<LittleEndian>(sec)?;
    file.write_u32::<LittleEndian>(usec)?;
    file.write_all(payload)
}

impl UmlRecorder {
    pub fn create(path: &Path) -> Result<Self> {
        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(path)?;
        let tty: u32 = rand::thread_rng().gen_range(1..u32::MAX);
        write_record(&mut file, OP_OPEN, tty, 0, &[])?;
        Ok(UmlRecorder {
            file: Mutex::new(file),
            path: path.to_path_buf(),
            tty,
        })
    }
}

impl SessionRecorder for UmlRecorder {
    fn record(&self, dir: Direction, data: &[u8]) {
        let dir = match dir {
            Direction::Input => DIR_READ,
            Direction::Output => DIR_WRITE,
        };
        let mut file = self
            .file
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        if let Err(e) = write_record(&mut file, OP_WRITE, self.tty, dir, data) {
            warn!(path = %self.path.display(), error = %e, "tty log write failed");
        }
    }

    fn close(&self) {
        let mut file = self
            .file
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        if let Err(e) = write_record(&mut file, OP_CLOSE, self.tty, 0, &[]) {
            warn!(path = %self.path.display(), error = %e, "tty log close failed");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use byteorder::ReadBytesExt;
    use std::io::Read;
    use tempfile::TempDir;

    struct Record {
        op: i32,
        tty: u32,
        dir: i32,
        payload: Vec<u8>,
    }

    fn read_records(path: &Path) -> Vec<Record> {
        let mut file = File::open(path).unwrap();
        let mut records = Vec::new();
        loop {
            let op = match file.read_i32::<LittleEndian>() {
                Ok(v) => v,
                Err(_) => break,
            };
            let tty = file.read_u32::<LittleEndian>().unwrap();
            let len = file.read_i32::<LittleEndian>().unwrap();
            let dir = file.read_i32::<LittleEndian>().unwrap();
            let _sec = file.read_u32::<LittleEndian>().unwrap();
            let _usec = file.read_u32::<LittleEndian>().unwrap();
            let mut payload = vec![0u8; len as usize];
            file.read_exact(&mut payload).unwrap();
            records.push(Record {
                op,
                tty,
                dir,
                payload,
            });
        }
        records
    }

    #[test]
    fn test_record_layout() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("session.uml.log");
        let rec = UmlRecorder::create(&path).unwrap();
        rec.record(Direction::Input, b"id\r");
        rec.record(Direction::Output, b"uid=0(root)\r\n");
        rec.close();

        let records = read_records(&path);
        assert_eq!(records.len(), 4);
        assert_eq!(records[0].op, OP_OPEN);
        let tty = records[0].tty;
        assert!(records.iter().all(|r| r.tty == tty));

        assert_eq!(records[1].op, OP_WRITE);
        assert_eq!(records[1].dir, DIR_READ);
        assert_eq!(records[1].payload, b"id\r");

        assert_eq!(records[2].op, OP_WRITE);
        assert_eq!(records[2].dir, DIR_WRITE);
        assert_eq!(records[2].payload, b"uid=0(root)\r\n");

        assert_eq!(records[3].op, OP_CLOSE);
        assert!(records[3].payload.is_empty());
    }
}
