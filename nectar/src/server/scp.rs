use std::io::{Read, Write};
use std::sync::Arc;

use nectar_vfs::{clean_path, OverlayFs};
use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, BufReader};
use tracing::{debug, info, warn};

const SCP_OK: u8 = 0x00;
const SCP_ERR: u8 = 0x01;

struct ScpArgs {
    sink: bool,
    source: bool,
    recursive: bool,
    target: String,
}

fn parse_args(args: &[String]) -> Option<ScpArgs> {
    let mut parsed = ScpArgs {
        sink: false,
        source: false,
        recursive: false,
        target: String::new(),
    };
    for arg in args {
        if arg.starts_with('-') && arg.len() > 1 && !arg.starts_with("--") {
            for ch in arg[1..].chars() {
                match ch {
                    't' => parsed.sink = true,
                    'f' => parsed.source = true,
                    'r' => parsed.recursive = true,
                    // -p/-d/-v/-q change nothing we emulate
                    _ => {}
                }
            }
        } else if parsed.target.is_empty() {
            parsed.target = arg.clone();
        }
    }
    if parsed.target.is_empty() {
        return None;
    }
    parsed.target = clean_path("/", &parsed.target);
    Some(parsed)
}

/// Run one `scp` exec request over the channel stream. Returns the exit
/// status to report on the channel. `receive_limit` of 0 disables the
/// upload size cap.
pub async fn run<S>(stream: S, args: Vec<String>, fs: Arc<OverlayFs>, receive_limit: u64) -> i32
where
    S: AsyncRead + AsyncWrite + Unpin + Send,
{
    let Some(parsed) = parse_args(&args) else {
        return 1;
    };
    // Exactly one of sink/source must be set.
    if parsed.sink == parsed.source {
        return 1;
    }
    let (read_half, write_half) = tokio::io::split(stream);
    let mut conn = ScpConn {
        reader: BufReader::new(read_half),
        writer: write_half,
        fs,
    };
    if parsed.sink {
        conn.sink(&parsed.target, receive_limit).await
    } else {
        conn.source(&parsed.target, parsed.recursive).await
    }
}

struct ScpConn<R, W> {
    reader: BufReader<R>,
    writer: W,
    fs: Arc<OverlayFs>,
}

impl<R, W> ScpConn<R, W>
where
    R: AsyncRead + Unpin + Send,
    W: AsyncWrite + Unpin + Send,
{
    async fn reply(&mut self, code: u8) {
        debug!(code, "scp reply");
        let _ = self.writer.write_all(&[code]).await;
        let _ = self.writer.flush().await;
    }

    /// Receive files from the client, OpenSSH "sink" protocol.
    async fn sink(&mut self, target: &str, limit: u64) -> i32 {
        self.reply(SCP_OK).await;
        let mut cwd = target.to_string();
        let mut depth = 0usize;
        loop {
            let mut line = Vec::new();
            match self.reader.read_until(b'\n', &mut line).await {
                Ok(0) => return 0,
                Ok(_) => {}
                Err(e) => {
                    warn!(error = %e, "scp sink read failed");
                    return 1;
                }
            }
            let text = String::from_utf8_lossy(&line);
            let text = text.trim_end_matches('\n');
            match text.bytes().next() {
                Some(b'C') => {
                    let fields: Vec<&str> = text.splitn(3, ' ').collect();
                    if fields.len() < 3 {
                        self.reply(SCP_ERR).await;
                        continue;
                    }
                    let mode = u32::from_str_radix(&fields[0][1..], 8).ok();
                    let size: Option<u64> = fields[1].parse().ok();
                    let (Some(_mode), Some(size)) = (mode, size) else {
                        self.reply(SCP_ERR).await;
                        continue;
                    };
                    if limit > 0 && size > limit {
                        info!(name = fields[2], size, limit, "scp upload over size limit");
                        self.reply(SCP_ERR).await;
                        continue;
                    }
                    let dest = if depth > 0 || self.fs.is_dir(&cwd) {
                        clean_path(&cwd, fields[2])
                    } else {
                        cwd.clone()
                    };
                    let mut file = match self.fs.create(&dest) {
                        Ok(f) => f,
                        Err(e) => {
                            warn!(path = %dest, error = %e, "scp sink open failed");
                            self.reply(SCP_ERR).await;
                            continue;
                        }
                    };
                    self.reply(SCP_OK).await;
                    if let Err(e) = self.copy_exactly(&mut file, size).await {
                        warn!(path = %dest, error = %e, "scp sink copy failed");
                        self.reply(SCP_ERR).await;
                        continue;
                    }
                    drop(file);
                    info!(path = %dest, size, "scp upload captured");
                    // Discard the NUL the client sends after the payload.
                    let mut nul = [0u8; 1];
                    let _ = self.reader.read_exact(&mut nul).await;
                    self.reply(SCP_OK).await;
                }
                Some(b'D') => {
                    let fields: Vec<&str> = text.splitn(3, ' ').collect();
                    if fields.len() < 3 {
                        self.reply(SCP_ERR).await;
                        continue;
                    }
                    cwd = clean_path(&cwd, fields[2]);
                    depth += 1;
                    if let Err(e) = self.fs.mkdir_all(&cwd) {
                        warn!(path = %cwd, error = %e, "scp sink mkdir failed");
                        self.reply(SCP_ERR).await;
                        continue;
                    }
                    info!(path = %cwd, "scp directory created");
                    self.reply(SCP_OK).await;
                }
                Some(b'E') => {
                    cwd = clean_path(&cwd, "..");
                    depth = depth.saturating_sub(1);
                    self.reply(SCP_OK).await;
                }
                Some(b'T') => self.reply(SCP_OK).await,
                _ => self.reply(SCP_ERR).await,
            }
        }
    }

    async fn copy_exactly(
        &mut self,
        file: &mut nectar_vfs::FileHandle,
        size: u64,
    ) -> std::io::Result<()> {
        let mut remaining = size;
        let mut buf = [0u8; 8192];
        while remaining > 0 {
            let want = remaining.min(buf.len() as u64) as usize;
            let n = self.reader.read(&mut buf[..want]).await?;
            if n == 0 {
                return Err(std::io::ErrorKind::UnexpectedEof.into());
            }
            file.write_all(&buf[..n])?;
            remaining -= n as u64;
        }
        Ok(())
    }

    /// Wait for the peer's one-byte ack; anything non-zero aborts the walk.
    async fn await_ack(&mut self) -> bool {
        let mut ack = [0u8; 1];
        match self.reader.read(&mut ack).await {
            Ok(1) if ack[0] == SCP_OK => true,
            Ok(0) => true, // EOF counts as accepted, matching openssh scp
            _ => false,
        }
    }

    /// Send files to the client, OpenSSH "source" protocol.
    async fn source(&mut self, target: &str, recursive: bool) -> i32 {
        if recursive {
            let items = match self.fs.walk(target) {
                Ok(items) => items,
                Err(_) => {
                    self.reply(SCP_ERR).await;
                    return 1;
                }
            };
            // Track the open directory chain; leaving a subtree emits E.
            let mut stack: Vec<String> = Vec::new();
            for (path, meta) in items {
                while let Some(top) = stack.last() {
                    if path.starts_with(&format!("{}/", top)) || path == *top {
                        break;
                    }
                    self.send_line("E\n").await;
                    if !self.await_ack().await {
                        return 1;
                    }
                    stack.pop();
                }
                if meta.is_dir() {
                    self.send_line(&format!("D{:04o} 0 {}\n", meta.permissions(), meta.name))
                        .await;
                    if !self.await_ack().await {
                        return 1;
                    }
                    stack.push(path);
                } else if !self.send_file(&path).await {
                    return 1;
                }
            }
            while stack.pop().is_some() {
                self.send_line("E\n").await;
                if !self.await_ack().await {
                    return 1;
                }
            }
            0
        } else {
            match self.fs.stat(target) {
                Ok(meta) if !meta.is_dir() => {
                    if self.send_file(target).await {
                        0
                    } else {
                        1
                    }
                }
                _ => {
                    self.reply(SCP_ERR).await;
                    1
                }
            }
        }
    }

    async fn send_line(&mut self, line: &str) {
        debug!(line = line.trim_end(), "scp send");
        let _ = self.writer.write_all(line.as_bytes()).await;
        let _ = self.writer.flush().await;
    }

    async fn send_file(&mut self, path: &str) -> bool {
        let Ok(meta) = self.fs.stat(path) else {
            self.reply(SCP_ERR).await;
            return false;
        };
        let Ok(mut file) = self.fs.open(path) else {
            self.reply(SCP_ERR).await;
            return false;
        };
        self.send_line(&format!(
            "C{:04o} {} {}\n",
            meta.permissions(),
            meta.size,
            meta.name
        ))
        .await;
        info!(path = %path, size = meta.size, "scp download served");
        if !self.await_ack().await {
            return false;
        }
        let mut buf = [0u8; 8192];
        loop {
            let n = match file.read(&mut buf) {
                Ok(0) => break,
                Ok(n) => n,
                Err(_) => return false,
            };
            if self.writer.write_all(&buf[..n]).await.is_err() {
                return false;
            }
        }
        self.reply(SCP_OK).await;
        self.await_ack().await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::os::sys::test_support::sys_fixture;
    use std::io::Read as _;

    #[tokio::test]
    async fn test_sink_receives_file() {
        let fx = sys_fixture();
        let fs = fx.sys.fs.clone();
        let (server, mut client) = tokio::io::duplex(16 * 1024);
        let args = vec!["-t".to_string(), "/home/bob".to_string()];
        let task = tokio::spawn(run(server, args, fs.clone(), 0));

        let mut ack = [0u8; 1];
        client.read_exact(&mut ack).await.unwrap();
        assert_eq!(ack[0], SCP_OK);

        client.write_all(b"C0644 6 x.txt\n").await.unwrap();
        client.read_exact(&mut ack).await.unwrap();
        assert_eq!(ack[0], SCP_OK);
        client.write_all(b"hello\n\0").await.unwrap();
        client.read_exact(&mut ack).await.unwrap();
        assert_eq!(ack[0], SCP_OK);
        drop(client);

        assert_eq!(task.await.unwrap(), 0);
        let mut body = String::new();
        fs.open("/home/bob/x.txt")
            .unwrap()
            .read_to_string(&mut body)
            .unwrap();
        assert_eq!(body, "hello\n");
    }

    #[tokio::test]
    async fn test_sink_rejects_oversized_file() {
        let fx = sys_fixture();
        let fs = fx.sys.fs.clone();
        let (server, mut client) = tokio::io::duplex(16 * 1024);
        let args = vec!["-t".to_string(), "/home/bob/big".to_string()];
        let task = tokio::spawn(run(server, args, fs.clone(), 1024));

        let mut ack = [0u8; 1];
        client.read_exact(&mut ack).await.unwrap();
        assert_eq!(ack[0], SCP_OK);

        client.write_all(b"C0644 2048 big\n").await.unwrap();
        client.read_exact(&mut ack).await.unwrap();
        assert_eq!(ack[0], SCP_ERR);
        drop(client);

        assert_eq!(task.await.unwrap(), 0);
        assert!(!fs.exists("/home/bob/big"));
    }

    #[tokio::test]
    async fn test_sink_directory_records() {
        let fx = sys_fixture();
        let fs = fx.sys.fs.clone();
        let (server, mut client) = tokio::io::duplex(16 * 1024);
        let args = vec![
            "-t".to_string(),
            "-r".to_string(),
            "/home/bob".to_string(),
        ];
        let task = tokio::spawn(run(server, args, fs.clone(), 0));

        let mut ack = [0u8; 1];
        client.read_exact(&mut ack).await.unwrap();
        client.write_all(b"D0755 0 loot\n").await.unwrap();
        client.read_exact(&mut ack).await.unwrap();
        assert_eq!(ack[0], SCP_OK);
        client.write_all(b"C0644 2 f\n").await.unwrap();
        client.read_exact(&mut ack).await.unwrap();
        client.write_all(b"ab\0").await.unwrap();
        client.read_exact(&mut ack).await.unwrap();
        client.write_all(b"E\n").await.unwrap();
        client.read_exact(&mut ack).await.unwrap();
        drop(client);

        assert_eq!(task.await.unwrap(), 0);
        assert!(fs.is_dir("/home/bob/loot"));
        let mut body = String::new();
        fs.open("/home/bob/loot/f")
            .unwrap()
            .read_to_string(&mut body)
            .unwrap();
        assert_eq!(body, "ab");
    }

    #[tokio::test]
    async fn test_source_sends_single_file() {
        let fx = sys_fixture();
        let fs = fx.sys.fs.clone();
        let (server, mut client) = tokio::io::duplex(16 * 1024);
        let args = vec!["-f".to_string(), "/home/bob/notes.txt".to_string()];
        let task = tokio::spawn(run(server, args, fs, 0));

        let header = {
            let mut reader = BufReader::new(&mut client);
            let mut header = Vec::new();
            reader.read_until(b'\n', &mut header).await.unwrap();
            String::from_utf8(header).unwrap()
        };
        assert_eq!(header, "C0644 18 notes.txt\n");

        client.write_all(&[SCP_OK]).await.unwrap();
        let mut payload = vec![0u8; 19]; // body + trailing NUL
        client.read_exact(&mut payload).await.unwrap();
        assert_eq!(&payload[..18], b"remember the milk\n");
        assert_eq!(payload[18], 0);
        client.write_all(&[SCP_OK]).await.unwrap();

        assert_eq!(task.await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_requires_exactly_one_mode() {
        let fx = sys_fixture();
        let fs = fx.sys.fs.clone();
        let (server, _client) = tokio::io::duplex(1024);
        let args = vec![
            "-t".to_string(),
            "-f".to_string(),
            "/tmp/x".to_string(),
        ];
        assert_eq!(run(server, args, fs, 0).await, 1);
    }
}
