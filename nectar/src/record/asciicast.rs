use std::fs::{File, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};

use anyhow::Result;
use serde::Serialize;
use tracing::{info, warn};

use super::{Direction, SessionRecorder};

/// Sessions shorter than this are considered noise and never uploaded.
const MIN_UPLOAD_DURATION: Duration = Duration::from_secs(5);
const UPLOAD_TIMEOUT: Duration = Duration::from_secs(10);
const UPLOAD_USER: &str = "syrupSSH";

#[derive(Serialize)]
struct Header<'a> {
    version: u32,
    width: u32,
    height: u32,
    timestamp: u64,
    title: &'a str,
    env: HeaderEnv<'a>,
}

#[derive(Serialize)]
struct HeaderEnv<'a> {
    #[serde(rename = "TERM")]
    term: &'a str,
    #[serde(rename = "SHELL")]
    shell: &'a str,
}

#[derive(Clone)]
pub struct Upload {
    pub endpoint: String,
    pub api_key: String,
}

/// Asciicast v2 transcript: a JSON header line followed by
/// `[elapsed, "i"|"o", data]` event lines.
pub struct AsciicastRecorder {
    file: Mutex<File>,
    path: PathBuf,
    started: Instant,
    upload: Option<Upload>,
}

impl AsciicastRecorder {
    pub fn create(
        path: &Path,
        width: u32,
        height: u32,
        term: &str,
        title: &str,
        upload: Option<Upload>,
    ) -> Result<Self> {
        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(path)?;
        let header = Header {
            version: 2,
            width,
            height,
            timestamp: SystemTime::now()
                .duration_since(UNIX_EPOCH)
                .unwrap_or_default()
                .as_secs(),
            title,
            env: HeaderEnv {
                term,
                shell: "/bin/bash",
            },
        };
        let mut line = serde_json::to_vec(&header)?;
        line.extend_from_slice(b"\r\n");
        file.write_all(&line)?;
        Ok(AsciicastRecorder {
            file: Mutex::new(file),
            path: path.to_path_buf(),
            started: Instant::now(),
            upload,
        })
    }

    fn append(&self, dir: Direction, data: &[u8]) -> std::io::Result<()> {
        let elapsed = self.started.elapsed().as_secs_f64();
        let kind = match dir {
            Direction::Input => "i",
            Direction::Output => "o",
        };
        let quoted = serde_json::to_string(&String::from_utf8_lossy(data))
            .unwrap_or_else(|_| "\"\"".to_string());
        let line = format!("[{elapsed:.6}, \"{kind}\", {quoted}]\r\n");
        let mut file = self
            .file
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        file.write_all(line.as_bytes())
    }
}

impl SessionRecorder for AsciicastRecorder {
    fn record(&self, dir: Direction, data: &[u8]) {
        if let Err(e) = self.append(dir, data) {
            warn!(path = %self.path.display(), error = %e, "transcript write failed");
        }
    }

    fn close(&self) {
        let duration = self.started.elapsed();
        let Some(upload) = self.upload.clone() else {
            return;
        };
        if duration < MIN_UPLOAD_DURATION {
            return;
        }
        let path = self.path.clone();
        tokio::spawn(async move {
            if let Err(e) = post_cast(&upload, &path).await {
                warn!(path = %path.display(), error = %e, "asciicast upload failed");
            }
        });
    }
}

async fn post_cast(upload: &Upload, path: &Path) -> Result<()> {
    let body = tokio::fs::read(path).await?;
    let file_name = path
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_else(|| "session.cast".to_string());
    let form = reqwest::multipart::Form::new().part(
        "asciicast",
        reqwest::multipart::Part::bytes(body).file_name(file_name),
    );
    let url = format!("{}/api/asciicasts", upload.endpoint.trim_end_matches('/'));
    let client = reqwest::Client::builder().timeout(UPLOAD_TIMEOUT).build()?;
    let resp = client
        .post(&url)
        .basic_auth(UPLOAD_USER, Some(&upload.api_key))
        .multipart(form)
        .send()
        .await?;
    let status = resp.status();
    let reply = resp.text().await.unwrap_or_default();
    info!(%status, reply = %reply.trim(), "asciicast uploaded");
    Ok(())
}
