use std::io::Write;
use std::time::Duration;

use async_trait::async_trait;
use tracing::info;

use super::Command;
use crate::os::sys::Sys;

/// Fetched bodies are captured for analysis but never unbounded.
const MAX_BODY: usize = 8 * 1024 * 1024;
const FETCH_TIMEOUT: Duration = Duration::from_secs(30);

const MISSING_URL: &str = "wget: missing URL\nUsage: wget [OPTION]... [URL]...\n\nTry `wget --help' for more options.\n";

pub struct Wget;

fn timestamp() -> String {
    chrono::Local::now().format("%Y-%m-%d %H:%M:%S").to_string()
}

fn host_of(url: &str) -> String {
    let rest = url.split("://").nth(1).unwrap_or(url);
    rest.split(['/', '?']).next().unwrap_or(rest).to_string()
}

/// Output name the way GNU wget picks it: the last path segment, falling
/// back to `index.html`.
fn derive_output(url: &str) -> String {
    let rest = url.split("://").nth(1).unwrap_or(url);
    let path = rest.split(['?', '#']).next().unwrap_or(rest);
    let last = path.split('/').next_back().unwrap_or("");
    if last.is_empty() || !path.contains('/') {
        "index.html".to_string()
    } else {
        last.to_string()
    }
}

#[async_trait]
impl Command for Wget {
    fn name(&self) -> &'static str {
        "wget"
    }

    fn where_path(&self) -> &'static str {
        "/usr/bin/wget"
    }

    async fn exec(&self, args: &[String], sys: &mut Sys) -> i32 {
        let mut output: Option<String> = None;
        let mut url: Option<String> = None;
        let mut iter = args.iter();
        while let Some(arg) = iter.next() {
            if arg == "-O" || arg == "--output-document" {
                output = iter.next().cloned();
            } else if let Some(rest) = arg.strip_prefix("-O") {
                output = Some(rest.to_string());
            } else if arg.starts_with('-') {
                // quiet/verbose/retry knobs change nothing we emulate
            } else {
                url = Some(arg.clone());
            }
        }

        let Some(mut url) = url else {
            let _ = sys.write_str(MISSING_URL).await;
            return 1;
        };
        if !url.contains("://") {
            url = format!("http://{url}");
        }
        let scheme = url.split("://").next().unwrap_or("").to_string();
        if scheme != "http" && scheme != "https" {
            let _ = sys
                .write_str(&format!("{url}: Unsupported scheme '{scheme}'.\n"))
                .await;
            return 1;
        }

        let host = host_of(&url);
        let _ = sys.write_str(&format!("--{}--  {}\n", timestamp(), url)).await;
        let _ = sys
            .write_str(&format!("Resolving {host}... connected.\n"))
            .await;

        // The fetch is real on purpose: the dropped payload is the evidence
        // defenders are after.
        info!(url = %url, "outbound wget fetch");
        let client = match reqwest::Client::builder().timeout(FETCH_TIMEOUT).build() {
            Ok(c) => c,
            Err(_) => return 4,
        };
        let resp = match client.get(&url).send().await {
            Ok(r) => r,
            Err(e) => {
                let _ = sys
                    .write_str(&format!(
                        "wget: unable to resolve host address '{host}'\n"
                    ))
                    .await;
                info!(url = %url, error = %e, "wget fetch failed");
                return 4;
            }
        };

        let status = resp.status();
        let _ = sys
            .write_str(&format!(
                "HTTP request sent, awaiting response... {} {}\n",
                status.as_u16(),
                status.canonical_reason().unwrap_or("")
            ))
            .await;
        if !status.is_success() {
            let _ = sys
                .write_str(&format!(
                    "{} ERROR {}: {}.\n",
                    timestamp(),
                    status.as_u16(),
                    status.canonical_reason().unwrap_or("error")
                ))
                .await;
            return 8;
        }

        let content_type = resp
            .headers()
            .get(reqwest::header::CONTENT_TYPE)
            .and_then(|v| v.to_str().ok())
            .unwrap_or("application/octet-stream")
            .to_string();
        let mut body = match resp.bytes().await {
            Ok(b) => b.to_vec(),
            Err(e) => {
                info!(url = %url, error = %e, "wget body read failed");
                return 4;
            }
        };
        body.truncate(MAX_BODY);

        let out_name = output.unwrap_or_else(|| derive_output(&url));
        let _ = sys
            .write_str(&format!(
                "Length: {} [{}]\nSaving to: '{}'\n\n",
                body.len(),
                content_type,
                out_name
            ))
            .await;

        let dest = sys.resolve(&out_name);
        match sys.fs.create(&dest) {
            Ok(mut file) => {
                if let Err(e) = file.write_all(&body) {
                    let _ = sys
                        .write_str(&format!("wget: {out_name}: write failed\n"))
                        .await;
                    info!(dest = %dest, error = %e, "wget save failed");
                    return 3;
                }
            }
            Err(e) => {
                let _ = sys
                    .write_str(&format!("{out_name}: Permission denied\n"))
                    .await;
                info!(dest = %dest, error = %e, "wget open failed");
                return 3;
            }
        }
        info!(url = %url, dest = %dest, size = body.len(), "wget payload captured");
        let _ = sys
            .write_str(&format!(
                "{} ({} KB/s) - '{}' saved [{}/{}]\n\n",
                timestamp(),
                1024,
                out_name,
                body.len(),
                body.len()
            ))
            .await;
        0
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::os::sys::test_support::{read_output, sys_fixture};

    #[test]
    fn test_derive_output() {
        assert_eq!(derive_output("http://evil.example/payload.sh"), "payload.sh");
        assert_eq!(derive_output("http://evil.example/"), "index.html");
        assert_eq!(derive_output("http://evil.example"), "index.html");
        assert_eq!(
            derive_output("http://evil.example/a/b.bin?x=1"),
            "b.bin"
        );
    }

    #[test]
    fn test_host_of() {
        assert_eq!(host_of("http://evil.example:8080/x"), "evil.example:8080");
        assert_eq!(host_of("https://evil.example"), "evil.example");
    }

    #[tokio::test]
    async fn test_missing_url() {
        let mut fx = sys_fixture();
        assert_eq!(Wget.exec(&[], &mut fx.sys).await, 1);
        let out = read_output(&mut fx.out).await;
        assert!(out.starts_with("wget: missing URL"));
    }

    #[tokio::test]
    async fn test_unsupported_scheme() {
        let mut fx = sys_fixture();
        let args = vec!["ftp://mirror.example/tool".to_string()];
        assert_eq!(Wget.exec(&args, &mut fx.sys).await, 1);
        let out = read_output(&mut fx.out).await;
        assert!(out.contains("Unsupported scheme 'ftp'"));
    }
}
