use std::io::Read;

use async_trait::async_trait;
use nectar_vfs::VfsError;
use tokio::io::AsyncReadExt;

use super::Command;
use crate::os::sys::Sys;

pub struct Cat;

#[async_trait]
impl Command for Cat {
    fn name(&self) -> &'static str {
        "cat"
    }

    fn where_path(&self) -> &'static str {
        "/bin/cat"
    }

    async fn exec(&self, args: &[String], sys: &mut Sys) -> i32 {
        if args.is_empty() {
            // Echo stdin back until EOF or ^D, like cat on a terminal.
            let mut buf = [0u8; 4096];
            loop {
                let n = match sys.input().read(&mut buf).await {
                    Ok(0) | Err(_) => return 0,
                    Ok(n) => n,
                };
                let chunk = &buf[..n];
                if let Some(pos) = chunk.iter().position(|&b| b == 0x04) {
                    let _ = sys.write_bytes(&chunk[..pos]).await;
                    return 0;
                }
                if sys.write_bytes(chunk).await.is_err() {
                    return 0;
                }
            }
        }

        let mut status = 0;
        for arg in args {
            let path = sys.resolve(arg);
            match sys.fs.open(&path) {
                Ok(mut file) => {
                    let mut body = Vec::new();
                    if let Err(e) = file.read_to_end(&mut body) {
                        let _ = sys.write_str(&format!("cat: {arg}: {e}\n")).await;
                        status = 1;
                        continue;
                    }
                    let _ = sys.write_bytes(&body).await;
                }
                Err(VfsError::IsADirectory) => {
                    let _ = sys.write_str(&format!("cat: {arg}: Is a directory\n")).await;
                    status = 1;
                }
                Err(VfsError::PermissionDenied) => {
                    let _ = sys
                        .write_str(&format!("cat: {arg}: Permission denied\n"))
                        .await;
                    status = 1;
                }
                Err(_) => {
                    let _ = sys
                        .write_str(&format!("cat: {arg}: No such file or directory\n"))
                        .await;
                    status = 1;
                }
            }
        }
        status
    }
}
