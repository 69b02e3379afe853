use async_trait::async_trait;
use nectar_vfs::Metadata;

use super::Command;
use crate::os::sys::Sys;

pub struct Ls;

struct Flags {
    long: bool,
    all: bool,
}

fn parse_flags(args: &[String]) -> (Flags, Vec<String>) {
    let mut flags = Flags {
        long: false,
        all: false,
    };
    let mut paths = Vec::new();
    for arg in args {
        if let Some(cluster) = arg.strip_prefix('-') {
            if !arg.starts_with("--") {
                for ch in cluster.chars() {
                    match ch {
                        'l' => flags.long = true,
                        'a' => flags.all = true,
                        _ => {}
                    }
                }
                continue;
            }
        }
        paths.push(arg.clone());
    }
    (flags, paths)
}

fn long_line(meta: &Metadata, sys: &Sys) -> String {
    let owner = sys.accounts.user_name(meta.uid);
    let group = sys.accounts.group_name(meta.gid);
    let when = chrono::DateTime::from_timestamp(meta.mtime, 0)
        .map(|t| t.format("%b %d %H:%M").to_string())
        .unwrap_or_else(|| "Jan 01 00:00".to_string());
    format!(
        "{}    1 {:<8} {:<8} {:>8} {} {}",
        meta.mode_string(),
        owner,
        group,
        meta.size,
        when,
        meta.name
    )
}

#[async_trait]
impl Command for Ls {
    fn name(&self) -> &'static str {
        "ls"
    }

    fn where_path(&self) -> &'static str {
        "/bin/ls"
    }

    async fn exec(&self, args: &[String], sys: &mut Sys) -> i32 {
        let (flags, paths) = parse_flags(args);
        let shown = paths
            .first()
            .map(|p| sys.resolve(p))
            .unwrap_or_else(|| sys.getcwd().to_string());

        let entries = match sys.fs.stat(&shown) {
            Ok(meta) if !meta.is_dir() => vec![meta],
            Ok(_) => match sys.fs.read_dir(&shown) {
                Ok(list) => list,
                Err(_) => {
                    let arg = paths.first().cloned().unwrap_or(shown);
                    let _ = sys
                        .write_str(&format!(
                            "ls: cannot access {arg}: No such file or directory\n"
                        ))
                        .await;
                    return 2;
                }
            },
            Err(_) => {
                let arg = paths.first().cloned().unwrap_or(shown);
                let _ = sys
                    .write_str(&format!(
                        "ls: cannot access {arg}: No such file or directory\n"
                    ))
                    .await;
                return 2;
            }
        };

        let entries: Vec<Metadata> = entries
            .into_iter()
            .filter(|m| flags.all || !m.name.starts_with('.'))
            .collect();
        if entries.is_empty() {
            return 0;
        }

        if flags.long {
            let mut out = String::new();
            for meta in &entries {
                out.push_str(&long_line(meta, sys));
                out.push('\n');
            }
            let _ = sys.write_str(&out).await;
            return 0;
        }

        // Multi-column layout sized from the longest name and the terminal
        // width.
        let maxlen = entries.iter().map(|m| m.name.len()).max().unwrap_or(1);
        let per_row = (sys.width() as usize / (maxlen + 1)).saturating_sub(1).max(1);
        let mut out = String::new();
        for (i, meta) in entries.iter().enumerate() {
            out.push_str(&meta.name);
            out.push_str(&" ".repeat(maxlen - meta.name.len() + 2));
            if (i + 1) % per_row == 0 {
                out.push('\n');
            }
        }
        if !out.ends_with('\n') {
            out.push('\n');
        }
        let _ = sys.write_str(&out).await;
        0
    }
}
