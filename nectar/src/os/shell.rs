use std::collections::VecDeque;
use std::io;
use std::sync::Arc;
use std::time::Duration;

use futures::FutureExt;
use rand::Rng;
use tokio::io::AsyncReadExt;
use tracing::{error, info, warn};

use super::command::CommandRegistry;
use super::sys::Sys;
use crate::config::Config;

const PROMPT: &str = "$ ";

/// What an unknown-but-listed command "crashes" with.
const FAKE_ERRORS: &[&str] = &["Segmentation fault", "Permission denied"];

/// Jitter radius around the configured process delay, milliseconds.
const DELAY_JITTER_MS: u64 = 500;

enum LineResult {
    Status(i32),
    Exit(i32),
}

enum EscState {
    None,
    Esc,
    Csi,
}

/// The fake shell: a prompt, a line editor over the raw channel stream, and
/// dispatch into the command registry. It never executes anything real.
pub struct Shell {
    sys: Sys,
    registry: Arc<CommandRegistry>,
    config: Arc<Config>,
    pending: VecDeque<u8>,
    esc: EscState,
    skip_lf: bool,
}

impl Shell {
    pub fn new(sys: Sys, registry: Arc<CommandRegistry>, config: Arc<Config>) -> Self {
        Shell {
            sys,
            registry,
            config,
            pending: VecDeque::new(),
            esc: EscState::None,
            skip_lf: false,
        }
    }

    /// Drive the session until the client leaves. The return value becomes
    /// the channel's exit-status.
    pub async fn run(mut self) -> i32 {
        loop {
            if self.sys.write_raw(PROMPT.as_bytes()).await.is_err() {
                return 1;
            }
            let line = match self.read_line().await {
                Ok(Some(line)) => line,
                Ok(None) => {
                    info!("EOF received from client");
                    return 0;
                }
                Err(e) => {
                    warn!(error = %e, "error reading from terminal");
                    return 1;
                }
            };
            if line.trim().is_empty() {
                continue;
            }
            self.simulate_delay().await;
            info!(cmd = %line, "shell command");
            match self.handle_line(&line).await {
                LineResult::Exit(code) => return code,
                LineResult::Status(code) => self.sys.setenv("?", &code.to_string()),
            }
        }
    }

    /// A busy machine doesn't answer instantly.
    async fn simulate_delay(&self) {
        let base = self.config.server.process_delay;
        if base == 0 {
            return;
        }
        let low = base.saturating_sub(DELAY_JITTER_MS);
        let high = base + DELAY_JITTER_MS;
        let ms = rand::thread_rng().gen_range(low..=high);
        tokio::time::sleep(Duration::from_millis(ms)).await;
    }

    async fn handle_line(&mut self, line: &str) -> LineResult {
        let tokens = match shell_words::split(line) {
            Ok(tokens) => tokens,
            Err(_) => {
                let _ = self
                    .sys
                    .write_str("-bash: syntax error: unexpected end of file\n")
                    .await;
                return LineResult::Status(2);
            }
        };

        // Leading VAR=value assignments go straight into the session env.
        let mut idx = 0;
        while idx < tokens.len() && is_assignment(&tokens[idx]) {
            let (name, value) = tokens[idx].split_once('=').unwrap_or((&tokens[idx], ""));
            self.sys.setenv(name, value);
            idx += 1;
        }
        if idx >= tokens.len() {
            return LineResult::Status(0);
        }

        let name = tokens[idx].clone();
        let args = &tokens[idx + 1..];
        match name.as_str() {
            "exit" | "logout" => {
                info!("user logged out");
                LineResult::Exit(0)
            }
            "cd" => {
                let target = args
                    .first()
                    .cloned()
                    .or_else(|| self.sys.getenv("HOME").map(str::to_string))
                    .unwrap_or_else(|| "/".to_string());
                match self.sys.chdir(&target) {
                    Ok(()) => LineResult::Status(0),
                    Err(nectar_vfs::VfsError::NotADirectory) => {
                        let _ = self
                            .sys
                            .write_str(&format!("-bash: cd: {target}: Not a directory\n"))
                            .await;
                        LineResult::Status(1)
                    }
                    Err(_) => {
                        let _ = self
                            .sys
                            .write_str(&format!(
                                "-bash: cd: {target}: No such file or directory\n"
                            ))
                            .await;
                        LineResult::Status(1)
                    }
                }
            }
            "export" => {
                for arg in args {
                    if is_assignment(arg) {
                        let (name, value) = arg.split_once('=').unwrap_or((arg, ""));
                        self.sys.setenv(name, value);
                    }
                }
                LineResult::Status(0)
            }
            _ => LineResult::Status(self.dispatch(&name, args).await),
        }
    }

    async fn dispatch(&mut self, name: &str, args: &[String]) -> i32 {
        if let Some(cmd) = self.registry.lookup(name).cloned() {
            let exec = std::panic::AssertUnwindSafe(cmd.exec(args, &mut self.sys));
            return match exec.catch_unwind().await {
                Ok(code) => code,
                Err(payload) => {
                    error!(
                        cmd = name,
                        args = ?args,
                        panic = panic_message(&payload),
                        "command panicked"
                    );
                    let _ = self.sys.write_str("Segmentation fault\n").await;
                    139
                }
            };
        }
        if self.registry.is_fake(name) {
            let msg = FAKE_ERRORS[rand::thread_rng().gen_range(0..FAKE_ERRORS.len())];
            let _ = self.sys.write_str(&format!("{msg}\n")).await;
            return 1;
        }
        let _ = self
            .sys
            .write_str(&format!("{name}: command not found\n"))
            .await;
        127
    }

    /// Minimal terminal line editing: echo, backspace, ^C, ^D, and skipping
    /// over escape sequences arrow keys produce. Returns `None` on EOF.
    async fn read_line(&mut self) -> io::Result<Option<String>> {
        let mut line: Vec<u8> = Vec::new();
        loop {
            if self.pending.is_empty() {
                let mut buf = [0u8; 512];
                let n = self.sys.input().read(&mut buf).await?;
                if n == 0 {
                    return Ok(None);
                }
                self.pending.extend(&buf[..n]);
            }
            while let Some(b) = self.pending.pop_front() {
                if self.skip_lf {
                    self.skip_lf = false;
                    if b == b'\n' {
                        continue;
                    }
                }
                match self.esc {
                    EscState::Esc => {
                        self.esc = if b == b'[' { EscState::Csi } else { EscState::None };
                        continue;
                    }
                    EscState::Csi => {
                        if (0x40..=0x7e).contains(&b) {
                            self.esc = EscState::None;
                        }
                        continue;
                    }
                    EscState::None => {}
                }
                match b {
                    b'\r' => {
                        self.skip_lf = true;
                        self.sys.write_raw(b"\r\n").await?;
                        return Ok(Some(String::from_utf8_lossy(&line).into_owned()));
                    }
                    b'\n' => {
                        self.sys.write_raw(b"\r\n").await?;
                        return Ok(Some(String::from_utf8_lossy(&line).into_owned()));
                    }
                    0x7f | 0x08 => {
                        if line.pop().is_some() {
                            self.sys.write_raw(b"\x08 \x08").await?;
                        }
                    }
                    0x03 => {
                        self.sys.write_raw(b"^C\r\n").await?;
                        return Ok(Some(String::new()));
                    }
                    0x04 => {
                        if line.is_empty() {
                            return Ok(None);
                        }
                    }
                    0x1b => self.esc = EscState::Esc,
                    b if b >= 0x20 && b != 0x7f => {
                        line.push(b);
                        self.sys.write_raw(&[b]).await?;
                    }
                    _ => {}
                }
            }
        }
    }
}

fn is_assignment(token: &str) -> bool {
    match token.split_once('=') {
        Some((name, _)) => {
            !name.is_empty()
                && !name.starts_with(|c: char| c.is_ascii_digit())
                && name
                    .chars()
                    .all(|c| c.is_ascii_alphanumeric() || c == '_')
        }
        None => false,
    }
}

fn panic_message(payload: &(dyn std::any::Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic".to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::os::command::Command;
    use crate::os::sys::test_support::{read_output, sys_fixture};
    use async_trait::async_trait;
    use tokio::io::AsyncWriteExt;

    fn shell_with(
        registry: CommandRegistry,
    ) -> (
        Shell,
        tokio::io::DuplexStream,
        tokio::io::DuplexStream,
        tempfile::TempDir,
    ) {
        let fx = sys_fixture();
        let shell = Shell::new(fx.sys, Arc::new(registry), Arc::new(Config::default()));
        (shell, fx.input, fx.out, fx.dir)
    }

    #[tokio::test]
    async fn test_builtin_flow_and_exit() {
        let (shell, mut input, mut out, _dir) = shell_with(CommandRegistry::with_builtins());
        let task = tokio::spawn(shell.run());
        input.write_all(b"pwd\rexit\r").await.unwrap();
        let code = task.await.unwrap();
        assert_eq!(code, 0);
        let output = read_output(&mut out).await;
        assert!(output.contains("$ "));
        assert!(output.contains("/home/bob\r\n"));
    }

    #[tokio::test]
    async fn test_eof_quits_zero() {
        let (shell, input, _out, _dir) = shell_with(CommandRegistry::with_builtins());
        let task = tokio::spawn(shell.run());
        drop(input);
        assert_eq!(task.await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_command_not_found() {
        let (shell, mut input, mut out, _dir) = shell_with(CommandRegistry::with_builtins());
        let task = tokio::spawn(shell.run());
        input.write_all(b"nmap -sV target\rexit\r").await.unwrap();
        task.await.unwrap();
        let output = read_output(&mut out).await;
        assert!(output.contains("nmap: command not found\r\n"));
    }

    #[tokio::test]
    async fn test_fake_command_errors() {
        let dir = tempfile::TempDir::new().unwrap();
        let list = dir.path().join("commands.txt");
        std::fs::write(&list, "telnet\n").unwrap();
        let mut registry = CommandRegistry::with_builtins();
        registry.load_fake_commands(&list);

        let (shell, mut input, mut out, _dir) = shell_with(registry);
        let task = tokio::spawn(shell.run());
        input.write_all(b"telnet host 25\rexit\r").await.unwrap();
        task.await.unwrap();
        let output = read_output(&mut out).await;
        assert!(
            output.contains("Segmentation fault\r\n") || output.contains("Permission denied\r\n")
        );
    }

    #[tokio::test]
    async fn test_cd_changes_cwd_and_reports_missing() {
        let (shell, mut input, mut out, _dir) = shell_with(CommandRegistry::with_builtins());
        let task = tokio::spawn(shell.run());
        input
            .write_all(b"cd /bin\rpwd\rcd /nope\rpwd\rexit\r")
            .await
            .unwrap();
        task.await.unwrap();
        let output = read_output(&mut out).await;
        assert!(output.contains("-bash: cd: /nope: No such file or directory\r\n"));
        // pwd reports /bin both before and after the failed cd
        assert_eq!(output.matches("pwd\r\n/bin\r\n").count(), 2);
    }

    #[tokio::test]
    async fn test_env_assignment_prefix() {
        struct PrintFoo;
        #[async_trait]
        impl Command for PrintFoo {
            fn name(&self) -> &'static str {
                "printfoo"
            }
            fn where_path(&self) -> &'static str {
                "/usr/bin/printfoo"
            }
            async fn exec(&self, _args: &[String], sys: &mut Sys) -> i32 {
                let v = sys.getenv("FOO").unwrap_or("unset").to_string();
                let _ = sys.write_str(&format!("{v}\n")).await;
                0
            }
        }
        let mut registry = CommandRegistry::with_builtins();
        registry.register(Arc::new(PrintFoo));
        let (shell, mut input, mut out, _dir) = shell_with(registry);
        let task = tokio::spawn(shell.run());
        input
            .write_all(b"FOO=bar printfoo\rexit\r")
            .await
            .unwrap();
        task.await.unwrap();
        let output = read_output(&mut out).await;
        assert!(output.contains("bar\r\n"));
    }

    #[tokio::test]
    async fn test_backspace_editing() {
        let (shell, mut input, mut out, _dir) = shell_with(CommandRegistry::with_builtins());
        let task = tokio::spawn(shell.run());
        // "pwq" + backspace + "d" → pwd
        input.write_all(b"pwq\x7fd\rexit\r").await.unwrap();
        task.await.unwrap();
        let output = read_output(&mut out).await;
        assert!(output.contains("/home/bob\r\n"));
    }

    #[tokio::test]
    async fn test_panicking_command_is_contained() {
        struct Boom;
        #[async_trait]
        impl Command for Boom {
            fn name(&self) -> &'static str {
                "boom"
            }
            fn where_path(&self) -> &'static str {
                "/usr/bin/boom"
            }
            async fn exec(&self, _args: &[String], _sys: &mut Sys) -> i32 {
                panic!("boom goes the honeypot");
            }
        }
        let mut registry = CommandRegistry::with_builtins();
        registry.register(Arc::new(Boom));
        let (shell, mut input, mut out, _dir) = shell_with(registry);
        let task = tokio::spawn(shell.run());
        input.write_all(b"boom\rpwd\rexit\r").await.unwrap();
        task.await.unwrap();
        let output = read_output(&mut out).await;
        assert!(output.contains("Segmentation fault\r\n"));
        // the shell survives the panic
        assert!(output.contains("/home/bob\r\n"));
    }

    #[test]
    fn test_is_assignment() {
        assert!(is_assignment("FOO=bar"));
        assert!(is_assignment("_X="));
        assert!(!is_assignment("1X=2"));
        assert!(!is_assignment("ls"));
        assert!(!is_assignment("=x"));
    }
}
