use std::collections::{HashMap, HashSet};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use async_trait::async_trait;
use tracing::{debug, warn};

use super::sys::Sys;

mod cat;
mod echo;
mod id;
mod ls;
mod pwd;
mod uname;
mod uptime;
mod wget;
mod whoami;

/// A simulated executable. Commands only see the world through [`Sys`].
#[async_trait]
pub trait Command: Send + Sync {
    fn name(&self) -> &'static str;

    /// The fake absolute path the binary pretends to live at.
    fn where_path(&self) -> &'static str;

    fn help(&self) -> &'static str {
        ""
    }

    async fn exec(&self, args: &[String], sys: &mut Sys) -> i32;
}

/// All commands a session can run: real simulations, canned outputs, and
/// the fake-command list that only produces error strings. Populated once at
/// startup and immutable afterwards.
#[derive(Default)]
pub struct CommandRegistry {
    commands: HashMap<String, Arc<dyn Command>>,
    fake: HashSet<String>,
}

impl CommandRegistry {
    /// Registry with every built-in simulation installed under both its
    /// name and its `where` path.
    pub fn with_builtins() -> Self {
        let mut registry = CommandRegistry::default();
        registry.register(Arc::new(ls::Ls));
        registry.register(Arc::new(cat::Cat));
        registry.register(Arc::new(pwd::Pwd));
        registry.register(Arc::new(id::Id));
        registry.register(Arc::new(whoami::Whoami));
        registry.register(Arc::new(uname::Uname));
        registry.register(Arc::new(uptime::Uptime));
        registry.register(Arc::new(wget::Wget));
        registry.register(Arc::new(echo::Echo));
        registry
    }

    pub fn register(&mut self, cmd: Arc<dyn Command>) {
        self.commands
            .insert(cmd.name().to_string(), Arc::clone(&cmd));
        self.commands.insert(cmd.where_path().to_string(), cmd);
    }

    /// Load the fake-command list: one command name per line. A missing
    /// file simply leaves the list empty.
    pub fn load_fake_commands(&mut self, path: &Path) {
        let Ok(contents) = std::fs::read_to_string(path) else {
            warn!(path = %path.display(), "command list not found, fake commands disabled");
            return;
        };
        for line in contents.lines() {
            let name = line.trim();
            if !name.is_empty() {
                self.fake.insert(name.to_string());
            }
        }
        debug!(count = self.fake.len(), "fake commands registered");
    }

    /// Register a canned-output command for every file in `dir`; running the
    /// command prints the file contents verbatim.
    pub fn load_canned_outputs(&mut self, dir: &Path) {
        let Ok(entries) = std::fs::read_dir(dir) else {
            return;
        };
        for entry in entries.flatten() {
            let path = entry.path();
            if !path.is_file() {
                continue;
            }
            if let Some(name) = path.file_name().and_then(|n| n.to_str()) {
                self.commands
                    .insert(name.to_string(), Arc::new(CannedOutput::new(name, &path)));
            }
        }
    }

    /// Resolve a typed command: exact name or `where` path first, then the
    /// path's basename.
    pub fn lookup(&self, token: &str) -> Option<&Arc<dyn Command>> {
        if let Some(cmd) = self.commands.get(token) {
            return Some(cmd);
        }
        let base = token.rsplit('/').next()?;
        self.commands.get(base)
    }

    pub fn is_fake(&self, token: &str) -> bool {
        let base = token.rsplit('/').next().unwrap_or(token);
        self.fake.contains(token) || self.fake.contains(base)
    }
}

/// A command whose entire behavior is replaying a captured output file.
struct CannedOutput {
    name: &'static str,
    path: PathBuf,
}

impl CannedOutput {
    fn new(name: &str, path: &Path) -> Self {
        // Names live for the process lifetime, like the registry itself.
        CannedOutput {
            name: Box::leak(name.to_string().into_boxed_str()),
            path: path.to_path_buf(),
        }
    }
}

#[async_trait]
impl Command for CannedOutput {
    fn name(&self) -> &'static str {
        self.name
    }

    fn where_path(&self) -> &'static str {
        self.name
    }

    async fn exec(&self, _args: &[String], sys: &mut Sys) -> i32 {
        match std::fs::read(&self.path) {
            Ok(body) => {
                let _ = sys.write_bytes(&body).await;
                0
            }
            Err(e) => {
                warn!(path = %self.path.display(), error = %e, "canned output unreadable");
                1
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_lookup_by_name_path_and_basename() {
        let registry = CommandRegistry::with_builtins();
        assert!(registry.lookup("ls").is_some());
        assert!(registry.lookup("/bin/ls").is_some());
        assert!(registry.lookup("./ls").is_some());
        assert!(registry.lookup("nmap").is_none());
    }

    #[test]
    fn test_fake_command_list() {
        let dir = tempfile::TempDir::new().unwrap();
        let list = dir.path().join("commands.txt");
        std::fs::write(&list, "telnet\nnc\n\n").unwrap();
        let mut registry = CommandRegistry::with_builtins();
        registry.load_fake_commands(&list);
        assert!(registry.is_fake("telnet"));
        assert!(registry.is_fake("/usr/bin/nc"));
        assert!(!registry.is_fake("ls"));
    }

    #[test]
    fn test_canned_outputs_registered() {
        let dir = tempfile::TempDir::new().unwrap();
        std::fs::write(dir.path().join("netstat"), "Active connections\n").unwrap();
        let mut registry = CommandRegistry::default();
        registry.load_canned_outputs(dir.path());
        assert!(registry.lookup("netstat").is_some());
    }
}
