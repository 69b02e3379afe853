use std::collections::HashMap;
use std::io;
use std::sync::Arc;

use nectar_vfs::{clean_path, OverlayFs, VfsError};
use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt};
use tokio::sync::watch;

use super::account::{AccountStore, User};

pub type SessionInput = Box<dyn AsyncRead + Send + Sync + Unpin>;
pub type SessionOutput = Box<dyn AsyncWrite + Send + Sync + Unpin>;

/// The capability record handed to every command: streams, filesystem,
/// environment, working directory, terminal geometry, and identity. There is
/// no other way for a command to touch the outside world.
pub struct Sys {
    cwd: String,
    pub fs: Arc<OverlayFs>,
    pub env: HashMap<String, String>,
    pub user: Arc<User>,
    pub accounts: Arc<AccountStore>,
    pub hostname: String,
    winsize: watch::Receiver<(u32, u32)>,
    input: SessionInput,
    output: SessionOutput,
}

impl Sys {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        fs: Arc<OverlayFs>,
        accounts: Arc<AccountStore>,
        user: Arc<User>,
        hostname: String,
        term: &str,
        winsize: watch::Receiver<(u32, u32)>,
        input: SessionInput,
        output: SessionOutput,
    ) -> Self {
        let mut env = HashMap::new();
        env.insert("USER".to_string(), user.name.clone());
        env.insert("HOME".to_string(), user.home.clone());
        env.insert("SHELL".to_string(), user.shell.clone());
        env.insert("TERM".to_string(), term.to_string());
        let cwd = user.home.clone();
        Sys {
            cwd,
            fs,
            env,
            user,
            accounts,
            hostname,
            winsize,
            input,
            output,
        }
    }

    pub fn getcwd(&self) -> &str {
        &self.cwd
    }

    /// `cd` semantics: the target must exist and be a directory; on failure
    /// the working directory is left untouched.
    pub fn chdir(&mut self, path: &str) -> Result<(), VfsError> {
        let target = clean_path(&self.cwd, path);
        let meta = self.fs.stat(&target)?;
        if !meta.is_dir() {
            return Err(VfsError::NotADirectory);
        }
        self.cwd = target;
        Ok(())
    }

    /// Resolve a command argument against the working directory.
    pub fn resolve(&self, path: &str) -> String {
        clean_path(&self.cwd, path)
    }

    pub fn width(&self) -> u32 {
        self.winsize.borrow().0
    }

    pub fn height(&self) -> u32 {
        self.winsize.borrow().1
    }

    pub fn current_uid(&self) -> u32 {
        self.user.uid
    }

    pub fn current_gid(&self) -> u32 {
        self.user.gid
    }

    pub fn getenv(&self, name: &str) -> Option<&str> {
        self.env.get(name).map(String::as_str)
    }

    pub fn setenv(&mut self, name: &str, value: &str) {
        self.env.insert(name.to_string(), value.to_string());
    }

    pub fn input(&mut self) -> &mut SessionInput {
        &mut self.input
    }

    /// Write with the `\n` → `\r\n` translation a raw SSH channel needs.
    pub async fn write_str(&mut self, s: &str) -> io::Result<()> {
        self.write_bytes(s.as_bytes()).await
    }

    pub async fn write_bytes(&mut self, data: &[u8]) -> io::Result<()> {
        let mut translated = Vec::with_capacity(data.len() + 16);
        for &b in data {
            if b == b'\n' && translated.last() != Some(&b'\r') {
                translated.push(b'\r');
            }
            translated.push(b);
        }
        self.output.write_all(&translated).await?;
        self.output.flush().await
    }

    /// Untranslated write, for echoing control sequences from the line
    /// editor.
    pub async fn write_raw(&mut self, data: &[u8]) -> io::Result<()> {
        self.output.write_all(data).await?;
        self.output.flush().await
    }
}


#[cfg(test)]
mod tests {
    use super::test_support::sys_fixture;
    use nectar_vfs::VfsError;

    #[tokio::test]
    async fn test_env_seeding() {
        let fx = sys_fixture();
        assert_eq!(fx.sys.getenv("USER"), Some("bob"));
        assert_eq!(fx.sys.getenv("HOME"), Some("/home/bob"));
        assert_eq!(fx.sys.getenv("TERM"), Some("vt100"));
        assert_eq!(fx.sys.getcwd(), "/home/bob");
    }

    #[tokio::test]
    async fn test_chdir_rules() {
        let mut fx = sys_fixture();
        fx.sys.chdir("/bin").unwrap();
        assert_eq!(fx.sys.getcwd(), "/bin");

        // missing target leaves cwd alone
        assert!(matches!(fx.sys.chdir("/nope"), Err(VfsError::NotFound)));
        assert_eq!(fx.sys.getcwd(), "/bin");

        // files are not directories
        assert!(matches!(
            fx.sys.chdir("ls"),
            Err(VfsError::NotADirectory)
        ));
        assert_eq!(fx.sys.getcwd(), "/bin");

        // relative paths resolve against cwd
        fx.sys.chdir("..").unwrap();
        assert_eq!(fx.sys.getcwd(), "/");
    }

    #[tokio::test]
    async fn test_crlf_translation() {
        let mut fx = sys_fixture();
        fx.sys.write_str("a\nb\r\nc\n").await.unwrap();
        let out = super::test_support::read_output(&mut fx.out).await;
        assert_eq!(out, "a\r\nb\r\nc\r\n");
    }
}
