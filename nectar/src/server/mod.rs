use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use dashmap::DashMap;
use russh::keys::ssh_key::rand_core::OsRng;
use russh::server::Config as SshConfig;
use tokio::net::{TcpListener, TcpStream};
use tracing::{error, info, warn};

use crate::config::Config;
use crate::os::{AccountStore, CommandRegistry};
use nectar_vfs::OverlayFs;

pub mod scp;
pub mod session;
pub mod sftp;
pub mod throttle;

use session::SshHandler;
use throttle::ThrottledStream;

/// Everything a connection worker needs, shared across all sessions.
pub struct ServerState {
    pub config: Arc<Config>,
    pub fs: Arc<OverlayFs>,
    pub accounts: Arc<AccountStore>,
    pub registry: Arc<CommandRegistry>,
    /// Pre-auth banner text, if a banner file was configured and readable.
    pub banner: Option<String>,
}

type PerIpCounter = Arc<DashMap<String, usize>>;

/// Admit a connection from `ip` unless the per-host cap is already reached.
/// The check and the increment happen under one map-entry guard.
fn try_admit(per_ip: &PerIpCounter, ip: &str, max_per_host: usize) -> bool {
    let mut count = per_ip.entry(ip.to_string()).or_insert(0);
    if *count >= max_per_host {
        return false;
    }
    *count += 1;
    true
}

fn release(per_ip: &PerIpCounter, ip: &str) {
    if let Some(mut count) = per_ip.get_mut(ip) {
        *count = count.saturating_sub(1);
    }
    per_ip.remove_if(ip, |_, count| *count == 0);
}

/// Load the host key, or generate and persist an Ed25519 one on first run.
/// A key file that exists but cannot be parsed is a fatal init error.
fn load_or_generate_host_key(config: &Config) -> Result<russh::keys::PrivateKey> {
    let path = config.resolve(&config.server.private_key);
    if path.exists() {
        return russh::keys::load_secret_key(&path, None)
            .with_context(|| format!("failed to parse host key {}", path.display()));
    }
    warn!(path = %path.display(), "host key not found, generating a new one");
    let key = russh::keys::PrivateKey::random(&mut OsRng, russh::keys::Algorithm::Ed25519)
        .context("failed to generate host key")?;
    let pem = key
        .to_openssh(russh::keys::ssh_key::LineEnding::LF)
        .context("failed to serialize host key")?;
    #[cfg(unix)]
    {
        use std::io::Write;
        use std::os::unix::fs::OpenOptionsExt;
        std::fs::OpenOptions::new()
            .write(true)
            .create(true)
            .truncate(true)
            .mode(0o600)
            .open(&path)?
            .write_all(pem.as_bytes())?;
    }
    #[cfg(not(unix))]
    std::fs::write(&path, pem.as_bytes())?;
    Ok(key)
}

/// The accept loop plus its fixed worker pool.
pub struct HoneypotServer {
    state: Arc<ServerState>,
    ssh_config: Arc<SshConfig>,
    per_ip: PerIpCounter,
}

impl HoneypotServer {
    pub fn new(state: Arc<ServerState>) -> Result<Self> {
        let mut ssh_config = SshConfig {
            server_id: russh::SshId::Standard(state.config.server.ident.clone()),
            inactivity_timeout: Some(state.config.timeout()),
            auth_rejection_time: Duration::from_millis(0),
            ..Default::default()
        };
        ssh_config.window_size = 4 * 1024 * 1024;
        ssh_config.channel_buffer_size = 4 * 1024 * 1024;
        ssh_config.maximum_packet_size = 65535; // MUST stay <= 65535
        ssh_config.keys.push(load_or_generate_host_key(&state.config)?);
        Ok(HoneypotServer {
            state,
            ssh_config: Arc::new(ssh_config),
            per_ip: Arc::new(DashMap::new()),
        })
    }

    pub async fn listen(&self) -> Result<()> {
        let addr = format!(
            "{}:{}",
            self.state.config.server.addr, self.state.config.server.port
        );
        let listener = TcpListener::bind(&addr)
            .await
            .with_context(|| format!("could not bind {addr}"))?;
        info!(addr = %addr, "honeypot listening");
        self.serve(listener).await
    }

    /// Accept, admit, throttle, dispatch. The bounded channel is the
    /// backpressure point: with all workers busy the accept loop blocks and
    /// the kernel backlog absorbs the burst.
    pub async fn serve(&self, listener: TcpListener) -> Result<()> {
        let (tx, rx) = async_channel::bounded::<(ThrottledStream<TcpStream>, SocketAddr)>(1);

        for worker_id in 0..self.state.config.server.max_connections.max(1) {
            let rx = rx.clone();
            let state = Arc::clone(&self.state);
            let ssh_config = Arc::clone(&self.ssh_config);
            let per_ip = Arc::clone(&self.per_ip);
            tokio::spawn(async move {
                session_worker(worker_id, rx, state, ssh_config, per_ip).await;
            });
        }

        loop {
            let (socket, peer) = match listener.accept().await {
                Ok(accepted) => accepted,
                Err(e) => {
                    error!(error = %e, "accept failed");
                    continue;
                }
            };
            let ip = peer.ip().to_string();
            if !try_admit(
                &self.per_ip,
                &ip,
                self.state.config.server.max_conn_per_host,
            ) {
                info!(src_ip = %ip, "connection rejected, per-host limit reached");
                drop(socket);
                continue;
            }
            info!(src_ip = %ip, src_port = peer.port(), "connection established");
            let wrapped = ThrottledStream::new(
                socket,
                self.state.config.server.speed,
                self.state.config.timeout(),
            );
            if tx.send((wrapped, peer)).await.is_err() {
                break;
            }
        }
        Ok(())
    }
}

/// One worker of the fixed pool: run the SSH handshake and session, then
/// return the per-IP slot no matter how the session ended.
async fn session_worker(
    worker_id: usize,
    rx: async_channel::Receiver<(ThrottledStream<TcpStream>, SocketAddr)>,
    state: Arc<ServerState>,
    ssh_config: Arc<SshConfig>,
    per_ip: PerIpCounter,
) {
    while let Ok((stream, peer)) = rx.recv().await {
        let ip = peer.ip().to_string();
        let handler = SshHandler::new(Arc::clone(&state), peer);
        match russh::server::run_stream(Arc::clone(&ssh_config), stream, handler).await {
            Ok(running) => {
                if let Err(e) = running.await {
                    info!(worker_id, src_ip = %ip, error = %e, "session ended with error");
                } else {
                    info!(worker_id, src_ip = %ip, "session closed");
                }
            }
            Err(e) => {
                warn!(worker_id, src_ip = %ip, error = %e, "ssh handshake failed");
            }
        }
        release(&per_ip, &ip);
    }
}
