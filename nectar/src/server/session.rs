use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;

use anyhow::Result;
use base64::Engine;
use rand::RngCore;
use russh::keys::ssh_key::HashAlg;
use russh::keys::PublicKey;
use russh::server::{Auth, Handle, Msg, Session};
use russh::{Channel, ChannelId, MethodKind, MethodSet};
use tokio::sync::watch;
use tracing::{info, warn};

use crate::os::shell::Shell;
use crate::os::sys::{SessionInput, SessionOutput, Sys};
use crate::record::{self, RecordingReader, RecordingWriter, SessionRecorder};
use crate::server::ServerState;
use crate::server::{scp, sftp};

const DEFAULT_TERM: &str = "vt100";
const DEFAULT_WIDTH: u32 = 80;
const DEFAULT_HEIGHT: u32 = 24;

#[derive(Clone)]
struct PtyParams {
    term: String,
    width: u32,
    height: u32,
}

/// Server-side SSH handler state.
///
/// One instance per SSH connection (russh does this for you).
pub struct SshHandler {
    state: Arc<ServerState>,
    peer: SocketAddr,
    /// Random token correlating every log line of this connection.
    session_id: String,
    user: Option<String>,
    auth_failures: u32,
    /// Session channels we've opened; consumed when a shell, subsystem, or
    /// exec takes over the byte stream.
    session_channels: HashMap<ChannelId, Channel<Msg>>,
    ptys: HashMap<ChannelId, PtyParams>,
    /// window-change feeds into a running shell through these.
    winch: HashMap<ChannelId, watch::Sender<(u32, u32)>>,
}

impl SshHandler {
    pub fn new(state: Arc<ServerState>, peer: SocketAddr) -> Self {
        let mut token = [0u8; 12];
        rand::thread_rng().fill_bytes(&mut token);
        SshHandler {
            state,
            peer,
            session_id: base64::engine::general_purpose::STANDARD.encode(token),
            user: None,
            auth_failures: 0,
            session_channels: HashMap::new(),
            ptys: HashMap::new(),
            winch: HashMap::new(),
        }
    }

    fn user(&self) -> &str {
        self.user.as_deref().unwrap_or("")
    }

    fn pty_or_default(&self, channel: ChannelId) -> PtyParams {
        self.ptys.get(&channel).cloned().unwrap_or(PtyParams {
            term: DEFAULT_TERM.to_string(),
            width: DEFAULT_WIDTH,
            height: DEFAULT_HEIGHT,
        })
    }

    fn winch_receiver(&mut self, channel: ChannelId) -> watch::Receiver<(u32, u32)> {
        let pty = self.pty_or_default(channel);
        let (tx, rx) = watch::channel((pty.width, pty.height));
        self.winch.insert(channel, tx);
        rx
    }

    /// Wire a [`Sys`] onto the channel byte stream, teeing through the
    /// session recorder when one is attached.
    fn build_sys(
        &self,
        channel: Channel<Msg>,
        pty: &PtyParams,
        winsize: watch::Receiver<(u32, u32)>,
        recorder: Option<Arc<dyn SessionRecorder>>,
    ) -> Sys {
        let account = self.state.accounts.user_or_synthesized(self.user());
        let (read_half, write_half) = tokio::io::split(channel.into_stream());
        let (input, output): (SessionInput, SessionOutput) = match recorder {
            Some(rec) => (
                Box::new(RecordingReader::new(read_half, Arc::clone(&rec))),
                Box::new(RecordingWriter::new(write_half, rec)),
            ),
            None => (Box::new(read_half), Box::new(write_half)),
        };
        Sys::new(
            Arc::clone(&self.state.fs),
            Arc::clone(&self.state.accounts),
            account,
            self.state.config.server.hostname.clone(),
            &pty.term,
            winsize,
            input,
            output,
        )
    }
}

/// Report the task's exit code on the channel and close it.
async fn finish_channel(handle: Handle, channel: ChannelId, code: i32) {
    let _ = handle
        .exit_status_request(channel, code.max(0) as u32)
        .await;
    let _ = handle.eof(channel).await;
    let _ = handle.close(channel).await;
}

impl russh::server::Handler for SshHandler {
    type Error = anyhow::Error;

    // ------------------- AUTH -------------------

    async fn authentication_banner(&mut self) -> Result<Option<String>, Self::Error> {
        Ok(self.state.banner.clone())
    }

    async fn auth_password(&mut self, user: &str, password: &str) -> Result<Auth, Self::Error> {
        // This log line is the product.
        info!(
            user,
            password,
            src_ip = %self.peer.ip(),
            src_port = self.peer.port(),
            session_id = %self.session_id,
            method = "password",
            "login attempt"
        );
        if self
            .state
            .accounts
            .check_password(user, password, self.state.config.server.allow_random_user)
        {
            info!(user, src_ip = %self.peer.ip(), "login accepted");
            self.user = Some(user.to_string());
            return Ok(Auth::Accept);
        }
        self.auth_failures += 1;
        if self.auth_failures >= self.state.config.server.max_tries {
            info!(user, src_ip = %self.peer.ip(), "too many auth failures, disconnecting");
            anyhow::bail!("password rejected for {user:?} after max tries");
        }
        Ok(Auth::Reject {
            proceed_with_methods: Some(MethodSet::from(&[MethodKind::Password][..])),
            partial_success: false,
        })
    }

    async fn auth_publickey(
        &mut self,
        user: &str,
        key: &PublicKey,
    ) -> Result<Auth, Self::Error> {
        info!(
            user,
            fingerprint = %key.fingerprint(HashAlg::Sha256),
            src_ip = %self.peer.ip(),
            src_port = self.peer.port(),
            session_id = %self.session_id,
            method = "publickey",
            "login attempt"
        );
        // Keys are never good enough; steer the client toward passwords so
        // we get to log one.
        Ok(Auth::Reject {
            proceed_with_methods: Some(MethodSet::from(&[MethodKind::Password][..])),
            partial_success: false,
        })
    }

    // ------------------- CHANNEL OPEN -------------------

    async fn channel_open_session(
        &mut self,
        channel: Channel<Msg>,
        _session: &mut Session,
    ) -> Result<bool, Self::Error> {
        let id = channel.id();
        info!(user = self.user(), channel = %id, "session channel opened");
        self.session_channels.insert(id, channel);
        Ok(true)
    }

    async fn channel_open_direct_tcpip(
        &mut self,
        _channel: Channel<Msg>,
        host_to_connect: &str,
        port_to_connect: u32,
        origin_addr: &str,
        origin_port: u32,
        _session: &mut Session,
    ) -> Result<bool, Self::Error> {
        info!(
            user = self.user(),
            src_ip = %self.peer.ip(),
            target = %format!("{host_to_connect}:{port_to_connect}"),
            origin = %format!("{origin_addr}:{origin_port}"),
            "direct-tcpip rejected"
        );
        // Port forwarding through a honeypot would make us a relay.
        Ok(false)
    }

    async fn tcpip_forward(
        &mut self,
        address: &str,
        port: &mut u32,
        _session: &mut Session,
    ) -> Result<bool, Self::Error> {
        info!(
            user = self.user(),
            target = %format!("{address}:{port}"),
            "tcpip-forward rejected"
        );
        Ok(false)
    }

    async fn channel_close(
        &mut self,
        channel: ChannelId,
        _session: &mut Session,
    ) -> Result<(), Self::Error> {
        self.session_channels.remove(&channel);
        self.ptys.remove(&channel);
        self.winch.remove(&channel);
        Ok(())
    }

    // ------------------- REQUESTS -------------------

    async fn pty_request(
        &mut self,
        channel: ChannelId,
        term: &str,
        col_width: u32,
        row_height: u32,
        _pix_width: u32,
        _pix_height: u32,
        _modes: &[(russh::Pty, u32)],
        session: &mut Session,
    ) -> Result<(), Self::Error> {
        info!(
            user = self.user(),
            term, col_width, row_height, "pty requested"
        );
        self.ptys.insert(
            channel,
            PtyParams {
                term: term.to_string(),
                width: col_width,
                height: row_height,
            },
        );
        session.channel_success(channel)?;
        Ok(())
    }

    async fn env_request(
        &mut self,
        channel: ChannelId,
        variable_name: &str,
        variable_value: &str,
        session: &mut Session,
    ) -> Result<(), Self::Error> {
        // Logged, never applied: attacker-supplied env is data, not config.
        info!(
            user = self.user(),
            name = variable_name,
            value = variable_value,
            "env request"
        );
        session.channel_success(channel)?;
        Ok(())
    }

    async fn window_change_request(
        &mut self,
        channel: ChannelId,
        col_width: u32,
        row_height: u32,
        _pix_width: u32,
        _pix_height: u32,
        _session: &mut Session,
    ) -> Result<(), Self::Error> {
        if let Some(pty) = self.ptys.get_mut(&channel) {
            pty.width = col_width;
            pty.height = row_height;
        }
        if let Some(tx) = self.winch.get(&channel) {
            let _ = tx.send((col_width, row_height));
        }
        Ok(())
    }

    async fn shell_request(
        &mut self,
        channel: ChannelId,
        session: &mut Session,
    ) -> Result<(), Self::Error> {
        let Some(ch) = self.session_channels.remove(&channel) else {
            session.channel_failure(channel)?;
            return Ok(());
        };
        info!(user = self.user(), src_ip = %self.peer.ip(), "shell requested");

        let pty = self.pty_or_default(channel);
        let winsize = self.winch_receiver(channel);
        let recorder =
            match record::open_session_log(&self.state.config, self.user(), &pty.term, pty.width, pty.height)
            {
                Ok(rec) => Some(rec),
                Err(e) => {
                    warn!(error = %e, "could not open session transcript");
                    None
                }
            };
        let sys = self.build_sys(ch, &pty, winsize, recorder.clone());
        let shell = Shell::new(
            sys,
            Arc::clone(&self.state.registry),
            Arc::clone(&self.state.config),
        );

        // Reply before the shell writes anything; PuTTY waits for the reply
        // before it acknowledges shell mode.
        session.channel_success(channel)?;
        let handle = session.handle().clone();
        tokio::spawn(async move {
            let code = shell.run().await;
            if let Some(rec) = recorder {
                rec.close();
            }
            finish_channel(handle, channel, code).await;
        });
        Ok(())
    }

    async fn exec_request(
        &mut self,
        channel: ChannelId,
        data: &[u8],
        session: &mut Session,
    ) -> Result<(), Self::Error> {
        let line = String::from_utf8_lossy(data).into_owned();
        info!(
            user = self.user(),
            src_ip = %self.peer.ip(),
            cmd = %line,
            "exec request"
        );
        let Some(ch) = self.session_channels.remove(&channel) else {
            session.channel_failure(channel)?;
            return Ok(());
        };
        session.channel_success(channel)?;

        let tokens: Vec<String> = line.split(' ').filter(|t| !t.is_empty()).map(str::to_string).collect();
        let handle = session.handle().clone();

        if tokens.first().map(String::as_str) == Some("scp") {
            let fs = Arc::clone(&self.state.fs);
            let limit = self.state.config.server.receive_file_size_limit;
            let args = tokens[1..].to_vec();
            tokio::spawn(async move {
                let code = scp::run(ch.into_stream(), args, fs, limit).await;
                finish_channel(handle, channel, code).await;
            });
            return Ok(());
        }

        let pty = self.pty_or_default(channel);
        let winsize = self.winch_receiver(channel);
        let mut sys = self.build_sys(ch, &pty, winsize, None);
        let registry = Arc::clone(&self.state.registry);
        tokio::spawn(async move {
            let code = match tokens.first() {
                Some(name) => match registry.lookup(name).cloned() {
                    Some(cmd) => cmd.exec(&tokens[1..], &mut sys).await,
                    None => {
                        let _ = sys.write_str(&format!("{name}: command not found\n")).await;
                        127
                    }
                },
                None => 0,
            };
            finish_channel(handle, channel, code).await;
        });
        Ok(())
    }

    async fn subsystem_request(
        &mut self,
        channel: ChannelId,
        name: &str,
        session: &mut Session,
    ) -> Result<(), Self::Error> {
        info!(user = self.user(), subsystem = name, "subsystem request");
        if name != "sftp" {
            session.channel_failure(channel)?;
            return Ok(());
        }
        let Some(ch) = self.session_channels.remove(&channel) else {
            session.channel_failure(channel)?;
            return Ok(());
        };
        session.channel_success(channel)?;

        let fs = Arc::clone(&self.state.fs);
        let home = self
            .state
            .accounts
            .user_or_synthesized(self.user())
            .home
            .clone();
        let handle = session.handle().clone();
        tokio::spawn(async move {
            if let Err(e) = sftp::run_sftp(ch.into_stream(), fs, &home).await {
                warn!(error = %e, "sftp subsystem error");
            }
            finish_channel(handle, channel, 1).await;
        });
        Ok(())
    }
}
