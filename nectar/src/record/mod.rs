use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};

use anyhow::Result;
use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};

use crate::config::Config;

pub mod asciicast;
pub mod uml;

pub use asciicast::AsciicastRecorder;
pub use uml::UmlRecorder;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Direction {
    Input,
    Output,
}

/// Append-only transcript of one shell session. Implementations must never
/// fail the session: write errors are logged and swallowed.
pub trait SessionRecorder: Send + Sync {
    fn record(&self, dir: Direction, data: &[u8]);

    /// Finish the transcript (footer, optional upload). Called once when the
    /// shell exits.
    fn close(&self);
}

/// Open the transcript for a new shell, in the format the config asks for.
/// Files land in `logs/sessions/<user>-<YYYYMMDD-HHMMSS>.{cast,uml.log}`.
pub fn open_session_log(
    config: &Config,
    user: &str,
    term: &str,
    width: u32,
    height: u32,
) -> Result<Arc<dyn SessionRecorder>> {
    let stamp = chrono::Local::now().format("%Y%m%d-%H%M%S");
    match config.server.session_log_fmt.as_str() {
        "uml" => {
            let path = format!("logs/sessions/{user}-{stamp}.uml.log");
            Ok(Arc::new(UmlRecorder::create(path.as_ref())?))
        }
        _ => {
            let path = format!("logs/sessions/{user}-{stamp}.cast");
            let upload = (!config.asciinema.api_key.is_empty()).then(|| asciicast::Upload {
                endpoint: config.asciinema.api_endpoint.clone(),
                api_key: config.asciinema.api_key.clone(),
            });
            Ok(Arc::new(AsciicastRecorder::create(
                path.as_ref(),
                width,
                height,
                term,
                &format!("{user}@{}", config.server.hostname),
                upload,
            )?))
        }
    }
}

/// Tee for the session's input stream: everything the client sends shows up
/// in the transcript as an `i` event.
pub struct RecordingReader<R> {
    inner: R,
    recorder: Arc<dyn SessionRecorder>,
}

impl<R> RecordingReader<R> {
    pub fn new(inner: R, recorder: Arc<dyn SessionRecorder>) -> Self {
        RecordingReader { inner, recorder }
    }
}

impl<R: AsyncRead + Unpin> AsyncRead for RecordingReader<R> {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<std::io::Result<()>> {
        let this = self.get_mut();
        let before = buf.filled().len();
        match Pin::new(&mut this.inner).poll_read(cx, buf) {
            Poll::Ready(Ok(())) => {
                let fresh = &buf.filled()[before..];
                if !fresh.is_empty() {
                    this.recorder.record(Direction::Input, fresh);
                }
                Poll::Ready(Ok(()))
            }
            other => other,
        }
    }
}

/// Tee for the session's output stream: every byte the shell or a command
/// writes shows up in the transcript as an `o` event.
pub struct RecordingWriter<W> {
    inner: W,
    recorder: Arc<dyn SessionRecorder>,
}

impl<W> RecordingWriter<W> {
    pub fn new(inner: W, recorder: Arc<dyn SessionRecorder>) -> Self {
        RecordingWriter { inner, recorder }
    }
}

impl<W: AsyncWrite + Unpin> AsyncWrite for RecordingWriter<W> {
    fn poll_write(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<std::io::Result<usize>> {
        let this = self.get_mut();
        match Pin::new(&mut this.inner).poll_write(cx, buf) {
            Poll::Ready(Ok(n)) => {
                if n > 0 {
                    this.recorder.record(Direction::Output, &buf[..n]);
                }
                Poll::Ready(Ok(n))
            }
            other => other,
        }
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<std::io::Result<()>> {
        Pin::new(&mut self.get_mut().inner).poll_flush(cx)
    }

    fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<std::io::Result<()>> {
        Pin::new(&mut self.get_mut().inner).poll_shutdown(cx)
    }
}
