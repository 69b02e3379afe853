use std::future::Future;
use std::io;
use std::num::NonZeroU32;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{ready, Context, Poll};
use std::time::Duration;

use governor::{DefaultDirectRateLimiter, Quota, RateLimiter};
use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};
use tokio::time::{sleep, Instant, Sleep};

type PauseFut = Pin<Box<dyn Future<Output = ()> + Send>>;

/// Wraps the raw TCP stream with the two per-connection transport policies:
///
/// * an idle read deadline that fails the stream with `TimedOut`, unwinding
///   the whole session, and
/// * an optional token bucket shared by both directions, refilled at
///   `speed` bytes per second.
pub struct ThrottledStream<S> {
    inner: S,
    limiter: Option<Arc<DefaultDirectRateLimiter>>,
    burst: u32,
    idle_timeout: Duration,
    idle: Pin<Box<Sleep>>,
    read_pause: Option<PauseFut>,
    write_pause: Option<PauseFut>,
}

impl<S> ThrottledStream<S> {
    pub fn new(inner: S, speed: u64, idle_timeout: Duration) -> Self {
        let (limiter, burst) = if speed > 0 {
            let per_sec = NonZeroU32::new(speed.min(u32::MAX as u64) as u32)
                .unwrap_or(NonZeroU32::MIN);
            (
                Some(Arc::new(RateLimiter::direct(
                    Quota::per_second(per_sec).allow_burst(per_sec),
                ))),
                per_sec.get(),
            )
        } else {
            (None, 0)
        };
        ThrottledStream {
            inner,
            limiter,
            burst,
            idle_timeout,
            idle: Box::pin(sleep(idle_timeout)),
            read_pause: None,
            write_pause: None,
        }
    }

    /// Charge `n` transferred bytes against the bucket; the returned future
    /// resolves once the bucket can cover them.
    fn debt(limiter: Arc<DefaultDirectRateLimiter>, n: u32) -> PauseFut {
        let n = NonZeroU32::new(n.max(1)).unwrap_or(NonZeroU32::MIN);
        Box::pin(async move {
            let _ = limiter.until_n_ready(n).await;
        })
    }
}

impl<S: AsyncRead + Unpin> AsyncRead for ThrottledStream<S> {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        let this = self.get_mut();
        if let Some(pause) = this.read_pause.as_mut() {
            ready!(pause.as_mut().poll(cx));
            this.read_pause = None;
        }
        if this.idle.as_mut().poll(cx).is_ready() {
            return Poll::Ready(Err(io::Error::new(
                io::ErrorKind::TimedOut,
                "connection idle timeout",
            )));
        }
        let before = buf.filled().len();
        match Pin::new(&mut this.inner).poll_read(cx, buf) {
            Poll::Ready(Ok(())) => {
                let n = buf.filled().len() - before;
                if n > 0 {
                    this.idle
                        .as_mut()
                        .reset(Instant::now() + this.idle_timeout);
                    if let Some(limiter) = &this.limiter {
                        let charge = (n as u32).min(this.burst);
                        this.read_pause = Some(Self::debt(Arc::clone(limiter), charge));
                    }
                }
                Poll::Ready(Ok(()))
            }
            other => other,
        }
    }
}

impl<S: AsyncWrite + Unpin> AsyncWrite for ThrottledStream<S> {
    fn poll_write(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        let this = self.get_mut();
        if let Some(pause) = this.write_pause.as_mut() {
            ready!(pause.as_mut().poll(cx));
            this.write_pause = None;
        }
        match Pin::new(&mut this.inner).poll_write(cx, buf) {
            Poll::Ready(Ok(n)) => {
                if n > 0 {
                    if let Some(limiter) = &this.limiter {
                        let charge = (n as u32).min(this.burst);
                        this.write_pause = Some(Self::debt(Arc::clone(limiter), charge));
                    }
                }
                Poll::Ready(Ok(n))
            }
            other => other,
        }
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.get_mut().inner).poll_flush(cx)
    }

    fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.get_mut().inner).poll_shutdown(cx)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};

    #[tokio::test]
    async fn test_data_passes_through_unthrottled() {
        let (near, far) = tokio::io::duplex(1024);
        let mut wrapped = ThrottledStream::new(near, 0, Duration::from_secs(5));
        let (mut far_r, mut far_w) = tokio::io::split(far);

        far_w.write_all(b"client hello").await.unwrap();
        let mut buf = [0u8; 32];
        let n = wrapped.read(&mut buf).await.unwrap();
        assert_eq!(&buf[..n], b"client hello");

        wrapped.write_all(b"server hello").await.unwrap();
        let n = far_r.read(&mut buf).await.unwrap();
        assert_eq!(&buf[..n], b"server hello");
    }

    #[tokio::test]
    async fn test_idle_timeout_fails_read() {
        let (near, _far) = tokio::io::duplex(1024);
        let mut wrapped = ThrottledStream::new(near, 0, Duration::from_millis(50));
        let mut buf = [0u8; 8];
        let err = wrapped.read(&mut buf).await.unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::TimedOut);
    }

    #[tokio::test]
    async fn test_activity_resets_the_deadline() {
        let (near, far) = tokio::io::duplex(1024);
        let mut wrapped = ThrottledStream::new(near, 0, Duration::from_millis(200));
        let (_far_r, mut far_w) = tokio::io::split(far);

        // Keep feeding bytes under the deadline; the read side stays alive
        // well past a single timeout window.
        let feeder = tokio::spawn(async move {
            for _ in 0..4 {
                tokio::time::sleep(Duration::from_millis(100)).await;
                far_w.write_all(b"x").await.unwrap();
            }
        });
        let mut buf = [0u8; 8];
        let mut total = 0;
        while total < 4 {
            total += wrapped.read(&mut buf).await.unwrap();
        }
        feeder.await.unwrap();
    }

    #[tokio::test]
    async fn test_rate_limit_paces_reads() {
        let (near, far) = tokio::io::duplex(64 * 1024);
        // 4 KiB/s: the initial burst covers the first chunks, then the
        // bucket is dry and the third read has to wait for refill.
        let mut wrapped = ThrottledStream::new(near, 4096, Duration::from_secs(30));
        let (_far_r, mut far_w) = tokio::io::split(far);

        far_w.write_all(&vec![0u8; 12288]).await.unwrap();
        let start = std::time::Instant::now();
        let mut buf = vec![0u8; 4096];
        let mut total = 0;
        while total < 12288 {
            total += wrapped.read(&mut buf).await.unwrap();
        }
        assert!(start.elapsed() >= Duration::from_millis(500));
    }
}
