//! Platform-specific pipe/socket endpoints.
//!
//! - Unix: Unix Domain Socket
//! - Windows: Named Pipe
//!
//! The controller binds a [`PipeListener`]; the worker calls
//! [`connect_pipe`]. Both ends produce a [`PipeStream`].

use std::path::{Path, PathBuf};
use std::time::Duration;

use tokio::io::{AsyncRead, AsyncWrite};

use crate::error::{RenderwireError, Result};

/// Generate a unique endpoint path for this process.
///
/// Format:
/// - Unix: `{tmp}/{prefix}-{pid}-{random}.sock`
/// - Windows: `\\.\pipe\{prefix}-{pid}-{random}`
pub fn generate_pipe_path(prefix: &str) -> PathBuf {
    let pid = std::process::id();
    let rand = rand_u64();

    #[cfg(unix)]
    {
        std::env::temp_dir().join(format!("{prefix}-{pid}-{rand:x}.sock"))
    }

    #[cfg(windows)]
    {
        PathBuf::from(format!(r"\\.\pipe\{prefix}-{pid}-{rand:x}"))
    }
}

/// Time- and counter-seeded value for unique names.
fn rand_u64() -> u64 {
    use std::sync::atomic::{AtomicU64, Ordering};
    use std::time::{SystemTime, UNIX_EPOCH};

    static COUNTER: AtomicU64 = AtomicU64::new(0);

    let nanos = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_nanos() as u64)
        .unwrap_or(0);
    let n = COUNTER.fetch_add(1, Ordering::Relaxed);
    nanos.wrapping_mul(0x517c_c1b7_2722_0a95) ^ (n << 32) ^ std::process::id() as u64
}

/// Connect to a listening endpoint, retrying up to `attempts` times.
pub async fn connect_pipe(path: &Path, attempts: u32, delay: Duration) -> Result<PipeStream> {
    let attempts = attempts.max(1);
    let mut last_err = None;
    for attempt in 1..=attempts {
        match PipeStream::connect(path).await {
            Ok(stream) => return Ok(stream),
            Err(e) => {
                tracing::debug!(path = %path.display(), attempt, error = %e, "pipe connect failed");
                last_err = Some(e);
                if attempt < attempts {
                    tokio::time::sleep(delay).await;
                }
            }
        }
    }
    Err(RenderwireError::TransportUnavailable(format!(
        "could not connect to {} after {attempts} attempts: {}",
        path.display(),
        last_err.map(|e| e.to_string()).unwrap_or_default()
    )))
}

// ============================================================================
// Unix Implementation
// ============================================================================

#[cfg(unix)]
mod unix_impl {
    use super::*;
    use std::pin::Pin;
    use std::task::{Context, Poll};
    use tokio::io::ReadBuf;
    use tokio::net::{UnixListener, UnixStream};

    /// Unix Domain Socket listener. Removes its socket file on drop.
    pub struct PipeListener {
        listener: UnixListener,
        path: PathBuf,
    }

    /// Connected Unix Domain Socket.
    pub struct PipeStream {
        stream: UnixStream,
    }

    impl PipeListener {
        /// Bind to a socket path, replacing a stale socket file.
        pub async fn bind(path: impl AsRef<Path>) -> Result<Self> {
            let path = path.as_ref();
            if path.exists() {
                std::fs::remove_file(path)?;
            }
            let listener = UnixListener::bind(path)?;
            Ok(Self {
                listener,
                path: path.to_path_buf(),
            })
        }

        /// Accept the next connection.
        pub async fn accept(&self) -> Result<PipeStream> {
            let (stream, _addr) = self.listener.accept().await?;
            Ok(PipeStream { stream })
        }

        pub fn path(&self) -> &Path {
            &self.path
        }
    }

    impl Drop for PipeListener {
        fn drop(&mut self) {
            let _ = std::fs::remove_file(&self.path);
        }
    }

    impl PipeStream {
        pub(super) async fn connect(path: &Path) -> Result<Self> {
            Ok(Self {
                stream: UnixStream::connect(path).await?,
            })
        }

        /// Split into owned read and write halves.
        pub fn into_split(
            self,
        ) -> (
            impl AsyncRead + Unpin + Send + 'static,
            impl AsyncWrite + Unpin + Send + 'static,
        ) {
            self.stream.into_split()
        }
    }

    impl AsyncRead for PipeStream {
        fn poll_read(
            mut self: Pin<&mut Self>,
            cx: &mut Context<'_>,
            buf: &mut ReadBuf<'_>,
        ) -> Poll<std::io::Result<()>> {
            Pin::new(&mut self.stream).poll_read(cx, buf)
        }
    }

    impl AsyncWrite for PipeStream {
        fn poll_write(
            mut self: Pin<&mut Self>,
            cx: &mut Context<'_>,
            buf: &[u8],
        ) -> Poll<std::io::Result<usize>> {
            Pin::new(&mut self.stream).poll_write(cx, buf)
        }

        fn poll_flush(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<std::io::Result<()>> {
            Pin::new(&mut self.stream).poll_flush(cx)
        }

        fn poll_shutdown(
            mut self: Pin<&mut Self>,
            cx: &mut Context<'_>,
        ) -> Poll<std::io::Result<()>> {
            Pin::new(&mut self.stream).poll_shutdown(cx)
        }
    }
}

// ============================================================================
// Windows Implementation
// ============================================================================

#[cfg(windows)]
mod windows_impl {
    use super::*;
    use std::pin::Pin;
    use std::task::{Context, Poll};
    use tokio::io::ReadBuf;
    use tokio::net::windows::named_pipe::{
        ClientOptions, NamedPipeClient, NamedPipeServer, ServerOptions,
    };

    /// Windows Named Pipe listener.
    pub struct PipeListener {
        path: PathBuf,
        next: tokio::sync::Mutex<Option<NamedPipeServer>>,
    }

    /// Connected Named Pipe, server or client end.
    pub enum PipeStream {
        Server(NamedPipeServer),
        Client(NamedPipeClient),
    }

    impl PipeListener {
        /// Create the first pipe instance.
        pub async fn bind(path: impl AsRef<Path>) -> Result<Self> {
            let path = path.as_ref().to_path_buf();
            let first = ServerOptions::new()
                .first_pipe_instance(true)
                .create(&path)?;
            Ok(Self {
                path,
                next: tokio::sync::Mutex::new(Some(first)),
            })
        }

        /// Accept the next connection; a fresh instance is created for the one after.
        pub async fn accept(&self) -> Result<PipeStream> {
            let mut next = self.next.lock().await;
            let server = match next.take() {
                Some(s) => s,
                None => ServerOptions::new().create(&self.path)?,
            };
            server.connect().await?;
            *next = Some(ServerOptions::new().create(&self.path)?);
            Ok(PipeStream::Server(server))
        }

        pub fn path(&self) -> &Path {
            &self.path
        }
    }

    impl PipeStream {
        pub(super) async fn connect(path: &Path) -> Result<Self> {
            Ok(PipeStream::Client(ClientOptions::new().open(path)?))
        }

        /// Split into owned read and write halves.
        pub fn into_split(
            self,
        ) -> (
            impl AsyncRead + Unpin + Send + 'static,
            impl AsyncWrite + Unpin + Send + 'static,
        ) {
            tokio::io::split(self)
        }
    }

    impl AsyncRead for PipeStream {
        fn poll_read(
            self: Pin<&mut Self>,
            cx: &mut Context<'_>,
            buf: &mut ReadBuf<'_>,
        ) -> Poll<std::io::Result<()>> {
            match self.get_mut() {
                PipeStream::Server(p) => Pin::new(p).poll_read(cx, buf),
                PipeStream::Client(p) => Pin::new(p).poll_read(cx, buf),
            }
        }
    }

    impl AsyncWrite for PipeStream {
        fn poll_write(
            self: Pin<&mut Self>,
            cx: &mut Context<'_>,
            buf: &[u8],
        ) -> Poll<std::io::Result<usize>> {
            match self.get_mut() {
                PipeStream::Server(p) => Pin::new(p).poll_write(cx, buf),
                PipeStream::Client(p) => Pin::new(p).poll_write(cx, buf),
            }
        }

        fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<std::io::Result<()>> {
            match self.get_mut() {
                PipeStream::Server(p) => Pin::new(p).poll_flush(cx),
                PipeStream::Client(p) => Pin::new(p).poll_flush(cx),
            }
        }

        fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<std::io::Result<()>> {
            match self.get_mut() {
                PipeStream::Server(p) => Pin::new(p).poll_shutdown(cx),
                PipeStream::Client(p) => Pin::new(p).poll_shutdown(cx),
            }
        }
    }
}

#[cfg(unix)]
pub use unix_impl::{PipeListener, PipeStream};

#[cfg(windows)]
pub use windows_impl::{PipeListener, PipeStream};

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_generated_paths_are_unique_and_tagged() {
        let paths: Vec<PathBuf> = (0..10).map(|_| generate_pipe_path("rw-test")).collect();
        let pid = std::process::id().to_string();
        for (i, p) in paths.iter().enumerate() {
            assert!(p.to_string_lossy().contains(&pid));
            assert!(p.to_string_lossy().contains("rw-test-"));
            for q in &paths[i + 1..] {
                assert_ne!(p, q);
            }
        }
    }

    #[tokio::test]
    async fn test_connect_without_listener_fails_after_retries() {
        let path = generate_pipe_path("rw-absent");
        let start = std::time::Instant::now();
        let Err(err) = connect_pipe(&path, 3, Duration::from_millis(10)).await else {
            panic!("connect succeeded without a listener");
        };
        assert!(matches!(err, RenderwireError::TransportUnavailable(_)));
        assert!(err.to_string().contains("after 3 attempts"));
        assert!(start.elapsed() >= Duration::from_millis(20));
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_listener_accepts_and_cleans_up() {
        use tokio::io::{AsyncReadExt, AsyncWriteExt};

        let path = generate_pipe_path("rw-accept");
        let listener = PipeListener::bind(&path).await.unwrap();
        assert!(path.exists());

        let client = tokio::spawn({
            let path = path.clone();
            async move {
                let mut stream = connect_pipe(&path, 1, Duration::ZERO).await.unwrap();
                stream.write_all(b"ping").await.unwrap();
            }
        });

        let mut server = listener.accept().await.unwrap();
        let mut buf = [0u8; 4];
        server.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"ping");
        client.await.unwrap();

        drop(listener);
        assert!(!path.exists());
    }
}
