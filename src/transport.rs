//! Unix socket plumbing shared by the plugin server and its clients.

use crate::error::{Error, Result};
use hyper_util::rt::TokioIo;
use std::io;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tokio::net::{UnixListener, UnixStream};
use tonic::transport::{Channel, Endpoint, Uri};
use tower::service_fn;
use tracing::debug;

/// Upper bound for establishing a connection to a local socket.
pub const DIAL_TIMEOUT: Duration = Duration::from_secs(10);

/// Removes a socket left behind by a previous run. A missing file is fine.
pub fn remove_stale_socket(path: &Path) -> Result<()> {
    match std::fs::remove_file(path) {
        Ok(()) => {
            debug!(socket = %path.display(), "Removed stale socket");
            Ok(())
        }
        Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
        Err(e) => Err(Error::Transport(format!(
            "failed to remove stale socket {}: {}",
            path.display(),
            e
        ))),
    }
}

/// Binds a fresh listener at `path`, replacing any stale socket file.
pub fn bind(path: &Path) -> Result<UnixListener> {
    remove_stale_socket(path)?;
    UnixListener::bind(path)
        .map_err(|e| Error::Transport(format!("failed to listen on {}: {}", path.display(), e)))
}

/// Opens a gRPC channel to a unix socket.
pub async fn dial(path: impl AsRef<Path>) -> Result<Channel> {
    dial_with_timeout(path, DIAL_TIMEOUT).await
}

pub async fn dial_with_timeout(path: impl AsRef<Path>, timeout: Duration) -> Result<Channel> {
    let path = path.as_ref().to_path_buf();
    let target = path.clone();

    // The authority is never resolved, the connector always opens `path`.
    let endpoint = Endpoint::from_static("http://[::]:50051").connect_timeout(timeout);
    let connect = endpoint.connect_with_connector(service_fn(move |_: Uri| {
        let target: PathBuf = target.clone();
        async move {
            let stream = UnixStream::connect(target).await?;
            Ok::<_, io::Error>(TokioIo::new(stream))
        }
    }));

    match tokio::time::timeout(timeout, connect).await {
        Ok(Ok(channel)) => Ok(channel),
        Ok(Err(e)) => Err(Error::Transport(format!(
            "failed to dial {}: {}",
            path.display(),
            describe(&e)
        ))),
        Err(_) => Err(Error::Transport(format!(
            "timed out after {:?} dialing {}",
            timeout,
            path.display()
        ))),
    }
}

fn describe(err: &(dyn std::error::Error + 'static)) -> String {
    let mut message = err.to_string();
    let mut source = err.source();
    while let Some(cause) = source {
        message.push_str(": ");
        message.push_str(&cause.to_string());
        source = cause.source();
    }
    message
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::os::unix::fs::FileTypeExt;

    #[test]
    fn test_remove_missing_socket_is_ok() {
        let dir = tempfile::tempdir().unwrap();
        assert!(remove_stale_socket(&dir.path().join("absent.sock")).is_ok());
    }

    #[tokio::test]
    async fn test_bind_replaces_stale_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("plugin.sock");
        std::fs::write(&path, b"stale").unwrap();

        let _listener = bind(&path).unwrap();
        assert!(std::fs::metadata(&path).unwrap().file_type().is_socket());
    }

    #[tokio::test]
    async fn test_dial_missing_socket_fails() {
        let dir = tempfile::tempdir().unwrap();
        let err = dial_with_timeout(dir.path().join("absent.sock"), Duration::from_secs(1))
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Transport(_)));
    }
}
