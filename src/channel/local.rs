//! Local command channel

use std::os::unix::fs::PermissionsExt;
use std::path::Path;

use async_trait::async_trait;
use tracing::trace;

use super::transport::run_process;
use super::CommandChannel;
use crate::{Error, Result};

/// Runs commands on this machine through `bash -c`
#[derive(Debug, Default, Clone)]
pub struct LocalChannel;

impl LocalChannel {
    /// Create a local channel
    pub fn new() -> Self {
        Self
    }
}

#[async_trait]
impl CommandChannel for LocalChannel {
    fn host(&self) -> String {
        "localhost".to_string()
    }

    async fn execute(&self, command: &str) -> Result<String> {
        trace!(command, "running local command");
        let output = run_process("bash", &["-c".to_string(), command.to_string()], &[], None)
            .await?;

        if !output.success() {
            return Err(Error::RemoteCommand {
                host: self.host(),
                command: command.to_string(),
                code: output.code,
                stderr: output.stderr,
            });
        }
        Ok(output.stdout)
    }

    async fn upload(&self, contents: &[u8], remote_path: &str, mode: u32) -> Result<()> {
        let path = Path::new(remote_path);
        let upload_err = |e: std::io::Error| Error::Upload {
            host: self.host(),
            path: remote_path.to_string(),
            message: e.to_string(),
        };

        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent).await.map_err(upload_err)?;
        }
        tokio::fs::write(path, contents).await.map_err(upload_err)?;
        tokio::fs::set_permissions(path, std::fs::Permissions::from_mode(mode))
            .await
            .map_err(upload_err)?;
        Ok(())
    }

    async fn close(&self) {}
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_execute_returns_stdout() {
        let out = LocalChannel::new().execute("echo hello").await.unwrap();
        assert_eq!(out, "hello\n");
    }

    #[tokio::test]
    async fn test_execute_nonzero_carries_stderr() {
        let err = LocalChannel::new()
            .execute("echo boom >&2; exit 7")
            .await
            .unwrap_err();
        match err {
            Error::RemoteCommand { code, stderr, host, .. } => {
                assert_eq!(host, "localhost");
                assert_eq!(code, Some(7));
                assert_eq!(stderr.trim(), "boom");
            }
            other => panic!("expected RemoteCommand, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_upload_creates_parents_and_sets_mode() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested/dir/file.conf");
        let path_str = path.to_str().unwrap();

        LocalChannel::new()
            .upload(b"content", path_str, 0o600)
            .await
            .unwrap();

        assert_eq!(std::fs::read(&path).unwrap(), b"content");
        let mode = std::fs::metadata(&path).unwrap().permissions().mode() & 0o777;
        assert_eq!(mode, 0o600);
    }
}
