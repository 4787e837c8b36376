// ============================================================================
// NODE TRANSPORT
// ============================================================================
//
// Moves a workspace between a node and a local tar file.

use anyhow::{Context, Result};
use async_trait::async_trait;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::process::Command;

#[async_trait]
pub trait NodeTransport: Send + Sync {
    /// Archive `workspace_path` on the node into the local tar file `dest`.
    /// Returns the archive size in bytes.
    async fn pull_archive(&self, host: &str, port: u16, workspace_path: &str, dest: &Path)
        -> Result<u64>;

    /// Extract the local tar file `src` into `workspace_path` on the node.
    async fn push_archive(&self, host: &str, port: u16, workspace_path: &str, src: &Path)
        -> Result<()>;
}

fn sh_escape_single(s: &str) -> String {
    format!("'{}'", s.replace('\'', "'\"'\"'"))
}

fn tail_str(s: &str, max: usize) -> &str {
    let start = s.len().saturating_sub(max);
    let mut i = start;
    while i < s.len() && !s.is_char_boundary(i) {
        i += 1;
    }
    &s[i..]
}

// --- SSH ---

/// Streams `tar` through the system `ssh` client.
#[derive(Clone, Debug)]
pub struct SshTransport {
    pub user: String,
    pub key_path: Option<PathBuf>,
    pub connect_timeout: Duration,
    /// Upper bound for one archive transfer.
    pub transfer_timeout: Duration,
}

impl Default for SshTransport {
    fn default() -> Self {
        Self {
            user: "root".to_string(),
            key_path: None,
            connect_timeout: Duration::from_secs(10),
            transfer_timeout: Duration::from_secs(3600),
        }
    }
}

impl SshTransport {
    fn command(&self, host: &str, port: u16, remote: &str) -> Command {
        let mut cmd = Command::new("ssh");
        if let Some(key) = &self.key_path {
            cmd.arg("-i").arg(key);
        }
        cmd.arg("-p")
            .arg(port.to_string())
            .arg("-o")
            .arg("StrictHostKeyChecking=no")
            .arg("-o")
            .arg("UserKnownHostsFile=/dev/null")
            .arg("-o")
            .arg(format!("ConnectTimeout={}", self.connect_timeout.as_secs().max(1)))
            .arg("-o")
            .arg("BatchMode=yes")
            .arg(format!("{}@{}", self.user, crate::probe::clean_host(host)))
            .arg(remote)
            .kill_on_drop(true);
        cmd
    }
}

#[async_trait]
impl NodeTransport for SshTransport {
    async fn pull_archive(
        &self,
        host: &str,
        port: u16,
        workspace_path: &str,
        dest: &Path,
    ) -> Result<u64> {
        let remote = format!("tar -cf - -C {} .", sh_escape_single(workspace_path));
        let mut child = self
            .command(host, port, &remote)
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .spawn()
            .context("ssh spawn failed")?;
        let mut stdout = child.stdout.take().context("ssh stdout unavailable")?;
        let mut stderr = child.stderr.take().context("ssh stderr unavailable")?;
        let mut file = tokio::fs::File::create(dest)
            .await
            .with_context(|| format!("creating {}", dest.display()))?;

        let transfer = async {
            let mut err_buf = Vec::new();
            let (copied, _) = tokio::join!(
                tokio::io::copy(&mut stdout, &mut file),
                stderr.read_to_end(&mut err_buf)
            );
            let status = child.wait().await?;
            Ok::<_, anyhow::Error>((copied, status, err_buf))
        };
        let (copied, status, err_buf) = tokio::time::timeout(self.transfer_timeout, transfer)
            .await
            .context("ssh archive pull timed out")??;
        if !status.success() {
            let stderr = String::from_utf8_lossy(&err_buf);
            anyhow::bail!(
                "remote tar failed on {}:{} (exit={}): {}",
                host,
                port,
                status,
                tail_str(&stderr, 2000)
            );
        }
        let n = copied.context("reading archive stream")?;
        file.flush().await?;
        Ok(n)
    }

    async fn push_archive(
        &self,
        host: &str,
        port: u16,
        workspace_path: &str,
        src: &Path,
    ) -> Result<()> {
        let ws = sh_escape_single(workspace_path);
        let remote = format!("mkdir -p {ws} && tar -xf - -C {ws}");
        let mut child = self
            .command(host, port, &remote)
            .stdin(Stdio::piped())
            .stdout(Stdio::null())
            .stderr(Stdio::piped())
            .spawn()
            .context("ssh spawn failed")?;
        let mut stdin = child.stdin.take().context("ssh stdin unavailable")?;
        let mut file = tokio::fs::File::open(src)
            .await
            .with_context(|| format!("opening {}", src.display()))?;

        let transfer = async {
            tokio::io::copy(&mut file, &mut stdin).await?;
            stdin.shutdown().await?;
            drop(stdin);
            let out = child.wait_with_output().await?;
            Ok::<_, anyhow::Error>(out)
        };
        let out = tokio::time::timeout(self.transfer_timeout, transfer)
            .await
            .context("ssh archive push timed out")??;
        if !out.status.success() {
            let stderr = String::from_utf8_lossy(&out.stderr);
            anyhow::bail!(
                "remote extract failed on {}:{} (exit={}): {}",
                host,
                port,
                out.status,
                tail_str(&stderr, 2000)
            );
        }
        Ok(())
    }
}

// --- Local directory ---

/// Treats `workspace_path` as a local directory; host and port are ignored.
#[derive(Clone, Debug, Default)]
pub struct LocalTransport;

#[async_trait]
impl NodeTransport for LocalTransport {
    async fn pull_archive(
        &self,
        _host: &str,
        _port: u16,
        workspace_path: &str,
        dest: &Path,
    ) -> Result<u64> {
        let ws = PathBuf::from(workspace_path);
        let dest = dest.to_path_buf();
        tokio::task::spawn_blocking(move || -> Result<u64> {
            if !ws.is_dir() {
                anyhow::bail!("workspace {} is not a directory", ws.display());
            }
            let file = std::fs::File::create(&dest)
                .with_context(|| format!("creating {}", dest.display()))?;
            let mut builder = tar::Builder::new(file);
            builder.follow_symlinks(false);
            builder
                .append_dir_all(".", &ws)
                .with_context(|| format!("archiving {}", ws.display()))?;
            builder.into_inner()?.sync_all()?;
            Ok(std::fs::metadata(&dest)?.len())
        })
        .await?
    }

    async fn push_archive(
        &self,
        _host: &str,
        _port: u16,
        workspace_path: &str,
        src: &Path,
    ) -> Result<()> {
        let ws = PathBuf::from(workspace_path);
        let src = src.to_path_buf();
        tokio::task::spawn_blocking(move || -> Result<()> {
            std::fs::create_dir_all(&ws).with_context(|| format!("creating {}", ws.display()))?;
            let file =
                std::fs::File::open(&src).with_context(|| format!("opening {}", src.display()))?;
            tar::Archive::new(file)
                .unpack(&ws)
                .with_context(|| format!("extracting into {}", ws.display()))?;
            Ok(())
        })
        .await?
    }
}
