//! Client-side driver for both protocol modes: pushing a sync inventory and
//! draining the action loop, or running a remote command and streaming its
//! output.

use std::path::Path;

use anyhow::{anyhow, bail, Context, Result};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, BufReader};

use crate::codec::{read_line, send_file, write_line};
use crate::inventory::FileEntry;
use std::collections::BTreeMap;

/// What happened during one `sync()` call, so the caller can fold the
/// outcome back into its local inventory by marking synced paths `NONE`.
#[derive(Debug, Default, Clone)]
pub struct SyncReport {
    pub deleted: Vec<String>,
    pub updated: Vec<String>,
}

pub struct ClientSession<R, W> {
    reader: BufReader<R>,
    writer: W,
}

impl<R, W> ClientSession<R, W>
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
{
    pub fn new(reader: R, writer: W) -> Self {
        Self {
            reader: BufReader::new(reader),
            writer,
        }
    }

    /// Consume the server's opening greeting (`Welcome to bo server\n` plus
    /// a `target_dir? ` pre-prompt). The greeting carries no information the
    /// client needs, so it is read once and discarded rather than parsed.
    pub async fn handshake(&mut self) -> Result<()> {
        let mut buf = [0u8; crate::codec::MAX_LINE_BYTES];
        let _ = self.reader.read(&mut buf).await.context("reading greeting")?;
        Ok(())
    }

    async fn expect(&mut self, verb: &str) -> Result<Option<String>> {
        let line = read_line(&mut self.reader)
            .await?
            .ok_or_else(|| anyhow!("connection closed waiting for {verb}"))?;
        if line.verb != verb {
            bail!("expected {verb}, server sent '{}'", line.verb);
        }
        Ok(line.value)
    }

    /// Negotiate parameters, push the pending inventory, and drive the
    /// action loop to `ACTIONS_COMPLETED`.
    pub async fn sync(
        &mut self,
        target_dir: &str,
        send_buffer_size: usize,
        pending: &BTreeMap<String, FileEntry>,
        workspace: &Path,
    ) -> Result<SyncReport> {
        self.handshake().await?;
        write_line(&mut self.writer, "TARGET_DIR", Some(target_dir)).await?;
        self.expect("ACCEPTED").await?;

        let payload = serde_yaml::to_string(pending)
            .context("serializing pending inventory")?
            .into_bytes();
        let digest = {
            let mut ctx = md5::Context::new();
            ctx.consume(&payload);
            format!("{:x}", ctx.compute())
        };

        write_line(&mut self.writer, "CACHE_MD5", Some(&digest)).await?;
        self.expect("ACCEPTED").await?;
        write_line(&mut self.writer, "CACHE_SIZE", Some(&payload.len().to_string())).await?;
        self.expect("ACCEPTED").await?;
        write_line(
            &mut self.writer,
            "SEND_BUFFER_SIZE",
            Some(&send_buffer_size.to_string()),
        )
        .await?;
        self.expect("ACCEPTED").await?;

        write_line(&mut self.writer, "CACHE_SEND", None).await?;
        self.expect("ACCEPTED").await?;
        send_file(&mut self.writer, &payload, send_buffer_size).await?;
        self.expect("ACCEPTED").await?;

        let mut report = SyncReport::default();
        write_line(&mut self.writer, "ACTION_REQUEST", None).await?;
        loop {
            let line = read_line(&mut self.reader)
                .await?
                .ok_or_else(|| anyhow!("connection closed during action loop"))?;
            match line.verb.as_str() {
                "ACTION_DELETED" => {
                    let path = line.value.unwrap_or_default();
                    report.deleted.push(path);
                    write_line(&mut self.writer, "ACTION_REQUEST", None).await?;
                }
                "ACTION_SEND_ME_FILE" => {
                    let path = line.value.ok_or_else(|| anyhow!("ACTION_SEND_ME_FILE missing path"))?;
                    let abs = workspace.join(&path);
                    let data = std::fs::read(&abs)
                        .with_context(|| format!("reading {}", abs.display()))?;
                    send_file(&mut self.writer, &data, send_buffer_size).await?;
                    match self.expect_one_of(&["ACCEPTED", "WRONG_MD5"]).await? {
                        ("WRONG_MD5", _) => bail!("server rejected {path}: md5 mismatch"),
                        _ => {
                            report.updated.push(path);
                            write_line(&mut self.writer, "ACTION_REQUEST", None).await?;
                        }
                    }
                }
                "ACTIONS_COMPLETED" => return Ok(report),
                "WRONG_MD5" => bail!("server rejected pending inventory: md5 mismatch"),
                other => bail!("unexpected server frame '{other}' during action loop"),
            }
        }
    }

    async fn expect_one_of(&mut self, verbs: &[&'static str]) -> Result<(&'static str, Option<String>)> {
        let line = read_line(&mut self.reader)
            .await?
            .ok_or_else(|| anyhow!("connection closed"))?;
        for v in verbs {
            if line.verb == *v {
                return Ok((v, line.value));
            }
        }
        bail!("expected one of {verbs:?}, server sent '{}'", line.verb)
    }

    /// Negotiate a remote command and stream its output through `on_line`
    /// until the server reports completion, returning the exit code.
    pub async fn run_command(
        &mut self,
        target_dir: &str,
        sub_dir: &str,
        argv: &[String],
        mut on_line: impl FnMut(&str),
    ) -> Result<i32> {
        self.handshake().await?;
        write_line(&mut self.writer, "TARGET_DIR", Some(target_dir)).await?;
        self.expect("ACCEPTED").await?;
        write_line(&mut self.writer, "SUB_DIR", Some(sub_dir)).await?;
        self.expect("ACCEPTED").await?;

        let json_argv = serde_json::to_string(argv).context("serializing command argv")?;
        write_line(&mut self.writer, "RUN_COMMAND", Some(&json_argv)).await?;
        self.expect("ACCEPTED").await?;

        loop {
            write_line(&mut self.writer, "OUTPUT_REQUEST", None).await?;
            let line = read_line(&mut self.reader)
                .await?
                .ok_or_else(|| anyhow!("connection closed during command output"))?;
            match line.verb.as_str() {
                "OUTPUT" => on_line(&line.value.unwrap_or_default()),
                "OUTPUT_FINISHED" => {
                    let code: i32 = line
                        .value
                        .unwrap_or_default()
                        .parse()
                        .context("parsing OUTPUT_FINISHED exit code")?;
                    return Ok(code);
                }
                "OUTPUT_FAILED" => bail!("remote command failed: {}", line.value.unwrap_or_default()),
                "FAILED" => bail!("server rejected command request"),
                other => bail!("unexpected server frame '{other}' during command output"),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::inventory::SyncState;
    use crate::server::ServerSession;
    use tempfile::tempdir;

    fn entry(required_sync: SyncState, abs: &Path) -> FileEntry {
        let md5 = crate::inventory::md5_of_file(abs).unwrap();
        let size = std::fs::metadata(abs).unwrap().len();
        FileEntry {
            md5,
            size,
            last_modify: 0.0,
            last_modify_formatted: String::new(),
            required_sync,
            version: 1,
        }
    }

    #[tokio::test]
    async fn sync_pushes_update_and_completes() {
        let server_dir = tempdir().unwrap();
        let client_dir = tempdir().unwrap();
        std::fs::write(client_dir.path().join("a.txt"), b"hello\n").unwrap();

        let (client_io, server_io) = tokio::io::duplex(1 << 16);
        let (sr, sw) = tokio::io::split(server_io);
        let (cr, cw) = tokio::io::split(client_io);

        let mut server = ServerSession::new(sr, sw);
        let server_task = tokio::spawn(async move { server.run().await.unwrap() });

        let mut client = ClientSession::new(cr, cw);
        let mut pending = BTreeMap::new();
        pending.insert(
            "a.txt".to_string(),
            entry(SyncState::Update, &client_dir.path().join("a.txt")),
        );

        let report = client
            .sync(
                &server_dir.path().to_string_lossy(),
                512,
                &pending,
                client_dir.path(),
            )
            .await
            .unwrap();

        assert_eq!(report.updated, vec!["a.txt".to_string()]);
        assert_eq!(
            std::fs::read(server_dir.path().join("a.txt")).unwrap(),
            b"hello\n"
        );
        drop(client);
        server_task.await.unwrap();
    }
}
