//! Server-side connection state machine: negotiate parameters, receive the
//! pending inventory, drive the action loop to convergence, or execute a
//! remote command and stream its output.

use std::collections::BTreeMap;
use std::path::PathBuf;
use std::process::Stdio;

use anyhow::{Context, Result};
use log::{debug, info, warn};
use tokio::io::{AsyncBufRead, AsyncRead, AsyncWrite, AsyncWriteExt, BufReader};
use tokio::process::{Child, Command};
use tokio::sync::mpsc;

use crate::codec::{read_line, recv_file, write_line, Line, Verb};
use crate::inventory::FileEntry;

const DEFAULT_SEND_BUFFER_SIZE: usize = 512;

/// Per-connection state, created on accept and discarded on close.
#[derive(Debug, Default)]
struct SessionState {
    target_dir: String,
    sub_dir: String,
    expected_cache_md5: Option<String>,
    expected_cache_size: Option<u64>,
    send_buffer_size: usize,
    pending_inventory: BTreeMap<String, FileEntry>,
}

impl SessionState {
    fn new() -> Self {
        Self {
            send_buffer_size: DEFAULT_SEND_BUFFER_SIZE,
            ..Default::default()
        }
    }

    fn target_path(&self, rel: &str) -> PathBuf {
        PathBuf::from(&self.target_dir).join(rel)
    }
}

/// Drives one accepted connection through the protocol's dispatch loop.
pub struct ServerSession<R, W> {
    reader: BufReader<R>,
    writer: W,
    state: SessionState,
}

impl<R, W> ServerSession<R, W>
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
{
    pub fn new(reader: R, writer: W) -> Self {
        Self {
            reader: BufReader::new(reader),
            writer,
            state: SessionState::new(),
        }
    }

    /// Run the session to completion: dispatch loop until EOF, an unknown
    /// verb, or a handled terminal command.
    pub async fn run(&mut self) -> Result<()> {
        self.send_greeting().await?;
        loop {
            let Some(line) = read_line(&mut self.reader).await? else {
                debug!("client closed connection");
                return Ok(());
            };
            match line.verb_as::<Verb>() {
                Some(Verb::TargetDir) => self.handle_param("TARGET_DIR", &line, |s, v| s.target_dir = v).await?,
                Some(Verb::SubDir) => self.handle_param("SUB_DIR", &line, |s, v| s.sub_dir = v).await?,
                Some(Verb::CacheMd5) => {
                    self.handle_param("CACHE_MD5", &line, |s, v| s.expected_cache_md5 = Some(v))
                        .await?
                }
                Some(Verb::CacheSize) => self.handle_cache_size(&line).await?,
                Some(Verb::SendBufferSize) => self.handle_send_buffer_size(&line).await?,
                Some(Verb::CacheSend) => {
                    if !self.handle_cache_send().await? {
                        return Ok(());
                    }
                }
                Some(Verb::ActionRequest) => {
                    self.action_loop().await?;
                }
                Some(Verb::RunCommand) => {
                    self.exec(line.value.as_deref().unwrap_or("")).await?;
                    return Ok(());
                }
                Some(Verb::OutputRequest) | None => {
                    self.unknown_verb(&line.verb).await?;
                    return Ok(());
                }
            }
        }
    }

    async fn send_greeting(&mut self) -> Result<()> {
        self.writer.write_all(b"Welcome to bo server\ntarget_dir? ").await?;
        self.writer.flush().await?;
        Ok(())
    }

    async fn unknown_verb(&mut self, verb: &str) -> Result<()> {
        warn!("unknown command '{verb}'");
        let msg = format!("\n '{verb}' unknown command\n\n");
        self.writer.write_all(msg.as_bytes()).await?;
        self.writer.flush().await?;
        Ok(())
    }

    async fn handle_param(
        &mut self,
        name: &str,
        line: &Line,
        set: impl FnOnce(&mut SessionState, String),
    ) -> Result<()> {
        let value = line.value.clone().unwrap_or_default();
        info!("{name}: '{value}'");
        set(&mut self.state, value.clone());
        write_line(&mut self.writer, "ACCEPTED", Some(&value)).await
    }

    async fn handle_cache_size(&mut self, line: &Line) -> Result<()> {
        let raw = line.value.clone().unwrap_or_default();
        let size: u64 = raw.parse().context("CACHE_SIZE value was not a number")?;
        self.state.expected_cache_size = Some(size);
        write_line(&mut self.writer, "ACCEPTED", Some(&size.to_string())).await
    }

    async fn handle_send_buffer_size(&mut self, line: &Line) -> Result<()> {
        let raw = line.value.clone().unwrap_or_default();
        let size: usize = raw
            .parse()
            .context("SEND_BUFFER_SIZE value was not a number")?;
        self.state.send_buffer_size = size;
        write_line(&mut self.writer, "ACCEPTED", Some(&size.to_string())).await
    }

    /// `CACHE_SEND`: ack the command, receive exactly `expected_cache_size`
    /// bytes, verify against `expected_cache_md5`, ack the payload too, and
    /// parse the bytes as the pending inventory. Returns `false` if the
    /// session should close.
    async fn handle_cache_send(&mut self) -> Result<bool> {
        write_line(&mut self.writer, "ACCEPTED", None).await?;

        let size = self
            .state
            .expected_cache_size
            .context("CACHE_SEND received before CACHE_SIZE")?;
        let expected_md5 = self
            .state
            .expected_cache_md5
            .clone()
            .context("CACHE_SEND received before CACHE_MD5")?;

        let (data, got_md5) = recv_file(&mut self.reader, size).await?;
        if got_md5 != expected_md5 {
            warn!("WRONG_MD5: expected {expected_md5}, got {got_md5}");
            write_line(&mut self.writer, "WRONG_MD5", None).await?;
            return Ok(false);
        }
        write_line(&mut self.writer, "ACCEPTED", None).await?;

        self.state.pending_inventory = if data.is_empty() {
            BTreeMap::new()
        } else {
            serde_yaml::from_slice(&data).context("parsing received pending inventory")?
        };
        Ok(true)
    }

    /// `ACTION_REQUEST`: iterate the pending inventory in the order it was
    /// received, issuing a delete or a pull per entry, then announce
    /// completion.
    async fn action_loop(&mut self) -> Result<()> {
        use crate::inventory::SyncState;

        let entries: Vec<(String, FileEntry)> = self
            .state
            .pending_inventory
            .iter()
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect();

        for (rel_path, info) in entries {
            let fullpath = self.state.target_path(&rel_path);
            match info.required_sync {
                SyncState::Delete => {
                    if fullpath.is_file() {
                        std::fs::remove_file(&fullpath)
                            .with_context(|| format!("deleting {}", fullpath.display()))?;
                    }
                    write_line(&mut self.writer, "ACTION_DELETED", Some(&rel_path)).await?;
                    if !self.expect_action_request().await? {
                        return Ok(());
                    }
                }
                SyncState::Update => {
                    if let Some(parent) = fullpath.parent() {
                        std::fs::create_dir_all(parent)
                            .with_context(|| format!("creating {}", parent.display()))?;
                    }
                    write_line(&mut self.writer, "ACTION_SEND_ME_FILE", Some(&rel_path)).await?;
                    let (data, got_md5) = recv_file(&mut self.reader, info.size).await?;
                    if got_md5 != info.md5 {
                        warn!("WRONG_MD5 for {rel_path}: expected {}, got {got_md5}", info.md5);
                        write_line(&mut self.writer, "WRONG_MD5", None).await?;
                        return Ok(());
                    }
                    std::fs::write(&fullpath, &data)
                        .with_context(|| format!("writing {}", fullpath.display()))?;
                    write_line(&mut self.writer, "ACCEPTED", None).await?;
                    if !self.expect_action_request().await? {
                        return Ok(());
                    }
                }
                SyncState::None => {}
            }
        }

        write_line(&mut self.writer, "ACTIONS_COMPLETED", None).await
    }

    async fn expect_action_request(&mut self) -> Result<bool> {
        let Some(line) = read_line(&mut self.reader).await? else {
            return Ok(false);
        };
        if line.verb_as::<Verb>() != Some(Verb::ActionRequest) {
            warn!("expected ACTION_REQUEST, got '{}'; closing", line.verb);
            return Ok(false);
        }
        Ok(true)
    }

    /// `RUN_COMMAND <json argv>`: ack, then drive the output-polling loop
    /// until the child exits.
    async fn exec(&mut self, json_argv: &str) -> Result<()> {
        write_line(&mut self.writer, "ACCEPTED", Some(json_argv)).await?;

        let Some(line) = read_line(&mut self.reader).await? else {
            return Ok(());
        };
        if line.verb_as::<Verb>() != Some(Verb::OutputRequest) {
            write_line(&mut self.writer, "FAILED", None).await?;
            return Ok(());
        }

        let argv: Vec<String> = match serde_json::from_str(json_argv) {
            Ok(v) => v,
            Err(e) => {
                write_line(&mut self.writer, "OUTPUT_FAILED", Some(&format!("bad argv json: {e}"))).await?;
                return Ok(());
            }
        };

        let dir = if self.state.sub_dir.is_empty() {
            PathBuf::from(&self.state.target_dir)
        } else {
            PathBuf::from(&self.state.target_dir).join(&self.state.sub_dir)
        };
        if !dir.is_dir() {
            write_line(
                &mut self.writer,
                "OUTPUT_FAILED",
                Some(&format!("{} - not found directory", dir.display())),
            )
            .await?;
            return Ok(());
        }

        let command_line = argv.join(" ");
        let mut preamble: std::collections::VecDeque<String> = [
            dir.display().to_string(),
            command_line.clone(),
            "Output:".to_string(),
        ]
        .into_iter()
        .collect();

        let spawned = spawn_shell(&command_line, &dir);
        let mut child_output = match spawned {
            Ok(child) => ChildOutput::new(child),
            Err(e) => {
                write_line(&mut self.writer, "OUTPUT_FAILED", Some(&e.to_string())).await?;
                return Ok(());
            }
        };

        // The `OUTPUT_REQUEST` already read above pairs with the first
        // reply below; every subsequent reply consumes one more request
        // read at the bottom of the loop, so exactly one frame answers
        // each request.
        loop {
            if let Some(line) = preamble.pop_front() {
                write_line(&mut self.writer, "OUTPUT", Some(&line)).await?;
            } else {
                match child_output.next_event().await? {
                    OutputEvent::Line(text) => write_line(&mut self.writer, "OUTPUT", Some(&text)).await?,
                    OutputEvent::Finished(code) => {
                        write_line(&mut self.writer, "OUTPUT_FINISHED", Some(&code.to_string())).await?;
                        return Ok(());
                    }
                }
            }

            let Some(req) = read_line(&mut self.reader).await? else {
                return Ok(());
            };
            if req.verb_as::<Verb>() != Some(Verb::OutputRequest) {
                write_line(&mut self.writer, "FAILED", None).await?;
                return Ok(());
            }
        }
    }
}

#[cfg(unix)]
fn spawn_shell(command_line: &str, dir: &std::path::Path) -> Result<Child> {
    Command::new("sh")
        .arg("-c")
        .arg(command_line)
        .current_dir(dir)
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .spawn()
        .context("spawning shell")
}

#[cfg(windows)]
fn spawn_shell(command_line: &str, dir: &std::path::Path) -> Result<Child> {
    Command::new("cmd")
        .arg("/c")
        .arg(command_line)
        .current_dir(dir)
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .spawn()
        .context("spawning cmd")
}

enum OutputEvent {
    Line(String),
    Finished(i32),
}

/// Merges a child's stdout and stderr into a single ordered-by-arrival line
/// stream, and reports the exit code once both are drained.
struct ChildOutput {
    child: Child,
    lines: mpsc::UnboundedReceiver<String>,
    finished: bool,
}

impl ChildOutput {
    fn new(mut child: Child) -> Self {
        let (tx, lines) = mpsc::unbounded_channel();
        if let Some(stdout) = child.stdout.take() {
            spawn_line_forwarder(stdout, tx.clone());
        }
        if let Some(stderr) = child.stderr.take() {
            spawn_line_forwarder(stderr, tx.clone());
        }
        drop(tx);
        Self {
            child,
            lines,
            finished: false,
        }
    }

    async fn next_event(&mut self) -> Result<OutputEvent> {
        if let Some(line) = self.lines.recv().await {
            return Ok(OutputEvent::Line(line));
        }
        if !self.finished {
            self.finished = true;
        }
        let status = self.child.wait().await.context("waiting for child process")?;
        Ok(OutputEvent::Finished(status.code().unwrap_or(-1)))
    }
}

fn spawn_line_forwarder<T: tokio::io::AsyncRead + Unpin + Send + 'static>(
    stream: T,
    tx: mpsc::UnboundedSender<String>,
) {
    tokio::spawn(async move {
        let mut reader = BufReader::new(stream);
        loop {
            let mut buf = String::new();
            match read_text_line(&mut reader, &mut buf).await {
                Ok(0) => break,
                Ok(_) => {
                    if tx.send(buf.trim_end_matches('\n').to_string()).is_err() {
                        break;
                    }
                }
                Err(_) => break,
            }
        }
    });
}

async fn read_text_line<R: AsyncBufRead + Unpin>(reader: &mut R, buf: &mut String) -> Result<usize> {
    use tokio::io::AsyncBufReadExt;
    Ok(reader.read_line(buf).await?)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::inventory::SyncState;
    use tempfile::tempdir;

    fn entry(required_sync: SyncState, md5: &str, size: u64) -> FileEntry {
        FileEntry {
            md5: md5.to_string(),
            size,
            last_modify: 0.0,
            last_modify_formatted: String::new(),
            required_sync,
            version: 1,
        }
    }

    #[tokio::test]
    async fn unknown_verb_closes_with_message() {
        let (mut client, server_side) = tokio::io::duplex(1024);
        let (sr, sw) = tokio::io::split(server_side);
        let mut session = ServerSession::new(sr, sw);

        let task = tokio::spawn(async move { session.run().await });

        let mut buf = vec![0u8; 64];
        let n = tokio::io::AsyncReadExt::read(&mut client, &mut buf).await.unwrap();
        assert!(String::from_utf8_lossy(&buf[..n]).starts_with("Welcome to bo server\ntarget_dir? "));

        tokio::io::AsyncWriteExt::write_all(&mut client, b"BOGUS\n").await.unwrap();
        let n = tokio::io::AsyncReadExt::read(&mut client, &mut buf).await.unwrap();
        assert!(String::from_utf8_lossy(&buf[..n]).contains("unknown command"));

        task.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn action_loop_deletes_then_completes() {
        let dir = tempdir().unwrap();
        std::fs::write(dir.path().join("gone.txt"), b"x").unwrap();

        let (mut client, server_side) = tokio::io::duplex(1 << 16);
        let (sr, sw) = tokio::io::split(server_side);
        let mut session = ServerSession::new(sr, sw);
        session.state.target_dir = dir.path().to_string_lossy().to_string();
        session.state.pending_inventory.insert(
            "gone.txt".to_string(),
            entry(SyncState::Delete, "", 0),
        );

        let task = tokio::spawn(async move {
            session.action_loop().await.unwrap();
        });

        write_line(&mut client, "ACTION_REQUEST", None).await.unwrap();
        let mut reader = BufReader::new(&mut client);
        let l1 = read_line(&mut reader).await.unwrap().unwrap();
        assert_eq!(l1.verb, "ACTION_DELETED");
        assert_eq!(l1.value.as_deref(), Some("gone.txt"));

        let l2 = read_line(&mut reader).await.unwrap().unwrap();
        assert_eq!(l2.verb, "ACTIONS_COMPLETED");

        task.await.unwrap();
        assert!(!dir.path().join("gone.txt").exists());
    }
}
