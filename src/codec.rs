//! Wire codec shared by client and server: line-oriented command frames and
//! raw binary file payloads sharing one stream.

use anyhow::{Context, Result};
use md5::Context as Md5Context;
use tokio::io::{AsyncBufRead, AsyncBufReadExt, AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

/// Command frames are read as at most this many bytes, matching the
/// original protocol's `recv(1024)` framing.
pub const MAX_LINE_BYTES: usize = 1024;

/// The closed set of verbs a client may send.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Verb {
    TargetDir,
    SubDir,
    CacheMd5,
    CacheSize,
    SendBufferSize,
    CacheSend,
    ActionRequest,
    RunCommand,
    OutputRequest,
}

impl Verb {
    pub fn as_str(self) -> &'static str {
        match self {
            Verb::TargetDir => "TARGET_DIR",
            Verb::SubDir => "SUB_DIR",
            Verb::CacheMd5 => "CACHE_MD5",
            Verb::CacheSize => "CACHE_SIZE",
            Verb::SendBufferSize => "SEND_BUFFER_SIZE",
            Verb::CacheSend => "CACHE_SEND",
            Verb::ActionRequest => "ACTION_REQUEST",
            Verb::RunCommand => "RUN_COMMAND",
            Verb::OutputRequest => "OUTPUT_REQUEST",
        }
    }
}

impl std::str::FromStr for Verb {
    type Err = ();

    fn from_str(s: &str) -> std::result::Result<Self, ()> {
        Ok(match s {
            "TARGET_DIR" => Verb::TargetDir,
            "SUB_DIR" => Verb::SubDir,
            "CACHE_MD5" => Verb::CacheMd5,
            "CACHE_SIZE" => Verb::CacheSize,
            "SEND_BUFFER_SIZE" => Verb::SendBufferSize,
            "CACHE_SEND" => Verb::CacheSend,
            "ACTION_REQUEST" => Verb::ActionRequest,
            "RUN_COMMAND" => Verb::RunCommand,
            "OUTPUT_REQUEST" => Verb::OutputRequest,
            _ => return Err(()),
        })
    }
}

/// A parsed command line: the raw verb token plus whatever followed the
/// first space. The value may itself contain spaces.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Line {
    pub verb: String,
    pub value: Option<String>,
}

impl Line {
    pub fn new(verb: impl Into<String>, value: Option<impl Into<String>>) -> Self {
        Self {
            verb: verb.into(),
            value: value.map(Into::into),
        }
    }

    fn parse(raw: &str) -> Option<Self> {
        let trimmed = raw.trim_end_matches(['\n', '\r']);
        let trimmed = trimmed.trim();
        if trimmed.is_empty() {
            return None;
        }
        match trimmed.split_once(' ') {
            Some((verb, value)) => Some(Line::new(verb, Some(value))),
            None => Some(Line::new(trimmed, None::<String>)),
        }
    }

    pub fn verb_as<T: std::str::FromStr>(&self) -> Option<T> {
        self.verb.parse().ok()
    }
}

/// Read one command line from `reader`, or `None` on a blank read (treated
/// as connection close by callers, same as the original empty-buf case).
pub async fn read_line<R: AsyncBufRead + Unpin>(reader: &mut R) -> Result<Option<Line>> {
    let mut buf = Vec::new();
    let mut limited = reader.take(MAX_LINE_BYTES as u64);
    let n = limited.read_until(b'\n', &mut buf).await?;
    if n == 0 {
        return Ok(None);
    }
    let text = String::from_utf8_lossy(&buf);
    Ok(Line::parse(&text))
}

/// Write one command line: `VERB` or `VERB VALUE`, terminated by `\n`.
pub async fn write_line<W: AsyncWrite + Unpin>(
    writer: &mut W,
    verb: &str,
    value: Option<&str>,
) -> Result<()> {
    let line = match value {
        Some(v) => format!("{verb} {v}\n"),
        None => format!("{verb}\n"),
    };
    writer.write_all(line.as_bytes()).await?;
    writer.flush().await?;
    Ok(())
}

/// Send a file's bytes in `send_buffer_size`-sized chunks. The framing
/// carries no length prefix; the receiver already knows `size` from a
/// prior `CACHE_SIZE` or inventory-entry `size`.
pub async fn send_file<W: AsyncWrite + Unpin>(
    writer: &mut W,
    data: &[u8],
    send_buffer_size: usize,
) -> Result<()> {
    let chunk_size = send_buffer_size.max(1);
    for chunk in data.chunks(chunk_size) {
        writer.write_all(chunk).await?;
    }
    writer.flush().await?;
    Ok(())
}

/// Receive exactly `size` bytes and return them alongside their md5 digest.
pub async fn recv_file<R: AsyncRead + Unpin>(reader: &mut R, size: u64) -> Result<(Vec<u8>, String)> {
    let mut data = vec![0u8; size as usize];
    reader
        .read_exact(&mut data)
        .await
        .context("mid-stream EOF while receiving file payload")?;
    let mut ctx = Md5Context::new();
    ctx.consume(&data);
    Ok((data, format!("{:x}", ctx.compute())))
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::BufReader;

    #[test]
    fn parses_verb_only() {
        let line = Line::parse("ACTIONS_COMPLETED\n").unwrap();
        assert_eq!(line.verb, "ACTIONS_COMPLETED");
        assert_eq!(line.value, None);
    }

    #[test]
    fn splits_once_on_first_space() {
        let line = Line::parse("ACTION_SEND_ME_FILE d/my file.bin\n").unwrap();
        assert_eq!(line.verb, "ACTION_SEND_ME_FILE");
        assert_eq!(line.value.as_deref(), Some("d/my file.bin"));
    }

    #[tokio::test]
    async fn read_line_round_trips_through_duplex() {
        let (mut a, mut b) = tokio::io::duplex(64);
        write_line(&mut a, "TARGET_DIR", Some("/srv/app")).await.unwrap();
        let mut reader = BufReader::new(&mut b);
        let line = read_line(&mut reader).await.unwrap().unwrap();
        assert_eq!(line.verb, "TARGET_DIR");
        assert_eq!(line.value.as_deref(), Some("/srv/app"));
    }

    #[tokio::test]
    async fn send_buffer_size_does_not_change_bytes_received() {
        let payload: Vec<u8> = (0u8..=255).cycle().take(10_000).collect();
        for chunk in [1usize, 65536] {
            let (mut a, mut b) = tokio::io::duplex(1 << 20);
            let data = payload.clone();
            let writer = tokio::spawn(async move {
                send_file(&mut a, &data, chunk).await.unwrap();
            });
            let (received, _md5) = recv_file(&mut b, payload.len() as u64).await.unwrap();
            writer.await.unwrap();
            assert_eq!(received, payload);
        }
    }

    #[tokio::test]
    async fn zero_byte_payload_round_trips() {
        let (mut a, mut b) = tokio::io::duplex(16);
        let writer = tokio::spawn(async move {
            send_file(&mut a, &[], 512).await.unwrap();
        });
        let (received, md5_hex) = recv_file(&mut b, 0).await.unwrap();
        writer.await.unwrap();
        assert!(received.is_empty());
        assert_eq!(md5_hex, format!("{:x}", md5::Context::new().compute()));
    }
}
