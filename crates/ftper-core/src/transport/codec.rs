// SPDX-License-Identifier: AGPL-3.0
// Ftper Core - FTP control channel codec
//
// Line-oriented command/reply exchange (RFC 959), passive-mode address
// parsing, and the byte pump used on data connections.

use super::TransferProgress;
use crate::types::TransportError;
use regex::Regex;
use std::net::{Ipv4Addr, SocketAddrV4};
use std::sync::OnceLock;
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, BufReader};
use tokio_util::sync::CancellationToken;

/// Copy buffer for data connections
const CHUNK_SIZE: usize = 64 * 1024;

/// Report progress at most once per this many bytes
const PROGRESS_STEP: u64 = 32 * 1024;

/// A complete server reply, possibly spanning several lines
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Reply {
    pub code: u16,
    pub lines: Vec<String>,
}

impl Reply {
    /// Text of the final line without the code
    pub fn message(&self) -> &str {
        self.lines
            .last()
            .map(|l| l.get(4..).unwrap_or("").trim())
            .unwrap_or("")
    }

    /// 1xx
    pub fn is_preliminary(&self) -> bool {
        (100..200).contains(&self.code)
    }

    /// 2xx
    pub fn is_success(&self) -> bool {
        (200..300).contains(&self.code)
    }

    /// 3xx
    pub fn is_intermediate(&self) -> bool {
        (300..400).contains(&self.code)
    }
}

impl std::fmt::Display for Reply {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{} {}", self.code, self.message())
    }
}

/// Command/reply half of an FTP session
pub struct ControlChannel<S> {
    stream: BufReader<S>,
}

impl<S> ControlChannel<S>
where
    S: AsyncRead + AsyncWrite + Unpin + Send,
{
    pub fn new(stream: S) -> Self {
        Self {
            stream: BufReader::new(stream),
        }
    }

    pub async fn send(&mut self, command: &str) -> Result<(), TransportError> {
        if command.starts_with("PASS ") {
            tracing::trace!("ftp > PASS ****");
        } else {
            tracing::trace!("ftp > {}", command);
        }

        let stream = self.stream.get_mut();
        stream.write_all(command.as_bytes()).await?;
        stream.write_all(b"\r\n").await?;
        stream.flush().await?;
        Ok(())
    }

    pub async fn read_reply(&mut self) -> Result<Reply, TransportError> {
        let first = self.read_line().await?;
        let code = parse_code(&first)?;
        let multiline = first.as_bytes().get(3) == Some(&b'-');
        let mut lines = vec![first];

        if multiline {
            let terminator = format!("{} ", code);
            loop {
                let line = self.read_line().await?;
                let done = line.starts_with(&terminator) || line == code.to_string();
                lines.push(line);
                if done {
                    break;
                }
            }
        }

        let reply = Reply { code, lines };
        tracing::trace!("ftp < {}", reply);
        Ok(reply)
    }

    async fn read_line(&mut self) -> Result<String, TransportError> {
        let mut line = String::new();
        let n = self.stream.read_line(&mut line).await?;
        if n == 0 {
            return Err(TransportError::Transfer(
                "connection closed by server".to_string(),
            ));
        }
        Ok(line.trim_end_matches(['\r', '\n']).to_string())
    }

    /// Send a command and read its reply, whatever the code
    pub async fn execute(&mut self, command: &str) -> Result<Reply, TransportError> {
        self.send(command).await?;
        self.read_reply().await
    }

    /// Send a command and require a reply whose code starts with `class`
    pub async fn expect(&mut self, command: &str, class: u16) -> Result<Reply, TransportError> {
        let reply = self.execute(command).await?;
        if reply.code / 100 != class {
            let verb = command.split_whitespace().next().unwrap_or(command);
            return Err(TransportError::Transfer(format!("{} failed: {}", verb, reply)));
        }
        Ok(reply)
    }
}

fn parse_code(line: &str) -> Result<u16, TransportError> {
    line.get(..3)
        .filter(|c| c.bytes().all(|b| b.is_ascii_digit()))
        .and_then(|c| c.parse().ok())
        .ok_or_else(|| TransportError::Transfer(format!("malformed reply: {:?}", line)))
}

fn pasv_regex() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(r"(\d{1,3}),(\d{1,3}),(\d{1,3}),(\d{1,3}),(\d{1,3}),(\d{1,3})")
            .unwrap_or_else(|e| panic!("invalid PASV pattern: {}", e))
    })
}

fn epsv_regex() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(r"\((.)(.)(.)(\d{1,5})(.)\)")
            .unwrap_or_else(|e| panic!("invalid EPSV pattern: {}", e))
    })
}

/// Address from a `227 Entering Passive Mode (h1,h2,h3,h4,p1,p2)` reply
pub fn parse_pasv(reply: &Reply) -> Result<SocketAddrV4, TransportError> {
    let bad = || TransportError::Transfer(format!("bad PASV reply: {}", reply));
    let caps = pasv_regex().captures(reply.message()).ok_or_else(bad)?;

    let mut parts = [0u8; 6];
    for (i, part) in parts.iter_mut().enumerate() {
        *part = caps[i + 1].parse().map_err(|_| bad())?;
    }

    let ip = Ipv4Addr::new(parts[0], parts[1], parts[2], parts[3]);
    let port = u16::from(parts[4]) << 8 | u16::from(parts[5]);
    Ok(SocketAddrV4::new(ip, port))
}

/// Port from a `229 Entering Extended Passive Mode (|||port|)` reply
pub fn parse_epsv(reply: &Reply) -> Result<u16, TransportError> {
    let bad = || TransportError::Transfer(format!("bad EPSV reply: {}", reply));
    let caps = epsv_regex().captures(reply.message()).ok_or_else(bad)?;

    let delim = &caps[1];
    if &caps[2] != delim || &caps[3] != delim || &caps[5] != delim {
        return Err(bad());
    }
    caps[4].parse().map_err(|_| bad())
}

/// Path from a `257 "/pub" is current directory` reply.
///
/// A doubled quote inside the path stands for one literal quote.
pub fn parse_quoted_path(reply: &Reply) -> Result<String, TransportError> {
    let bad = || TransportError::Transfer(format!("bad path reply: {}", reply));
    let message = reply.message();
    let start = message.find('"').ok_or_else(bad)?;

    let mut path = String::new();
    let mut chars = message[start + 1..].chars().peekable();
    while let Some(c) = chars.next() {
        if c != '"' {
            path.push(c);
        } else if chars.peek() == Some(&'"') {
            chars.next();
            path.push('"');
        } else {
            return Ok(path);
        }
    }
    Err(bad())
}

/// Copy `reader` into `writer` until EOF.
///
/// `start` is the absolute position already on the destination; progress is
/// reported as absolute positions. Each read and write must make progress
/// within `stall`, and `cancel` stops the copy after the current chunk.
pub async fn pump<R, W>(
    reader: &mut R,
    writer: &mut W,
    start: u64,
    total: Option<u64>,
    progress: &(dyn Fn(TransferProgress) + Send + Sync),
    cancel: &CancellationToken,
    stall: Duration,
) -> Result<u64, TransportError>
where
    R: AsyncRead + Unpin + Send,
    W: AsyncWrite + Unpin + Send,
{
    let mut buf = vec![0u8; CHUNK_SIZE];
    let mut position = start;
    let mut reported = start;

    loop {
        let n = tokio::select! {
            _ = cancel.cancelled() => return Err(TransportError::Cancelled),
            read = tokio::time::timeout(stall, reader.read(&mut buf)) => {
                read.map_err(|_| TransportError::Transfer("timeout".to_string()))??
            }
        };
        if n == 0 {
            break;
        }

        tokio::select! {
            _ = cancel.cancelled() => return Err(TransportError::Cancelled),
            written = tokio::time::timeout(stall, writer.write_all(&buf[..n])) => {
                written.map_err(|_| TransportError::Transfer("timeout".to_string()))??
            }
        }
        position += n as u64;

        if position - reported >= PROGRESS_STEP {
            reported = position;
            progress(TransferProgress {
                bytes_transferred: position,
                bytes_total: total,
            });
        }
    }

    writer.flush().await?;
    progress(TransferProgress {
        bytes_transferred: position,
        bytes_total: total.or(Some(position)),
    });
    Ok(position)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;
    use tokio::io::duplex;

    fn reply(code: u16, text: &str) -> Reply {
        Reply {
            code,
            lines: vec![format!("{} {}", code, text)],
        }
    }

    #[tokio::test]
    async fn test_single_and_multiline_replies() {
        let (client, mut server) = duplex(1024);
        let mut control = ControlChannel::new(client);

        server
            .write_all(b"220 Welcome\r\n211-Features:\r\n SIZE\r\n REST STREAM\r\n211 End\r\n")
            .await
            .unwrap();

        let banner = control.read_reply().await.unwrap();
        assert_eq!(banner.code, 220);
        assert_eq!(banner.message(), "Welcome");

        let feat = control.read_reply().await.unwrap();
        assert_eq!(feat.code, 211);
        assert_eq!(feat.lines.len(), 4);
        assert!(feat.is_success());
    }

    #[tokio::test]
    async fn test_send_terminates_with_crlf() {
        let (client, mut server) = duplex(1024);
        let mut control = ControlChannel::new(client);
        control.send("TYPE I").await.unwrap();

        let mut buf = [0u8; 8];
        server.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"TYPE I\r\n");
    }

    #[tokio::test]
    async fn test_expect_rejects_wrong_class() {
        let (client, mut server) = duplex(1024);
        let mut control = ControlChannel::new(client);
        server.write_all(b"550 No such file\r\n").await.unwrap();

        let err = control.expect("SIZE /missing", 2).await.unwrap_err();
        assert_eq!(err.to_string(), "SIZE failed: 550 No such file");
    }

    #[tokio::test]
    async fn test_closed_connection() {
        let (client, server) = duplex(1024);
        drop(server);
        let mut control = ControlChannel::new(client);
        assert!(control.read_reply().await.is_err());
    }

    #[test]
    fn test_parse_pasv() {
        let addr = parse_pasv(&reply(227, "Entering Passive Mode (192,168,1,10,195,80)")).unwrap();
        assert_eq!(addr, SocketAddrV4::new(Ipv4Addr::new(192, 168, 1, 10), 50000));

        assert!(parse_pasv(&reply(227, "Entering Passive Mode")).is_err());
        assert!(parse_pasv(&reply(227, "(300,1,1,1,1,1)")).is_err());
    }

    #[test]
    fn test_parse_epsv() {
        assert_eq!(
            parse_epsv(&reply(229, "Entering Extended Passive Mode (|||6446|)")).unwrap(),
            6446
        );
        assert!(parse_epsv(&reply(229, "Entering Extended Passive Mode (|!|6446|)")).is_err());
    }

    #[test]
    fn test_parse_quoted_path() {
        assert_eq!(
            parse_quoted_path(&reply(257, "\"/pub/music\" is current directory")).unwrap(),
            "/pub/music"
        );
        assert_eq!(
            parse_quoted_path(&reply(257, "\"/say \"\"hi\"\"\" created")).unwrap(),
            "/say \"hi\""
        );
        assert!(parse_quoted_path(&reply(257, "no quotes here")).is_err());
        assert!(parse_quoted_path(&reply(257, "\"/unterminated")).is_err());
    }

    #[tokio::test]
    async fn test_pump_reports_absolute_progress() {
        let data = vec![7u8; 100_000];
        let mut reader: &[u8] = &data;
        let mut out = Vec::new();
        let seen = Mutex::new(Vec::new());
        let cancel = CancellationToken::new();

        let end = pump(
            &mut reader,
            &mut out,
            1000,
            Some(101_000),
            &|p| seen.lock().unwrap().push(p.bytes_transferred),
            &cancel,
            Duration::from_secs(5),
        )
        .await
        .unwrap();

        assert_eq!(end, 101_000);
        assert_eq!(out.len(), 100_000);
        let seen = seen.lock().unwrap();
        assert!(seen.windows(2).all(|w| w[0] <= w[1]));
        assert_eq!(seen.last(), Some(&101_000));
    }

    #[tokio::test]
    async fn test_pump_stops_on_cancel() {
        let (mut reader, _writer) = duplex(1024);
        let mut out = Vec::new();
        let cancel = CancellationToken::new();
        cancel.cancel();

        let err = pump(
            &mut reader,
            &mut out,
            0,
            None,
            &|_| {},
            &cancel,
            Duration::from_secs(5),
        )
        .await
        .unwrap_err();
        assert_eq!(err, TransportError::Cancelled);
    }

    #[tokio::test]
    async fn test_pump_times_out_on_stall() {
        let (mut reader, _writer) = duplex(1024);
        let mut out = Vec::new();
        let cancel = CancellationToken::new();

        let err = pump(
            &mut reader,
            &mut out,
            0,
            None,
            &|_| {},
            &cancel,
            Duration::from_millis(20),
        )
        .await
        .unwrap_err();
        assert_eq!(err.to_string(), "timeout");
    }
}
