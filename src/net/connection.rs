// TCP connection handler
// Line-delimited JSON framing for a single voice client

use std::io;
use std::net::SocketAddr;

use serde::Serialize;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader, BufWriter, Lines};
use tokio::net::TcpStream;

use crate::routing::UserId;

/// Longest line accepted from a client. A voice frame of a few thousand
/// samples fits comfortably.
pub const MAX_LINE_BYTES: usize = 256 * 1024;

/// Represents a single TCP connection to a client
pub struct Connection {
    lines: Lines<BufReader<tokio::io::ReadHalf<TcpStream>>>,
    writer: BufWriter<tokio::io::WriteHalf<TcpStream>>,
    peer_addr: SocketAddr,
    user_id: Option<UserId>,
}

impl Connection {
    /// Create a new connection from a TCP stream
    pub fn new(stream: TcpStream, peer_addr: SocketAddr) -> Self {
        let (read_half, write_half) = tokio::io::split(stream);

        Connection {
            lines: BufReader::new(read_half).lines(),
            writer: BufWriter::new(write_half),
            peer_addr,
            user_id: None,
        }
    }

    pub fn peer_addr(&self) -> SocketAddr {
        self.peer_addr
    }

    /// Session id once the handshake succeeded
    pub fn user_id(&self) -> Option<UserId> {
        self.user_id
    }

    pub fn set_user_id(&mut self, id: UserId) {
        self.user_id = Some(id);
    }

    /// Read one line, without its terminator. EOF is reported as
    /// `UnexpectedEof` so callers can treat it like any other disconnect.
    ///
    /// Cancel safe: a line interrupted by another `select!` branch is
    /// picked up again by the next call.
    pub async fn read_line(&mut self) -> io::Result<String> {
        let line = match self.lines.next_line().await? {
            Some(l) => l,
            None => return Err(io::Error::new(io::ErrorKind::UnexpectedEof, "connection closed")),
        };
        if line.len() > MAX_LINE_BYTES {
            return Err(io::Error::new(io::ErrorKind::InvalidData, "line too long"));
        }
        Ok(line)
    }

    /// Write any serializable message as one JSON line
    pub async fn write_json<T: Serialize>(&mut self, value: &T) -> io::Result<()> {
        let json_str = serde_json::to_string(value)?;
        self.writer.write_all(json_str.as_bytes()).await?;
        self.writer.write_all(b"\n").await?;
        self.writer.flush().await?;
        Ok(())
    }
}
