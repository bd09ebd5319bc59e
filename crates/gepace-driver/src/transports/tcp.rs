/*!
 * Tokio TCP transport.
 */
use std::io;
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::TcpStream;
use tokio::time::timeout;
use tracing::{debug, info};

use crate::protocol::Transport;

/// Line oriented transport over a TCP socket
#[derive(Debug)]
pub struct TcpTransport {
    peer: String,
    reader: BufReader<OwnedReadHalf>,
    writer: OwnedWriteHalf,
    read_timeout: Option<Duration>,
}

impl TcpTransport {
    /// Connect to `host:port`
    ///
    /// `read_timeout` bounds every line read; `None` waits indefinitely.
    pub async fn connect(
        host: &str,
        port: u16,
        connect_timeout: Duration,
        read_timeout: Option<Duration>,
    ) -> io::Result<Self> {
        debug!("Connecting to {}:{}", host, port);
        let stream = match timeout(connect_timeout, TcpStream::connect((host, port))).await {
            Ok(stream) => stream?,
            Err(_) => {
                return Err(io::Error::new(
                    io::ErrorKind::TimedOut,
                    format!("connection to {}:{} timed out after {:?}", host, port, connect_timeout),
                ))
            }
        };
        stream.set_nodelay(true)?;
        info!("Connected to {}:{}", host, port);
        Ok(Self::from_stream(stream, read_timeout))
    }

    /// Wrap an already connected stream
    pub fn from_stream(stream: TcpStream, read_timeout: Option<Duration>) -> Self {
        let peer = stream
            .peer_addr()
            .map(|addr| addr.to_string())
            .unwrap_or_else(|_| "unknown peer".to_string());
        let (reader, writer) = stream.into_split();
        Self {
            peer,
            reader: BufReader::new(reader),
            writer,
            read_timeout,
        }
    }

    async fn send(&mut self, data: &[u8]) -> io::Result<()> {
        self.writer.write_all(data).await?;
        self.writer.flush().await
    }

    async fn receive(&mut self) -> io::Result<Bytes> {
        let mut line = Vec::new();
        let read = self.reader.read_until(b'\n', &mut line);
        let n = match self.read_timeout {
            Some(limit) => timeout(limit, read).await.map_err(|_| {
                io::Error::new(
                    io::ErrorKind::TimedOut,
                    format!("no reply from {} within {:?}", self.peer, limit),
                )
            })??,
            None => read.await?,
        };
        if n == 0 {
            return Err(io::Error::new(
                io::ErrorKind::UnexpectedEof,
                format!("{} closed the connection", self.peer),
            ));
        }
        Ok(Bytes::from(line))
    }
}

#[async_trait]
impl Transport for TcpTransport {
    async fn write_readline(&mut self, data: &[u8]) -> io::Result<Bytes> {
        self.send(data).await?;
        self.receive().await
    }

    async fn write(&mut self, data: &[u8]) -> io::Result<()> {
        self.send(data).await
    }

    async fn readline(&mut self) -> io::Result<Bytes> {
        self.receive().await
    }

    async fn clear(&mut self) -> io::Result<()> {
        let buffered = self.reader.buffer().len();
        self.reader.consume(buffered);
        let mut discarded = buffered;
        let mut scratch = [0u8; 512];
        loop {
            match self.reader.get_ref().try_read(&mut scratch) {
                Ok(0) => break,
                Ok(n) => discarded += n,
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => break,
                Err(e) => return Err(e),
            }
        }
        debug!("Discarded {} unread bytes from {}", discarded, self.peer);
        Ok(())
    }

    fn describe(&self) -> String {
        format!("tcp://{}", self.peer)
    }
}
