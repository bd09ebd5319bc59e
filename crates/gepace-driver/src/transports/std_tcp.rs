/*!
 * Blocking TCP transport on `std::net`.
 */
use std::io::{self, BufRead, BufReader, Read, Write};
use std::net::{TcpStream, ToSocketAddrs};
use std::time::Duration;

use bytes::Bytes;
use tracing::{debug, info};

use crate::protocol::SyncTransport;

/// Line oriented blocking transport over a TCP socket
#[derive(Debug)]
pub struct StdTcpTransport {
    peer: String,
    reader: BufReader<TcpStream>,
    writer: TcpStream,
}

impl StdTcpTransport {
    /// Connect to `host:port`, trying each resolved address in turn
    pub fn connect(
        host: &str,
        port: u16,
        connect_timeout: Duration,
        read_timeout: Option<Duration>,
    ) -> io::Result<Self> {
        debug!("Connecting to {}:{}", host, port);
        let mut last_err = None;
        for addr in (host, port).to_socket_addrs()? {
            match TcpStream::connect_timeout(&addr, connect_timeout) {
                Ok(stream) => {
                    info!("Connected to {}", addr);
                    return Self::from_stream(stream, read_timeout);
                }
                Err(e) => last_err = Some(e),
            }
        }
        Err(last_err.unwrap_or_else(|| {
            io::Error::new(io::ErrorKind::NotFound, format!("{} did not resolve", host))
        }))
    }

    /// Wrap an already connected stream
    pub fn from_stream(stream: TcpStream, read_timeout: Option<Duration>) -> io::Result<Self> {
        stream.set_read_timeout(read_timeout)?;
        stream.set_nodelay(true)?;
        let peer = stream.peer_addr()?.to_string();
        let writer = stream.try_clone()?;
        Ok(Self {
            peer,
            reader: BufReader::new(stream),
            writer,
        })
    }

    fn receive(&mut self) -> io::Result<Bytes> {
        let mut line = Vec::new();
        let n = self.reader.read_until(b'\n', &mut line).map_err(|e| match e.kind() {
            // read timeouts surface as WouldBlock on unix
            io::ErrorKind::WouldBlock => io::Error::new(io::ErrorKind::TimedOut, e),
            _ => e,
        })?;
        if n == 0 {
            return Err(io::Error::new(
                io::ErrorKind::UnexpectedEof,
                format!("{} closed the connection", self.peer),
            ));
        }
        Ok(Bytes::from(line))
    }
}

impl SyncTransport for StdTcpTransport {
    fn write_readline(&mut self, data: &[u8]) -> io::Result<Bytes> {
        self.write(data)?;
        self.receive()
    }

    fn write(&mut self, data: &[u8]) -> io::Result<()> {
        self.writer.write_all(data)?;
        self.writer.flush()
    }

    fn readline(&mut self) -> io::Result<Bytes> {
        self.receive()
    }

    fn clear(&mut self) -> io::Result<()> {
        let buffered = self.reader.buffer().len();
        self.reader.consume(buffered);
        let mut discarded = buffered;
        let mut scratch = [0u8; 512];
        self.reader.get_ref().set_nonblocking(true)?;
        let drained = loop {
            match self.reader.get_mut().read(&mut scratch) {
                Ok(0) => break Ok(()),
                Ok(n) => discarded += n,
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => break Ok(()),
                Err(e) => break Err(e),
            }
        };
        self.reader.get_ref().set_nonblocking(false)?;
        debug!("Discarded {} unread bytes from {}", discarded, self.peer);
        drained
    }

    fn describe(&self) -> String {
        format!("tcp://{} (blocking)", self.peer)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::TcpListener;
    use std::thread;

    #[test]
    fn test_blocking_round_trip() {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let port = listener.local_addr().unwrap().port();
        let server = thread::spawn(move || {
            let (stream, _) = listener.accept().unwrap();
            let mut writer = stream.try_clone().unwrap();
            let mut reader = BufReader::new(stream);
            let mut line = String::new();
            reader.read_line(&mut line).unwrap();
            writer.write_all(b"GE Druck,PACE5000\r\n").unwrap();
        });

        let mut transport =
            StdTcpTransport::connect("127.0.0.1", port, Duration::from_secs(1), Some(Duration::from_secs(1))).unwrap();
        let reply = transport.write_readline(b"*IDN?\n").unwrap();
        assert_eq!(&reply[..], b"GE Druck,PACE5000\r\n");
        server.join().unwrap();

        let err = transport.readline().unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::UnexpectedEof);
    }
}
