/*!
 * Transport capability used by the dispatcher.
 *
 * The dispatcher only needs to send bytes and read reply lines. [`Transport`]
 * is the suspend-capable form of that capability; [`SyncTransport`] is the
 * blocking form, adapted to [`Transport`] by [`Blocking`].
 */
use std::fmt::Debug;
use std::io;

use async_trait::async_trait;
use bytes::Bytes;

/// Suspend-capable transport
#[async_trait]
pub trait Transport: Send + Debug {
    /// Send a command and return exactly one terminated reply line
    async fn write_readline(&mut self, data: &[u8]) -> io::Result<Bytes>;

    /// Send a command that produces no reply
    async fn write(&mut self, data: &[u8]) -> io::Result<()>;

    /// Read one further reply line
    async fn readline(&mut self) -> io::Result<Bytes>;

    /// Discard any input already received but not read
    async fn clear(&mut self) -> io::Result<()> {
        Ok(())
    }

    /// Short description used in logs
    fn describe(&self) -> String {
        "transport".to_string()
    }
}

#[async_trait]
impl<T: Transport + ?Sized> Transport for Box<T> {
    async fn write_readline(&mut self, data: &[u8]) -> io::Result<Bytes> {
        (**self).write_readline(data).await
    }

    async fn write(&mut self, data: &[u8]) -> io::Result<()> {
        (**self).write(data).await
    }

    async fn readline(&mut self) -> io::Result<Bytes> {
        (**self).readline().await
    }

    async fn clear(&mut self) -> io::Result<()> {
        (**self).clear().await
    }

    fn describe(&self) -> String {
        (**self).describe()
    }
}

/// Blocking transport
pub trait SyncTransport: Send + Debug {
    /// Send a command and return exactly one terminated reply line
    fn write_readline(&mut self, data: &[u8]) -> io::Result<Bytes>;

    /// Send a command that produces no reply
    fn write(&mut self, data: &[u8]) -> io::Result<()>;

    /// Read one further reply line
    fn readline(&mut self) -> io::Result<Bytes>;

    /// Discard any input already received but not read
    fn clear(&mut self) -> io::Result<()> {
        Ok(())
    }

    /// Short description used in logs
    fn describe(&self) -> String {
        "sync transport".to_string()
    }
}

/// Adapts a [`SyncTransport`] to [`Transport`]
///
/// Each call blocks the executor thread until the transport returns, so a
/// `Blocking` transport must only be driven from a runtime dedicated to it,
/// such as the one owned by [`crate::blocking::Device`].
#[derive(Debug)]
pub struct Blocking<T>(pub T);

impl<T> Blocking<T> {
    /// Wrap a blocking transport
    pub fn new(inner: T) -> Self {
        Self(inner)
    }

    /// Unwrap the blocking transport
    pub fn into_inner(self) -> T {
        self.0
    }
}

#[async_trait]
impl<T: SyncTransport> Transport for Blocking<T> {
    async fn write_readline(&mut self, data: &[u8]) -> io::Result<Bytes> {
        self.0.write_readline(data)
    }

    async fn write(&mut self, data: &[u8]) -> io::Result<()> {
        self.0.write(data)
    }

    async fn readline(&mut self) -> io::Result<Bytes> {
        self.0.readline()
    }

    async fn clear(&mut self) -> io::Result<()> {
        self.0.clear()
    }

    fn describe(&self) -> String {
        self.0.describe()
    }
}

/// Decode a reply line: lossy UTF-8, surrounding whitespace removed
pub fn handle_reply(line: &[u8]) -> String {
    String::from_utf8_lossy(line).trim().to_string()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::VecDeque;

    #[derive(Debug, Default)]
    struct Echo {
        pending: VecDeque<Bytes>,
        writes: usize,
    }

    impl SyncTransport for Echo {
        fn write_readline(&mut self, data: &[u8]) -> io::Result<Bytes> {
            self.writes += 1;
            Ok(Bytes::copy_from_slice(data))
        }

        fn write(&mut self, data: &[u8]) -> io::Result<()> {
            self.writes += 1;
            self.pending.push_back(Bytes::copy_from_slice(data));
            Ok(())
        }

        fn readline(&mut self) -> io::Result<Bytes> {
            self.pending
                .pop_front()
                .ok_or_else(|| io::Error::new(io::ErrorKind::UnexpectedEof, "nothing to read"))
        }
    }

    #[tokio::test]
    async fn test_blocking_adapter() {
        let mut transport: Box<dyn Transport> = Box::new(Blocking::new(Echo::default()));
        assert_eq!(&transport.write_readline(b"*IDN?\n").await.unwrap()[..], b"*IDN?\n");
        transport.write(b"late\n").await.unwrap();
        assert_eq!(&transport.readline().await.unwrap()[..], b"late\n");
        assert!(transport.readline().await.is_err());
        assert_eq!(transport.describe(), "sync transport");
    }

    #[test]
    fn test_handle_reply() {
        assert_eq!(handle_reply(b"  23.5\r\n"), "23.5");
        assert_eq!(handle_reply(b""), "");
    }
}
