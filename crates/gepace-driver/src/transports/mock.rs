/*!
 * Scripted transport for tests.
 *
 * A [`MockTransport`] is a cheap handle: clone it, hand one clone to the
 * dispatcher and keep the other to script replies and inspect the call log.
 */
use std::collections::VecDeque;
use std::io;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use tokio::time::{sleep, Instant};

use crate::protocol::Transport;

/// One recorded transport call
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MockCall {
    /// `write`
    Write {
        /// Bytes sent, lossily decoded
        data: String,
        /// When the call was made
        at: Instant,
    },
    /// `write_readline`
    WriteReadline {
        /// Bytes sent, lossily decoded
        data: String,
        /// When the call was made
        at: Instant,
    },
    /// `readline`
    Readline {
        /// When the call was made
        at: Instant,
    },
}

impl MockCall {
    /// Sent data, `None` for reads
    pub fn data(&self) -> Option<&str> {
        match self {
            MockCall::Write { data, .. } | MockCall::WriteReadline { data, .. } => Some(data),
            MockCall::Readline { .. } => None,
        }
    }

    /// Time of the call
    pub fn at(&self) -> Instant {
        match self {
            MockCall::Write { at, .. } | MockCall::WriteReadline { at, .. } | MockCall::Readline { at } => *at,
        }
    }

    /// Whether the call put bytes on the wire
    pub fn is_transmission(&self) -> bool {
        self.data().is_some()
    }
}

#[derive(Debug)]
enum Scripted {
    Line(Bytes),
    Fail(io::ErrorKind),
}

#[derive(Debug, Default)]
struct MockState {
    script: VecDeque<Scripted>,
    calls: Vec<MockCall>,
    latency: Option<Duration>,
}

/// Transport answering from a script of reply lines
#[derive(Debug, Clone, Default)]
pub struct MockTransport {
    state: Arc<Mutex<MockState>>,
}

impl MockTransport {
    /// Create a mock with an empty script
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, MockState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Append reply lines to the script
    pub fn with_replies<I, S>(self, replies: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        for reply in replies {
            self.push_reply(reply.as_ref());
        }
        self
    }

    /// Append a failure to the script
    pub fn with_error(self, kind: io::ErrorKind) -> Self {
        self.lock().script.push_back(Scripted::Fail(kind));
        self
    }

    /// Delay every read by `latency`
    pub fn with_latency(self, latency: Duration) -> Self {
        self.lock().latency = Some(latency);
        self
    }

    /// Append one reply line; a newline terminator is added
    pub fn push_reply(&self, reply: &str) {
        let line = Bytes::from(format!("{}\n", reply));
        self.lock().script.push_back(Scripted::Line(line));
    }

    /// Every call made so far
    pub fn calls(&self) -> Vec<MockCall> {
        self.lock().calls.clone()
    }

    /// Data of every transmission, in order
    pub fn writes(&self) -> Vec<String> {
        self.lock()
            .calls
            .iter()
            .filter_map(|c| c.data().map(str::to_string))
            .collect()
    }

    /// Number of transmissions
    pub fn transmissions(&self) -> usize {
        self.lock().calls.iter().filter(|c| c.is_transmission()).count()
    }

    /// Times of every transmission, in order
    pub fn transmission_times(&self) -> Vec<Instant> {
        self.lock()
            .calls
            .iter()
            .filter(|c| c.is_transmission())
            .map(MockCall::at)
            .collect()
    }

    /// Number of scripted entries not consumed yet
    pub fn remaining(&self) -> usize {
        self.lock().script.len()
    }

    fn record(&self, call: MockCall) -> Option<Duration> {
        let mut state = self.lock();
        state.calls.push(call);
        state.latency
    }

    fn next_line(&self) -> io::Result<Bytes> {
        match self.lock().script.pop_front() {
            Some(Scripted::Line(line)) => Ok(line),
            Some(Scripted::Fail(kind)) => Err(io::Error::new(kind, "scripted failure")),
            None => Err(io::Error::new(io::ErrorKind::UnexpectedEof, "mock script exhausted")),
        }
    }

    fn next_write(&self) -> io::Result<()> {
        let mut state = self.lock();
        if let Some(Scripted::Fail(kind)) = state.script.front() {
            let kind = *kind;
            state.script.pop_front();
            return Err(io::Error::new(kind, "scripted failure"));
        }
        Ok(())
    }
}

fn lossy(data: &[u8]) -> String {
    String::from_utf8_lossy(data).into_owned()
}

#[async_trait]
impl Transport for MockTransport {
    async fn write_readline(&mut self, data: &[u8]) -> io::Result<Bytes> {
        let latency = self.record(MockCall::WriteReadline {
            data: lossy(data),
            at: Instant::now(),
        });
        if let Some(latency) = latency {
            sleep(latency).await;
        }
        self.next_line()
    }

    async fn write(&mut self, data: &[u8]) -> io::Result<()> {
        self.record(MockCall::Write {
            data: lossy(data),
            at: Instant::now(),
        });
        self.next_write()
    }

    async fn readline(&mut self) -> io::Result<Bytes> {
        let latency = self.record(MockCall::Readline { at: Instant::now() });
        if let Some(latency) = latency {
            sleep(latency).await;
        }
        self.next_line()
    }

    fn describe(&self) -> String {
        "mock".to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_scripted_replies() {
        let handle = MockTransport::new().with_replies(["one", "two"]).with_error(io::ErrorKind::BrokenPipe);
        let mut transport = handle.clone();

        assert_eq!(&transport.write_readline(b"A?\n").await.unwrap()[..], b"one\n");
        assert_eq!(&transport.readline().await.unwrap()[..], b"two\n");
        assert_eq!(transport.write(b"X 1\n").await.unwrap_err().kind(), io::ErrorKind::BrokenPipe);
        assert_eq!(
            transport.readline().await.unwrap_err().kind(),
            io::ErrorKind::UnexpectedEof
        );

        assert_eq!(handle.writes(), vec!["A?\n".to_string(), "X 1\n".to_string()]);
        assert_eq!(handle.transmissions(), 2);
        assert_eq!(handle.calls().len(), 4);
        assert_eq!(handle.remaining(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_latency() {
        let handle = MockTransport::new()
            .with_replies(["slow"])
            .with_latency(Duration::from_millis(300));
        let mut transport = handle.clone();
        let start = Instant::now();
        transport.write_readline(b"*IDN?\n").await.unwrap();
        assert!(Instant::now() - start >= Duration::from_millis(300));
        assert_eq!(handle.transmission_times(), vec![start]);
    }
}
