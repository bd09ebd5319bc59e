/*!
 * Command dispatcher.
 *
 * The dispatcher owns the transport and is the only place where bytes reach
 * the instrument. Every physical transmission goes through the rate limiter,
 * and while a group is open commands are queued instead of sent, then flushed
 * as joined batches when the group ends.
 */
use std::future::Future;
use std::io;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use tokio::sync::Mutex as AsyncMutex;
use tokio::time::{timeout, Instant};
use tracing::{debug, error, info, warn, Instrument};

use gepace_core::config::DispatchConfig;
use gepace_core::logging::operation_span;
use gepace_core::types::Value;

use crate::codec::Command;
use crate::error::{DeviceError, Result};
use crate::group::{GroupReplies, GroupState, PendingCommand, Placeholder};
use crate::limiter::{RateLimiter, DEFAULT_MIN_INTERVAL};
use crate::protocol::{handle_reply, Transport};
use crate::registry::{Framing, ReplyFraming};

/// Dispatcher tuning
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DispatchOptions {
    /// Minimum spacing between two transmissions
    pub min_interval: Duration,
    /// Upper bound on one transport exchange (unbounded when unset)
    pub command_timeout: Option<Duration>,
}

impl Default for DispatchOptions {
    fn default() -> Self {
        Self {
            min_interval: DEFAULT_MIN_INTERVAL,
            command_timeout: None,
        }
    }
}

impl From<&DispatchConfig> for DispatchOptions {
    fn from(config: &DispatchConfig) -> Self {
        Self {
            min_interval: config.min_interval(),
            command_timeout: config.command_timeout(),
        }
    }
}

/// Outcome of [`Dispatcher::execute`]
#[derive(Debug, Clone)]
pub enum Dispatched {
    /// Transmitted immediately; the decoded reply, or `Null` for writes
    Sent(Value),
    /// Queued in the open group
    Queued(Placeholder),
}

/// Counters exposed for diagnostics
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DispatchStats {
    /// Number of physical transmissions
    pub transmissions: u64,
    /// Time of the last transmission
    pub last_sent: Option<Instant>,
}

#[derive(Debug)]
struct Link {
    transport: Box<dyn Transport>,
    limiter: RateLimiter,
    /// Reply lines requested from the instrument but never read
    owed: usize,
}

impl Link {
    fn settle<T>(&mut self, result: &io::Result<T>) {
        match result {
            Ok(_) => self.owed = self.owed.saturating_sub(1),
            // the reply may still arrive and must be skipped later
            Err(e) if e.kind() == io::ErrorKind::TimedOut => {}
            Err(_) => self.owed = 0,
        }
    }
}

#[derive(Debug)]
struct BatchFailure {
    received: usize,
    reason: String,
}

/// Serializes commands onto one transport
#[derive(Debug)]
pub struct Dispatcher {
    link: AsyncMutex<Link>,
    group: Mutex<Option<GroupState>>,
    next_group: AtomicU64,
    framing: Framing,
    command_timeout: Option<Duration>,
}

impl Dispatcher {
    /// Create a dispatcher owning `transport`
    pub fn new<T>(transport: T, framing: Framing, options: DispatchOptions) -> Self
    where
        T: Transport + 'static,
    {
        Self::from_boxed(Box::new(transport), framing, options)
    }

    /// Create a dispatcher from an already boxed transport
    pub fn from_boxed(transport: Box<dyn Transport>, framing: Framing, options: DispatchOptions) -> Self {
        info!(
            "Dispatcher on {} (min interval {:?}, command timeout {:?})",
            transport.describe(),
            options.min_interval,
            options.command_timeout
        );
        Self {
            link: AsyncMutex::new(Link {
                transport,
                limiter: RateLimiter::new(options.min_interval),
                owed: 0,
            }),
            group: Mutex::new(None),
            next_group: AtomicU64::new(1),
            framing,
            command_timeout: options.command_timeout,
        }
    }

    /// Wire framing in use
    pub fn framing(&self) -> &Framing {
        &self.framing
    }

    fn lock_group(&self) -> MutexGuard<'_, Option<GroupState>> {
        self.group.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Whether a group is currently open
    pub fn is_grouping(&self) -> bool {
        self.lock_group().is_some()
    }

    /// Send one command, or queue it if a group is open
    pub async fn execute(&self, command: Command) -> Result<Dispatched> {
        let command = {
            let mut group = self.lock_group();
            match group.as_mut() {
                Some(state) => {
                    debug!("Queued {:?} in group {}", command.text, state.id);
                    return Ok(Dispatched::Queued(state.enqueue(command)));
                }
                None => command,
            }
        };

        let mut link = self.link.lock().await;
        self.drain(&mut link)
            .await
            .map_err(|e| transport_failure(&command.text, e))?;
        link.limiter.acquire_slot().await;
        let wire = self.frame(&command.text);
        debug!("REQ {}", command.text);

        if !command.expects_reply {
            self.timed(link.transport.write(&wire))
                .await
                .map_err(|e| transport_failure(&command.text, e))?;
            return Ok(Dispatched::Sent(Value::Null));
        }

        link.owed += 1;
        let raw = self.timed(link.transport.write_readline(&wire)).await;
        link.settle(&raw);
        let raw = raw.map_err(|e| transport_failure(&command.text, e))?;
        drop(link);

        let reply = handle_reply(&raw);
        debug!("REP {}", reply);
        command.decoder.decode(&command.text, &reply).map(Dispatched::Sent)
    }

    /// Discard pending input and forget replies still owed by the instrument
    ///
    /// After a command timeout the late reply is skipped automatically before
    /// the next transmission. When it never arrives, every later command fails
    /// until the link is resynchronized with this call.
    pub async fn resync(&self) -> Result<()> {
        let mut link = self.link.lock().await;
        if link.owed > 0 {
            info!("Resynchronizing, {} reply line(s) abandoned", link.owed);
        }
        link.owed = 0;
        link.transport
            .clear()
            .await
            .map_err(|e| transport_failure("resync", e))
    }

    /// Read and discard reply lines left over from timed out or cancelled
    /// exchanges
    async fn drain(&self, link: &mut Link) -> io::Result<()> {
        while link.owed > 0 {
            let stale = self.timed(link.transport.readline()).await;
            link.settle(&stale);
            match stale {
                Ok(line) => warn!("Discarded stale reply {:?}", handle_reply(&line)),
                Err(e) => {
                    return Err(io::Error::new(
                        e.kind(),
                        format!("link out of sync, {} stale reply line(s) pending: {}", link.owed, e),
                    ))
                }
            }
        }
        Ok(())
    }

    /// Open a group
    ///
    /// Fails with [`DeviceError::GroupAlreadyActive`] if one is open already;
    /// groups do not nest.
    pub fn begin_group(&self) -> Result<Group<'_>> {
        let mut group = self.lock_group();
        if group.is_some() {
            return Err(DeviceError::GroupAlreadyActive);
        }
        let id = self.next_group.fetch_add(1, Ordering::Relaxed);
        *group = Some(GroupState::new(id));
        debug!("Group {} opened", id);
        Ok(Group {
            dispatcher: self,
            id,
            finished: false,
        })
    }

    fn take_group(&self, id: u64) -> Option<GroupState> {
        let mut group = self.lock_group();
        match group.as_ref() {
            Some(state) if state.id == id => group.take(),
            _ => None,
        }
    }

    fn abort_group(&self, id: u64) {
        if let Some(state) = self.take_group(id) {
            debug!("Group {} aborted with {} queued commands", id, state.pending.len());
            state.fail();
        }
    }

    async fn flush(&self, state: GroupState) -> Result<GroupReplies> {
        let expected = state.expected_replies();
        if state.pending.is_empty() {
            debug!("Group {} ended empty", state.id);
            return Ok(GroupReplies::default());
        }
        let batches = state.batches(&self.framing.join, self.framing.max_batch_len);
        debug!(
            "Group {} flushing {} commands in {} transmission(s)",
            state.id,
            state.pending.len(),
            batches.len()
        );

        let mut raw: Vec<Option<String>> = Vec::with_capacity(state.pending.len());
        {
            let mut link = self.link.lock().await;
            for range in batches {
                match self.exchange(&mut link, &state.pending[range]).await {
                    Ok(replies) => raw.extend(replies),
                    Err(failure) => {
                        let received = raw.iter().flatten().count() + failure.received;
                        warn!(
                            "Group {} failed after {} of {} replies: {}",
                            state.id, received, expected, failure.reason
                        );
                        state.fail();
                        return Err(DeviceError::GroupReplyMismatch {
                            expected,
                            received,
                            reason: failure.reason,
                        });
                    }
                }
            }
        }

        let decoded: Result<Vec<Value>> = state
            .pending
            .iter()
            .zip(&raw)
            .map(|(pending, reply)| match reply {
                Some(line) => pending.command.decoder.decode(&pending.command.text, line),
                None => Ok(Value::Null),
            })
            .collect();

        match decoded {
            Ok(values) => {
                debug!("Group {} resolved", state.id);
                state.resolve(&values);
                Ok(GroupReplies::new(values))
            }
            Err(e) => {
                warn!("Group {} failed: {}", state.id, e);
                state.fail();
                Err(e)
            }
        }
    }

    /// One joined transmission; replies are returned per command
    async fn exchange(
        &self,
        link: &mut Link,
        chunk: &[PendingCommand],
    ) -> std::result::Result<Vec<Option<String>>, BatchFailure> {
        let text = chunk
            .iter()
            .map(|p| p.command.text.as_str())
            .collect::<Vec<_>>()
            .join(&self.framing.join);
        let expected = chunk.iter().filter(|p| p.command.expects_reply).count();
        let wire = self.frame(&text);
        let failed = |received: usize, e: io::Error| BatchFailure {
            received,
            reason: e.to_string(),
        };

        self.drain(link).await.map_err(|e| failed(0, e))?;
        link.limiter.acquire_slot().await;
        debug!("REQ {}", text);

        let lines = if expected == 0 {
            self.timed(link.transport.write(&wire)).await.map_err(|e| failed(0, e))?;
            Vec::new()
        } else {
            link.owed += match self.framing.reply {
                ReplyFraming::Lines => expected,
                ReplyFraming::Joined => 1,
            };
            let first = self.timed(link.transport.write_readline(&wire)).await;
            link.settle(&first);
            let first = handle_reply(&first.map_err(|e| failed(0, e))?);
            debug!("REP {}", first);

            match self.framing.reply {
                ReplyFraming::Lines => {
                    let mut lines = Vec::with_capacity(expected);
                    lines.push(first);
                    while lines.len() < expected {
                        let next = self.timed(link.transport.readline()).await;
                        link.settle(&next);
                        let next = handle_reply(&next.map_err(|e| failed(lines.len(), e))?);
                        debug!("REP {}", next);
                        lines.push(next);
                    }
                    lines
                }
                ReplyFraming::Joined => {
                    let parts = split_joined(&first, &self.framing.reply_separator, expected);
                    if parts.len() != expected {
                        return Err(BatchFailure {
                            received: parts.len(),
                            reason: format!("reply {:?} holds {} of {} values", first, parts.len(), expected),
                        });
                    }
                    parts
                }
            }
        };

        let mut lines = lines.into_iter();
        Ok(chunk
            .iter()
            .map(|p| if p.command.expects_reply { lines.next() } else { None })
            .collect())
    }

    async fn timed<F, T>(&self, exchange: F) -> io::Result<T>
    where
        F: Future<Output = io::Result<T>>,
    {
        match self.command_timeout {
            Some(limit) => match timeout(limit, exchange).await {
                Ok(result) => result,
                Err(_) => Err(io::Error::new(
                    io::ErrorKind::TimedOut,
                    format!("no reply within {:?}", limit),
                )),
            },
            None => exchange.await,
        }
    }

    fn frame(&self, text: &str) -> Vec<u8> {
        let mut wire = Vec::with_capacity(text.len() + self.framing.terminator.len());
        wire.extend_from_slice(text.as_bytes());
        wire.extend_from_slice(self.framing.terminator.as_bytes());
        wire
    }

    /// Transmission counters
    pub async fn stats(&self) -> DispatchStats {
        let link = self.link.lock().await;
        DispatchStats {
            transmissions: link.limiter.acquired(),
            last_sent: link.limiter.last_sent(),
        }
    }
}

fn transport_failure(command: &str, e: io::Error) -> DeviceError {
    error!("Transport failure on {:?}: {}", command, e);
    DeviceError::transport(command, e)
}

/// An empty line carries no values, unless exactly one was asked for and
/// that value is the empty string
fn split_joined(line: &str, separator: &str, expected: usize) -> Vec<String> {
    if line.is_empty() && expected != 1 {
        return Vec::new();
    }
    line.split(separator).map(|part| part.trim().to_string()).collect()
}

/// An open group
///
/// Commands issued through the dispatcher while this guard lives are queued.
/// [`Group::end`] transmits them; dropping the guard without ending it
/// abandons the queue and leaves every placeholder unresolved.
#[derive(Debug)]
#[must_use = "a group queues commands until it is ended"]
pub struct Group<'d> {
    dispatcher: &'d Dispatcher,
    id: u64,
    finished: bool,
}

impl<'d> Group<'d> {
    /// Group identifier, unique per dispatcher
    pub fn id(&self) -> u64 {
        self.id
    }

    /// Number of commands queued so far
    pub fn len(&self) -> usize {
        self.dispatcher
            .lock_group()
            .as_ref()
            .filter(|state| state.id == self.id)
            .map_or(0, |state| state.pending.len())
    }

    /// Whether nothing was queued yet
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Close the group, transmit the queue and resolve every placeholder
    ///
    /// Either every placeholder resolves or none does.
    pub async fn end(mut self) -> Result<GroupReplies> {
        let state = self.dispatcher.take_group(self.id);
        self.finished = true;
        match state {
            Some(state) => {
                let span = operation_span(&format!("group {}", self.id), "dispatcher");
                self.dispatcher.flush(state).instrument(span).await
            }
            None => Ok(GroupReplies::default()),
        }
    }

    /// Close the group without transmitting anything
    pub fn abort(mut self) {
        self.finished = true;
        self.dispatcher.abort_group(self.id);
    }
}

impl Drop for Group<'_> {
    fn drop(&mut self) {
        if !self.finished {
            warn!("Group {} dropped without being ended, queued commands discarded", self.id);
            self.dispatcher.abort_group(self.id);
        }
    }
}
