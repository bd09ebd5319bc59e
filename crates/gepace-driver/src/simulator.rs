/*!
 * In-memory instrument simulator.
 *
 * The simulator understands every command header of an address registry: it
 * stores written values, answers queries with the stored value and replies
 * `NACK` to anything else. Batches are split on the model's join token and
 * answered with the model's reply framing.
 */
use std::collections::{HashMap, VecDeque};
use std::io;

use async_trait::async_trait;
use bytes::Bytes;
use tracing::debug;

use crate::codec::NACK;
use crate::protocol::{SyncTransport, Transport};
use crate::registry::{Access, AddressRegistry, Codec, Framing, ReplyFraming};

/// Identity reported by default
pub const DEFAULT_IDENTITY: &str = "GE Druck,PACE5000,10388796,DK0367  v02.02.14";

/// Error queue content when nothing went wrong
pub const NO_ERROR: &str = "0, No error";

const UNDEFINED_HEADER: &str = "-113, Undefined header";

#[derive(Debug)]
struct Register {
    value: String,
    access: Access,
}

/// Echoing simulator of a PACE controller
#[derive(Debug)]
pub struct Simulator {
    framing: Framing,
    error_query: String,
    echo_header: bool,
    registers: HashMap<String, Register>,
    error: String,
    outbox: VecDeque<Bytes>,
}

impl Simulator {
    /// Create a simulator answering every header of `registry`
    pub fn new(registry: &AddressRegistry) -> Self {
        let model = registry.model();
        let registers = registry
            .headers()
            .into_iter()
            .map(|(header, desc)| {
                let value = match (header.as_str(), desc.codec) {
                    ("*IDN", _) => DEFAULT_IDENTITY.to_string(),
                    (_, Codec::Text) | (_, Codec::Bool) | (_, Codec::Integer) => "0".to_string(),
                    (_, Codec::Float) => "0.0".to_string(),
                    (_, Codec::Quoted) => "\"\"".to_string(),
                    (_, Codec::Token) => desc.tokens.first().cloned().unwrap_or_default(),
                    (_, Codec::ErrorStatus) => NO_ERROR.to_string(),
                    (_, Codec::FloatBool) => "0.0,0".to_string(),
                    (_, Codec::TokenFloat) => {
                        format!("{},0.0", desc.tokens.first().map(String::as_str).unwrap_or_default())
                    }
                };
                let register = Register {
                    value,
                    access: desc.access,
                };
                (header, register)
            })
            .collect();

        Self {
            framing: model.framing.clone(),
            error_query: model.error_query.clone(),
            echo_header: false,
            registers,
            error: NO_ERROR.to_string(),
            outbox: VecDeque::new(),
        }
    }

    /// Prefix every answer with the command header, as the instrument does
    pub fn with_echo_header(mut self, echo: bool) -> Self {
        self.echo_header = echo;
        self
    }

    /// Preset the value answered for `header`
    pub fn with_value(mut self, header: &str, value: &str) -> Self {
        match self.registers.get_mut(header) {
            Some(register) => register.value = value.to_string(),
            None => {
                self.registers.insert(
                    header.to_string(),
                    Register {
                        value: value.to_string(),
                        access: Access::ReadWrite,
                    },
                );
            }
        }
        self
    }

    /// Currently stored wire value of `header`
    pub fn value(&self, header: &str) -> Option<&str> {
        self.registers.get(header).map(|r| r.value.as_str())
    }

    fn answer(&self, header: &str, value: &str) -> String {
        if !self.echo_header {
            return value.to_string();
        }
        if header.starts_with(':') || header.starts_with('*') {
            format!("{} {}", header, value)
        } else {
            format!(":{} {}", header, value)
        }
    }

    fn handle_request(&mut self, request: &str) -> Option<String> {
        if let Some(header) = request.strip_suffix('?') {
            if header == self.error_query {
                let error = std::mem::replace(&mut self.error, NO_ERROR.to_string());
                return Some(self.answer(header, &error));
            }
            let reply = match self.registers.get(header) {
                Some(register) if register.access.is_readable() => self.answer(header, &register.value),
                _ => {
                    self.error = UNDEFINED_HEADER.to_string();
                    NACK.to_string()
                }
            };
            return Some(reply);
        }

        let (header, value) = request.split_once(' ').unwrap_or((request, ""));
        match self.registers.get_mut(header) {
            Some(register) if register.access.is_writable() && !value.is_empty() => {
                register.value = value.trim().to_string();
                None
            }
            _ => {
                self.error = UNDEFINED_HEADER.to_string();
                Some(NACK.to_string())
            }
        }
    }

    fn handle_message(&mut self, data: &[u8]) {
        let text = String::from_utf8_lossy(data);
        let line = text.trim_end_matches(['\r', '\n']);
        debug!("Simulator request {:?}", line);

        let join = self.framing.join.clone();
        let replies: Vec<String> = line
            .split(join.as_str())
            .map(str::trim)
            .filter(|r| !r.is_empty())
            .filter_map(|r| self.handle_request(r))
            .collect();
        if replies.is_empty() {
            return;
        }

        let terminator = &self.framing.terminator;
        match self.framing.reply {
            ReplyFraming::Lines => {
                for reply in replies {
                    self.outbox.push_back(Bytes::from(format!("{}{}", reply, terminator)));
                }
            }
            ReplyFraming::Joined => {
                let reply = replies.join(&self.framing.reply_separator);
                debug!("Simulator reply {:?}", reply);
                self.outbox.push_back(Bytes::from(format!("{}{}", reply, terminator)));
            }
        }
    }

    fn next_reply(&mut self) -> io::Result<Bytes> {
        self.outbox
            .pop_front()
            .ok_or_else(|| io::Error::new(io::ErrorKind::TimedOut, "simulator has nothing to answer"))
    }
}

impl SyncTransport for Simulator {
    fn write_readline(&mut self, data: &[u8]) -> io::Result<Bytes> {
        self.handle_message(data);
        self.next_reply()
    }

    fn write(&mut self, data: &[u8]) -> io::Result<()> {
        self.handle_message(data);
        Ok(())
    }

    fn readline(&mut self) -> io::Result<Bytes> {
        self.next_reply()
    }

    fn clear(&mut self) -> io::Result<()> {
        self.outbox.clear();
        Ok(())
    }

    fn describe(&self) -> String {
        "simulator".to_string()
    }
}

#[async_trait]
impl Transport for Simulator {
    async fn write_readline(&mut self, data: &[u8]) -> io::Result<Bytes> {
        SyncTransport::write_readline(self, data)
    }

    async fn write(&mut self, data: &[u8]) -> io::Result<()> {
        SyncTransport::write(self, data)
    }

    async fn readline(&mut self) -> io::Result<Bytes> {
        SyncTransport::readline(self)
    }

    async fn clear(&mut self) -> io::Result<()> {
        SyncTransport::clear(self)
    }

    fn describe(&self) -> String {
        SyncTransport::describe(self)
    }
}
