/*!
 * Command encoder and reply decoder.
 *
 * Pure functions turning a property access into the command text sent to the
 * instrument, and a raw reply line back into a [`Value`].
 */
use gepace_core::types::Value;

use crate::error::{DeviceError, Result};
use crate::registry::{AddressRegistry, Codec, EntityKind, PropertyDescriptor};

/// Reply sent by the instrument for commands it does not understand
pub const NACK: &str = "NACK";

/// Addressed entity: the device itself, a channel letter or a loop number
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Target {
    /// Entity kind
    pub kind: EntityKind,
    /// Identifier substituted in templates (`None` for the device)
    pub id: Option<String>,
}

impl Target {
    /// The device itself
    pub fn device() -> Self {
        Self { kind: EntityKind::Device, id: None }
    }

    /// A channel
    pub fn channel(letter: char) -> Self {
        Self {
            kind: EntityKind::Channel,
            id: Some(letter.to_string()),
        }
    }

    /// A control loop
    pub fn control_loop(number: u32) -> Self {
        Self {
            kind: EntityKind::Loop,
            id: Some(number.to_string()),
        }
    }
}

/// Converts a reply line into a value of a declared shape
#[derive(Debug, Clone, PartialEq)]
pub struct Decoder {
    codec: Codec,
    tokens: Vec<String>,
    strip_header: bool,
}

impl Decoder {
    /// Decoder for a property descriptor
    pub fn for_descriptor(desc: &PropertyDescriptor, strip_header: bool) -> Self {
        Self {
            codec: desc.codec,
            tokens: desc.tokens.clone(),
            strip_header,
        }
    }

    /// Plain text decoder
    pub fn text(strip_header: bool) -> Self {
        Self {
            codec: Codec::Text,
            tokens: Vec::new(),
            strip_header,
        }
    }

    /// Error queue decoder
    pub fn error_status(strip_header: bool) -> Self {
        Self {
            codec: Codec::ErrorStatus,
            tokens: Vec::new(),
            strip_header,
        }
    }

    /// The value shape
    pub fn codec(&self) -> Codec {
        self.codec
    }

    /// Decode one raw reply line produced by `command`
    pub fn decode(&self, command: &str, raw: &str) -> Result<Value> {
        let line = raw.trim();
        if line == NACK {
            return Err(DeviceError::malformed(command, raw, "command rejected"));
        }
        let text = if self.strip_header { strip_header(line) } else { line };

        let malformed = |reason: String| DeviceError::malformed(command, raw, reason);

        match self.codec {
            Codec::Text => Ok(Value::String(text.to_string())),
            Codec::Quoted => Ok(Value::String(text.trim_matches('"').to_string())),
            Codec::Bool => parse_bool(text).map(Value::Bool).map_err(malformed),
            Codec::Integer => text
                .parse::<i64>()
                .map(Value::Integer)
                .map_err(|e| malformed(e.to_string())),
            Codec::Float => parse_float(text).map(Value::Float).map_err(malformed),
            Codec::Token => self.token(text).map(Value::String).map_err(malformed),
            Codec::FloatBool => {
                let (number, flag) = split_pair(text).map_err(malformed)?;
                Ok(Value::Array(vec![
                    Value::Float(parse_float(number).map_err(malformed)?),
                    Value::Bool(parse_bool(flag).map_err(malformed)?),
                ]))
            }
            Codec::TokenFloat => {
                let (token, number) = split_pair(text).map_err(malformed)?;
                Ok(Value::Array(vec![
                    Value::String(self.token(token).map_err(malformed)?),
                    Value::Float(parse_float(number).map_err(malformed)?),
                ]))
            }
            Codec::ErrorStatus => {
                let (code, message) = text
                    .split_once(',')
                    .ok_or_else(|| DeviceError::malformed(command, raw, "expected <code>, <message>"))?;
                let code = code
                    .trim()
                    .parse::<i64>()
                    .map_err(|e| DeviceError::malformed(command, raw, e.to_string()))?;
                let message = message.trim().trim_matches('"').to_string();
                Ok(Value::Array(vec![Value::Integer(code), Value::String(message)]))
            }
        }
    }
}

impl Decoder {
    fn token(&self, text: &str) -> std::result::Result<String, String> {
        if self.tokens.iter().any(|t| t == text) {
            Ok(text.to_string())
        } else {
            Err(format!("expected one of {:?}", self.tokens))
        }
    }
}

fn parse_bool(text: &str) -> std::result::Result<bool, String> {
    match text {
        "0" => Ok(false),
        "1" => Ok(true),
        _ => Err("expected 0 or 1".to_string()),
    }
}

fn parse_float(text: &str) -> std::result::Result<f64, String> {
    match text.parse::<f64>() {
        Ok(v) if v.is_finite() => Ok(v),
        Ok(v) => Err(format!("{} is not a finite number", v)),
        Err(e) => Err(e.to_string()),
    }
}

/// `<first>,<second>`, both halves trimmed
fn split_pair(text: &str) -> std::result::Result<(&str, &str), String> {
    text.split_once(',')
        .map(|(a, b)| (a.trim(), b.trim()))
        .ok_or_else(|| "expected two comma separated values".to_string())
}

/// Remove an echoed command header (`:SENS:PRES 1.0` → `1.0`)
pub fn strip_header(line: &str) -> &str {
    match line.split_once(' ') {
        Some((head, rest)) if head.starts_with(':') || head.starts_with('*') => rest.trim_start(),
        _ => line,
    }
}

/// Encode a value according to a property's codec
pub fn encode_value(desc: &PropertyDescriptor, header: &str, value: &Value) -> Result<String> {
    let invalid = |reason: String| DeviceError::InvalidValue {
        property: header.to_string(),
        reason,
    };

    match desc.codec {
        Codec::Text => match value {
            Value::Null | Value::Array(_) => Err(invalid(format!("cannot send {}", value.type_name()))),
            other => Ok(other.to_string()),
        },
        Codec::Quoted => value
            .as_str()
            .map(|s| format!("\"{}\"", s))
            .ok_or_else(|| invalid(format!("expected string, got {}", value.type_name()))),
        Codec::Bool => value
            .as_bool()
            .map(|b| if b { "1" } else { "0" }.to_string())
            .ok_or_else(|| invalid(format!("expected bool, got {}", value.type_name()))),
        Codec::Integer => value
            .as_integer()
            .map(|i| i.to_string())
            .ok_or_else(|| invalid(format!("expected integer, got {}", value.type_name()))),
        Codec::Float => value
            .as_float()
            .map(|f| f.to_string())
            .ok_or_else(|| invalid(format!("expected number, got {}", value.type_name()))),
        Codec::Token => match value.as_str() {
            Some(token) if desc.tokens.iter().any(|t| t == token) => Ok(token.to_string()),
            _ => Err(invalid(format!("expected one of {:?}, got {}", desc.tokens, value))),
        },
        Codec::FloatBool => match value {
            Value::Array(items) => match items.as_slice() {
                [number, Value::Bool(flag)] => number
                    .as_float()
                    .map(|f| format!("{},{}", f, u8::from(*flag)))
                    .ok_or_else(|| invalid(format!("expected number, got {}", number.type_name()))),
                _ => Err(invalid(format!("expected [number, bool], got {}", value))),
            },
            other => Err(invalid(format!("expected [number, bool], got {}", other.type_name()))),
        },
        Codec::TokenFloat => match value {
            Value::Array(items) => match items.as_slice() {
                [Value::String(token), number] if desc.tokens.contains(token) => number
                    .as_float()
                    .map(|f| format!("{},{}", token, f))
                    .ok_or_else(|| invalid(format!("expected number, got {}", number.type_name()))),
                _ => Err(invalid(format!("expected [one of {:?}, number], got {}", desc.tokens, value))),
            },
            other => Err(invalid(format!("expected [token, number], got {}", other.type_name()))),
        },
        Codec::ErrorStatus => Err(invalid("error status cannot be written".to_string())),
    }
}

/// A fully encoded logical command, ready for the dispatcher
#[derive(Debug, Clone, PartialEq)]
pub struct Command {
    /// Command text without line terminator
    pub text: String,
    /// Whether the instrument answers with one reply line
    pub expects_reply: bool,
    /// Decoder of the reply
    pub decoder: Decoder,
}

impl Command {
    /// An arbitrary command; a reply is expected iff it contains `?`
    pub fn raw(text: &str, strip_header: bool) -> Self {
        Self {
            text: text.to_string(),
            expects_reply: text.contains('?'),
            decoder: Decoder::text(strip_header),
        }
    }
}

/// Builds wire commands from the address registry
#[derive(Debug, Clone)]
pub struct Encoder {
    registry: AddressRegistry,
}

impl Encoder {
    /// Create an encoder for a registry
    pub fn new(registry: AddressRegistry) -> Self {
        Self { registry }
    }

    /// The registry
    pub fn registry(&self) -> &AddressRegistry {
        &self.registry
    }

    fn lookup(&self, target: &Target, property: &str) -> Result<(&PropertyDescriptor, String)> {
        match (target.kind, &target.id) {
            (EntityKind::Channel, Some(id)) => {
                let mut chars = id.chars();
                match (chars.next(), chars.next()) {
                    (Some(letter), None) => self.registry.validate_channel(letter)?,
                    _ => {
                        return Err(DeviceError::InvalidAddress {
                            kind: EntityKind::Channel,
                            id: id.clone(),
                        })
                    }
                }
            }
            (EntityKind::Loop, Some(id)) => {
                let number = id.parse::<u32>().map_err(|_| DeviceError::InvalidAddress {
                    kind: EntityKind::Loop,
                    id: id.clone(),
                })?;
                self.registry.validate_loop(number)?;
            }
            (EntityKind::Device, None) => {}
            (kind, id) => {
                return Err(DeviceError::InvalidAddress {
                    kind,
                    id: id.clone().unwrap_or_default(),
                })
            }
        }
        let desc = self.registry.descriptor(target.kind, property)?;
        let header = desc.header(target.id.as_deref());
        Ok((desc, header))
    }

    /// Encode a property query
    pub fn encode_read(&self, target: &Target, property: &str) -> Result<Command> {
        let (desc, header) = self.lookup(target, property)?;
        if !desc.access.is_readable() {
            return Err(DeviceError::NotReadable(header));
        }
        Ok(Command {
            text: query(&header),
            expects_reply: true,
            decoder: Decoder::for_descriptor(desc, self.registry.framing().strip_header),
        })
    }

    /// Encode a property write
    ///
    /// With write read-back enabled the set command is followed by a query of
    /// the same property (or of the error queue for write-only properties) and
    /// one reply line is expected.
    pub fn encode_write(&self, target: &Target, property: &str, value: &Value) -> Result<Command> {
        let (desc, header) = self.lookup(target, property)?;
        if !desc.access.is_writable() {
            return Err(DeviceError::NotWritable(header));
        }
        let set = format!("{} {}", header, encode_value(desc, &header, value)?);

        let model = self.registry.model();
        let strip = model.framing.strip_header;
        if !model.write_readback {
            return Ok(Command {
                text: set,
                expects_reply: false,
                decoder: Decoder::for_descriptor(desc, strip),
            });
        }

        let join = &model.framing.join;
        let (readback, decoder) = if desc.access.is_readable() {
            (query(&header), Decoder::for_descriptor(desc, strip))
        } else {
            (query(&model.error_query), Decoder::error_status(strip))
        };
        Ok(Command {
            text: format!("{}{}{}", set, join, readback),
            expects_reply: true,
            decoder,
        })
    }

    /// Whether a read of this property may be served from a cache
    pub fn is_cached(&self, target: &Target, property: &str) -> bool {
        self.registry
            .descriptor(target.kind, property)
            .map(|d| d.cache)
            .unwrap_or(false)
    }
}

fn query(header: &str) -> String {
    if header.ends_with('?') {
        header.to_string()
    } else {
        format!("{}?", header)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::registry::DeviceModel;

    fn encoder() -> Encoder {
        Encoder::new(AddressRegistry::default())
    }

    #[test]
    fn test_encode_reads() {
        let enc = encoder();
        let cmd = enc.encode_read(&Target::device(), "identity").unwrap();
        assert_eq!(cmd.text, "*IDN?");
        assert!(cmd.expects_reply);

        let cmd = enc.encode_read(&Target::channel('A'), "temperature").unwrap();
        assert_eq!(cmd.text, "A:TEMP?");

        let cmd = enc.encode_read(&Target::control_loop(2), "slew_mode").unwrap();
        assert_eq!(cmd.text, "2:SLEW:MODE?");
        assert_eq!(cmd.decoder.codec(), Codec::Token);
    }

    #[test]
    fn test_encode_writes() {
        let enc = encoder();
        let cmd = enc
            .encode_write(&Target::device(), "control_state", &Value::Bool(true))
            .unwrap();
        assert_eq!(cmd.text, ":OUTP:STAT 1");
        assert!(!cmd.expects_reply);

        let cmd = enc
            .encode_write(&Target::channel('B'), "range", &"2.00bar".into())
            .unwrap();
        assert_eq!(cmd.text, "B:RANG \"2.00bar\"");

        let cmd = enc
            .encode_write(&Target::control_loop(1), "setpoint", &Value::Integer(1000))
            .unwrap();
        assert_eq!(cmd.text, "1:SETP 1000");
    }

    #[test]
    fn test_encode_write_readback() {
        let registry = AddressRegistry::new(DeviceModel::default().with_write_readback(true)).unwrap();
        let enc = Encoder::new(registry);
        let cmd = enc
            .encode_write(&Target::control_loop(1), "setpoint", &Value::Float(12.5))
            .unwrap();
        assert_eq!(cmd.text, "1:SETP 12.5;1:SETP?");
        assert!(cmd.expects_reply);
    }

    #[test]
    fn test_encode_rejections() {
        let enc = encoder();
        assert!(matches!(
            enc.encode_read(&Target::channel('Z'), "temperature"),
            Err(DeviceError::InvalidAddress { .. })
        ));
        assert!(matches!(
            enc.encode_read(&Target::control_loop(1), "temperature"),
            Err(DeviceError::UnknownProperty { .. })
        ));
        assert!(matches!(
            enc.encode_write(&Target::channel('A'), "temperature", &Value::Float(1.0)),
            Err(DeviceError::NotWritable(_))
        ));
        assert!(matches!(
            enc.encode_write(&Target::control_loop(1), "slew_mode", &"FAST".into()),
            Err(DeviceError::InvalidValue { .. })
        ));
        assert!(matches!(
            enc.encode_write(&Target::control_loop(1), "enabled", &Value::Integer(1)),
            Err(DeviceError::InvalidValue { .. })
        ));
    }

    #[test]
    fn test_decode_shapes() {
        let text = Decoder::text(true);
        assert_eq!(
            text.decode("*IDN?", "*IDN GE Druck,PACE5000,10388796,DK0367  v02.02.14\n").unwrap(),
            Value::String("GE Druck,PACE5000,10388796,DK0367  v02.02.14".into())
        );
        assert_eq!(
            text.decode("*IDN?", "GE Druck,PACE5000").unwrap(),
            Value::String("GE Druck,PACE5000".into())
        );

        let enc = encoder();
        let temp = enc.encode_read(&Target::channel('A'), "temperature").unwrap();
        assert_eq!(temp.decoder.decode(&temp.text, "23.5").unwrap(), Value::Float(23.5));
        assert_eq!(temp.decoder.decode(&temp.text, ":A:TEMP 23.5").unwrap(), Value::Float(23.5));

        let err = enc.encode_read(&Target::device(), "error").unwrap();
        assert_eq!(
            err.decoder.decode(&err.text, ":SYST:ERR 0, No error").unwrap(),
            Value::Array(vec![Value::Integer(0), Value::String("No error".into())])
        );

        let version = enc.encode_read(&Target::device(), "version").unwrap();
        assert_eq!(
            version.decoder.decode(&version.text, "\"02.02.14\"").unwrap(),
            Value::String("02.02.14".into())
        );

        let state = enc.encode_read(&Target::device(), "control_state").unwrap();
        assert_eq!(state.decoder.decode(&state.text, "1").unwrap(), Value::Bool(true));
    }

    #[test]
    fn test_decode_malformed() {
        let enc = encoder();
        let temp = enc.encode_read(&Target::channel('A'), "temperature").unwrap();
        match temp.decoder.decode(&temp.text, "hot") {
            Err(DeviceError::MalformedReply { command, raw, .. }) => {
                assert_eq!(command, "A:TEMP?");
                assert_eq!(raw, "hot");
            }
            other => panic!("unexpected {:?}", other),
        }

        assert!(temp.decoder.decode(&temp.text, NACK).is_err());

        let mode = enc.encode_read(&Target::control_loop(1), "slew_mode").unwrap();
        assert!(mode.decoder.decode(&mode.text, "FAST").is_err());
        assert_eq!(mode.decoder.decode(&mode.text, "LIN").unwrap(), Value::String("LIN".into()));
    }

    #[test]
    fn test_decode_rejects_loose_bools_and_non_finite_floats() {
        let enc = encoder();
        let state = enc.encode_read(&Target::device(), "control_state").unwrap();
        assert_eq!(state.decoder.decode(&state.text, "0").unwrap(), Value::Bool(false));
        for reply in ["2", "-1", "01", "true", ""] {
            assert!(matches!(
                state.decoder.decode(&state.text, reply),
                Err(DeviceError::MalformedReply { .. })
            ));
        }

        let pressure = enc.encode_read(&Target::channel('A'), "pressure").unwrap();
        for reply in ["inf", "-inf", "NaN", "infinity"] {
            assert!(matches!(
                pressure.decoder.decode(&pressure.text, reply),
                Err(DeviceError::MalformedReply { .. })
            ));
        }
        assert_eq!(pressure.decoder.decode(&pressure.text, "-1.5e3").unwrap(), Value::Float(-1500.0));
    }

    #[test]
    fn test_paired_values() {
        let enc = encoder();
        let limits = enc.encode_read(&Target::channel('A'), "pressure_in_limits").unwrap();
        assert_eq!(limits.text, "A:PRES:INL?");
        assert_eq!(
            limits.decoder.decode(&limits.text, ":SENS:PRES:INL 1013.25, 1").unwrap(),
            Value::Array(vec![Value::Float(1013.25), Value::Bool(true)])
        );
        assert!(limits.decoder.decode(&limits.text, "1013.25").is_err());
        assert!(limits.decoder.decode(&limits.text, "1013.25,2").is_err());

        let startup = enc.encode_read(&Target::device(), "startup_mode").unwrap();
        assert_eq!(
            startup.decoder.decode(&startup.text, "CONT,1000.0").unwrap(),
            Value::Array(vec![Value::String("CONT".into()), Value::Float(1000.0)])
        );
        assert!(startup.decoder.decode(&startup.text, "IDLE,1000.0").is_err());

        let value = Value::Array(vec![Value::String("MEAS".into()), Value::Integer(20)]);
        let cmd = enc.encode_write(&Target::device(), "startup_mode", &value).unwrap();
        assert_eq!(cmd.text, ":SYST:SET MEAS,20");
        assert!(matches!(
            enc.encode_write(&Target::device(), "startup_mode", &Value::String("MEAS".into())),
            Err(DeviceError::InvalidValue { .. })
        ));
        assert!(matches!(
            enc.encode_write(
                &Target::device(),
                "startup_mode",
                &Value::Array(vec![Value::String("IDLE".into()), Value::Float(1.0)])
            ),
            Err(DeviceError::InvalidValue { .. })
        ));
    }

    #[test]
    fn test_raw_command() {
        let cmd = Command::raw("*IDN?", true);
        assert!(cmd.expects_reply);
        let cmd = Command::raw(":OUTP:STAT 1", true);
        assert!(!cmd.expects_reply);
    }
}
