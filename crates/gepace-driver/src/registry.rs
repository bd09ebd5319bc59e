/*!
 * Address registry for gepace.
 *
 * A [`DeviceModel`] declares which channel letters and loop numbers exist,
 * which property maps to which command template for every entity kind, and
 * how grouped commands are framed on the wire. Once wrapped in an
 * [`AddressRegistry`] the model is validated and never mutated again.
 */
use std::collections::BTreeMap;
use std::fmt;
use std::path::Path;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::error::{DeviceError, Result};

/// Placeholder substituted with the channel letter or loop number
pub const ID_PLACEHOLDER: &str = "{id}";

/// Batch ceiling of the built-in model, in bytes
pub const DEFAULT_MAX_BATCH_LEN: usize = 128;

/// Components reporting a serial number, in `:INST:SN<n>` order
pub const SERIAL_COMPONENTS: [&str; 7] = ["ui", "ctrl1", "ctrl2", "ao1", "ao2", "vfc1", "vfc2"];

/// Property name of a component's serial number
pub fn serial_property(component: &str) -> String {
    format!("serial_{}", component)
}

/// Kinds of addressable entities
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EntityKind {
    /// The instrument itself
    Device,
    /// A sensor channel, addressed by letter
    Channel,
    /// A control loop, addressed by number
    Loop,
}

impl fmt::Display for EntityKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            EntityKind::Device => write!(f, "device"),
            EntityKind::Channel => write!(f, "channel"),
            EntityKind::Loop => write!(f, "loop"),
        }
    }
}

/// Property access mode
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Access {
    /// Read-only property
    Read,
    /// Write-only property
    Write,
    /// Read-write property
    ReadWrite,
}

impl Access {
    /// Whether the property can be queried
    pub fn is_readable(self) -> bool {
        matches!(self, Access::Read | Access::ReadWrite)
    }

    /// Whether the property can be set
    pub fn is_writable(self) -> bool {
        matches!(self, Access::Write | Access::ReadWrite)
    }
}

impl Default for Access {
    fn default() -> Self {
        Access::Read
    }
}

/// Value shape of a property on the wire
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Codec {
    /// Raw text, passed through
    Text,
    /// Double-quoted text
    Quoted,
    /// `0` / `1`
    Bool,
    /// Signed integer
    Integer,
    /// Floating point number
    Float,
    /// One of the descriptor's enumerated tokens
    Token,
    /// `<code>, <message>` error queue entry
    ErrorStatus,
    /// `<number>,<0|1>`, a reading with a flag
    FloatBool,
    /// `<token>,<number>`, one of the descriptor's tokens with a value
    TokenFloat,
}

/// How a grouped transmission is answered
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ReplyFraming {
    /// One reply line per reply-expecting command
    Lines,
    /// One reply line per transmission, replies separated by `reply_separator`
    Joined,
}

/// Wire framing of commands and grouped batches
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Framing {
    /// Token joining commands of a batch into one transmission
    #[serde(default = "default_join")]
    pub join: String,

    /// Reply framing of grouped transmissions
    #[serde(default = "default_reply")]
    pub reply: ReplyFraming,

    /// Separator between replies in [`ReplyFraming::Joined`] mode
    #[serde(default = "default_join")]
    pub reply_separator: String,

    /// Maximum length in bytes of one grouped transmission (unbounded when unset)
    #[serde(default)]
    pub max_batch_len: Option<usize>,

    /// Line terminator appended to every transmission
    #[serde(default = "default_terminator")]
    pub terminator: String,

    /// Remove an echoed `:HEADER` / `*HEADER` token from replies
    #[serde(default = "default_true")]
    pub strip_header: bool,
}

impl Default for Framing {
    fn default() -> Self {
        Self {
            join: default_join(),
            reply: default_reply(),
            reply_separator: default_join(),
            max_batch_len: None,
            terminator: default_terminator(),
            strip_header: true,
        }
    }
}

fn default_join() -> String {
    ";".to_string()
}

fn default_reply() -> ReplyFraming {
    ReplyFraming::Lines
}

fn default_terminator() -> String {
    "\n".to_string()
}

fn default_true() -> bool {
    true
}

fn default_error_query() -> String {
    ":SYST:ERR".to_string()
}

/// Static description of one property
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PropertyDescriptor {
    /// Property name (filled from the table key)
    #[serde(skip)]
    pub name: String,

    /// Command template; `{id}` is replaced by the entity identifier
    pub template: String,

    /// Value shape
    pub codec: Codec,

    /// Allowed tokens for [`Codec::Token`]
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub tokens: Vec<String>,

    /// Access mode
    #[serde(default)]
    pub access: Access,

    /// Whether a read value may be cached for the lifetime of the device
    #[serde(default)]
    pub cache: bool,
}

impl PropertyDescriptor {
    /// Create a read-only descriptor
    pub fn read(template: &str, codec: Codec) -> Self {
        Self {
            name: String::new(),
            template: template.to_string(),
            codec,
            tokens: Vec::new(),
            access: Access::Read,
            cache: false,
        }
    }

    /// Create a read-write descriptor
    pub fn read_write(template: &str, codec: Codec) -> Self {
        Self {
            access: Access::ReadWrite,
            ..Self::read(template, codec)
        }
    }

    /// Set the enumerated tokens
    pub fn with_tokens<I, S>(mut self, tokens: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.tokens = tokens.into_iter().map(Into::into).collect();
        self
    }

    /// Mark the property as cacheable
    pub fn cached(mut self) -> Self {
        self.cache = true;
        self
    }

    /// Command header for an entity identifier
    pub fn header(&self, id: Option<&str>) -> String {
        match id {
            Some(id) => self.template.replace(ID_PLACEHOLDER, id),
            None => self.template.clone(),
        }
    }
}

/// Property table of one entity kind
pub type PropertyTable = BTreeMap<String, PropertyDescriptor>;

/// Declarative definition of a device model
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DeviceModel {
    /// Model name
    pub name: String,

    /// Valid channel letters
    pub channels: Vec<char>,

    /// Valid loop numbers
    pub loops: Vec<u32>,

    /// Wire framing
    #[serde(default)]
    pub framing: Framing,

    /// Send writes as `<set>;<query>?` and return the read-back value
    #[serde(default)]
    pub write_readback: bool,

    /// Query used to read back write-only properties
    #[serde(default = "default_error_query")]
    pub error_query: String,

    /// Device-level properties
    #[serde(default)]
    pub device: PropertyTable,

    /// Channel properties
    #[serde(default)]
    pub channel: PropertyTable,

    /// Loop properties
    #[serde(default, rename = "loop")]
    pub control_loop: PropertyTable,
}

impl Default for DeviceModel {
    /// The PACE 5000/6000 command set with two channels and two loops
    fn default() -> Self {
        use Codec::*;

        let device = [
            ("identity", PropertyDescriptor::read("*IDN", Text).cached()),
            ("hw_test", PropertyDescriptor::read("*TST", Bool)),
            ("error", PropertyDescriptor::read(":SYST:ERR", ErrorStatus)),
            ("version", PropertyDescriptor::read(":SYST:VERS", Quoted).cached()),
            ("world_area", PropertyDescriptor::read(":SYST:AREA", Text).cached()),
            ("mac", PropertyDescriptor::read(":INST:MAC", Quoted).cached()),
            ("task", PropertyDescriptor::read(":INST:TASK", Text)),
            ("control_state", PropertyDescriptor::read_write(":OUTP:STAT", Bool)),
            ("relay1", PropertyDescriptor::read_write(":OUTP:LOG1", Bool)),
            ("relay2", PropertyDescriptor::read_write(":OUTP:LOG2", Bool)),
            ("relay3", PropertyDescriptor::read_write(":OUTP:LOG3", Bool)),
            (
                "startup_mode",
                PropertyDescriptor::read_write(":SYST:SET", TokenFloat).with_tokens(["MEAS", "CONT"]),
            ),
        ];
        let serials = SERIAL_COMPONENTS.into_iter().enumerate().map(|(i, component)| {
            (
                serial_property(component),
                PropertyDescriptor::read(&format!(":INST:SN{}", i + 1), Integer).cached(),
            )
        });

        let channel = [
            ("temperature", PropertyDescriptor::read("{id}:TEMP", Float)),
            ("pressure", PropertyDescriptor::read("{id}:PRES", Float)),
            ("barometric_pressure", PropertyDescriptor::read("{id}:PRES:BAR", Float)),
            ("unit", PropertyDescriptor::read_write("{id}:UNIT", Text)),
            ("range", PropertyDescriptor::read_write("{id}:RANG", Quoted)),
            ("resolution", PropertyDescriptor::read_write("{id}:RES", Integer)),
            ("sensor_type", PropertyDescriptor::read("{id}:TYPE", Text)),
            ("pressure_in_limits", PropertyDescriptor::read("{id}:PRES:INL", FloatBool)),
        ];

        let control_loop = [
            ("source", PropertyDescriptor::read_write("{id}:SOUR", Text)),
            ("setpoint", PropertyDescriptor::read_write("{id}:SETP", Float)),
            ("enabled", PropertyDescriptor::read_write("{id}:ENAB", Bool)),
            ("effort", PropertyDescriptor::read("{id}:EFF", Float)),
            ("slew_rate", PropertyDescriptor::read_write("{id}:SLEW", Float)),
            (
                "slew_mode",
                PropertyDescriptor::read_write("{id}:SLEW:MODE", Token).with_tokens(["MAX", "LIN"]),
            ),
            ("overshoot", PropertyDescriptor::read_write("{id}:SLEW:OVER", Bool)),
            ("source_pressure_pos", PropertyDescriptor::read("{id}:COMP1", Float)),
            ("source_pressure_neg", PropertyDescriptor::read("{id}:COMP2", Float)),
        ];

        fn table<I, S>(entries: I) -> PropertyTable
        where
            I: IntoIterator<Item = (S, PropertyDescriptor)>,
            S: Into<String>,
        {
            entries
                .into_iter()
                .map(|(name, mut desc)| {
                    let name = name.into();
                    desc.name = name.clone();
                    (name, desc)
                })
                .collect()
        }

        Self {
            name: "PACE5000".to_string(),
            channels: vec!['A', 'B'],
            loops: vec![1, 2],
            framing: Framing {
                max_batch_len: Some(DEFAULT_MAX_BATCH_LEN),
                ..Framing::default()
            },
            write_readback: false,
            error_query: default_error_query(),
            device: table(
                device
                    .into_iter()
                    .map(|(name, desc)| (name.to_string(), desc))
                    .chain(serials),
            ),
            channel: table(channel),
            control_loop: table(control_loop),
        }
    }
}

impl DeviceModel {
    /// Parse a model from a TOML document
    pub fn from_toml_str(text: &str) -> Result<Self> {
        let mut model: DeviceModel = toml::from_str(text)?;
        model.fill_names();
        Ok(model)
    }

    /// Load a model from a TOML file
    pub fn from_path<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        debug!("Loading device model from {}", path.display());
        let text = std::fs::read_to_string(path).map_err(|e| {
            DeviceError::registry(format!("cannot read {}: {}", path.display(), e))
        })?;
        Self::from_toml_str(&text)
    }

    /// Replace the channel set
    pub fn with_channels<I: IntoIterator<Item = char>>(mut self, channels: I) -> Self {
        self.channels = channels.into_iter().collect();
        self
    }

    /// Replace the loop set
    pub fn with_loops<I: IntoIterator<Item = u32>>(mut self, loops: I) -> Self {
        self.loops = loops.into_iter().collect();
        self
    }

    /// Replace the framing
    pub fn with_framing(mut self, framing: Framing) -> Self {
        self.framing = framing;
        self
    }

    /// Enable or disable write read-back
    pub fn with_write_readback(mut self, enabled: bool) -> Self {
        self.write_readback = enabled;
        self
    }

    /// Property table of an entity kind
    pub fn table(&self, kind: EntityKind) -> &PropertyTable {
        match kind {
            EntityKind::Device => &self.device,
            EntityKind::Channel => &self.channel,
            EntityKind::Loop => &self.control_loop,
        }
    }

    fn fill_names(&mut self) {
        for table in [&mut self.device, &mut self.channel, &mut self.control_loop] {
            for (name, desc) in table.iter_mut() {
                desc.name = name.clone();
            }
        }
    }

    /// Check the model for inconsistencies
    pub fn validate(&self) -> Result<()> {
        if self.channels.is_empty() {
            return Err(DeviceError::registry(format!("model {} defines no channel", self.name)));
        }
        for (i, letter) in self.channels.iter().enumerate() {
            if !letter.is_ascii_alphabetic() {
                return Err(DeviceError::registry(format!("channel {:?} is not a letter", letter)));
            }
            if self.channels[..i].contains(letter) {
                return Err(DeviceError::registry(format!("channel {:?} defined twice", letter)));
            }
        }
        for (i, number) in self.loops.iter().enumerate() {
            if *number == 0 {
                return Err(DeviceError::registry("loop numbers must be positive"));
            }
            if self.loops[..i].contains(number) {
                return Err(DeviceError::registry(format!("loop {} defined twice", number)));
            }
        }
        if self.framing.join.is_empty() || self.framing.terminator.is_empty() {
            return Err(DeviceError::registry("join token and terminator must not be empty"));
        }
        if self.framing.reply == ReplyFraming::Joined && self.framing.reply_separator.is_empty() {
            return Err(DeviceError::registry("joined replies need a reply separator"));
        }

        for kind in [EntityKind::Device, EntityKind::Channel, EntityKind::Loop] {
            for (name, desc) in self.table(kind) {
                if desc.template.trim().is_empty() {
                    return Err(DeviceError::registry(format!("{} {} has an empty template", kind, name)));
                }
                let addressed = desc.template.contains(ID_PLACEHOLDER);
                if addressed != (kind != EntityKind::Device) {
                    return Err(DeviceError::registry(format!(
                        "{} {}: template {:?} must {}contain {}",
                        kind,
                        name,
                        desc.template,
                        if kind == EntityKind::Device { "not " } else { "" },
                        ID_PLACEHOLDER
                    )));
                }
                if matches!(desc.codec, Codec::Token | Codec::TokenFloat) && desc.tokens.is_empty() {
                    return Err(DeviceError::registry(format!("{} {} declares no token", kind, name)));
                }
                if desc.codec == Codec::ErrorStatus && desc.access.is_writable() {
                    return Err(DeviceError::registry(format!("{} {}: error status is read-only", kind, name)));
                }
            }
        }
        Ok(())
    }
}

/// Validated, immutable and cheaply clonable view of a [`DeviceModel`]
#[derive(Debug, Clone)]
pub struct AddressRegistry(Arc<DeviceModel>);

impl AddressRegistry {
    /// Validate a model and freeze it
    pub fn new(model: DeviceModel) -> Result<Self> {
        model.validate()?;
        debug!(
            "Registered model {} with channels {:?} and loops {:?}",
            model.name, model.channels, model.loops
        );
        Ok(Self(Arc::new(model)))
    }

    /// The underlying model
    pub fn model(&self) -> &DeviceModel {
        &self.0
    }

    /// Wire framing of the model
    pub fn framing(&self) -> &Framing {
        &self.0.framing
    }

    /// Check a channel letter
    pub fn validate_channel(&self, letter: char) -> Result<()> {
        if self.0.channels.contains(&letter) {
            Ok(())
        } else {
            Err(DeviceError::InvalidAddress {
                kind: EntityKind::Channel,
                id: letter.to_string(),
            })
        }
    }

    /// Check a loop number
    pub fn validate_loop(&self, number: u32) -> Result<()> {
        if self.0.loops.contains(&number) {
            Ok(())
        } else {
            Err(DeviceError::InvalidAddress {
                kind: EntityKind::Loop,
                id: number.to_string(),
            })
        }
    }

    /// Look up a property descriptor
    pub fn descriptor(&self, kind: EntityKind, property: &str) -> Result<&PropertyDescriptor> {
        self.0
            .table(kind)
            .get(property)
            .ok_or_else(|| DeviceError::UnknownProperty {
                kind,
                property: property.to_string(),
            })
    }

    /// All descriptors of an entity kind, in name order
    pub fn properties(&self, kind: EntityKind) -> impl Iterator<Item = &PropertyDescriptor> {
        self.0.table(kind).values()
    }

    /// Every command header the model can address, with its descriptor
    pub fn headers(&self) -> Vec<(String, &PropertyDescriptor)> {
        let model = &self.0;
        let mut headers: Vec<(String, &PropertyDescriptor)> =
            model.device.values().map(|d| (d.header(None), d)).collect();
        for letter in &model.channels {
            let id = letter.to_string();
            headers.extend(model.channel.values().map(|d| (d.header(Some(&id)), d)));
        }
        for number in &model.loops {
            let id = number.to_string();
            headers.extend(model.control_loop.values().map(|d| (d.header(Some(&id)), d)));
        }
        headers
    }
}

impl Default for AddressRegistry {
    fn default() -> Self {
        Self(Arc::new(DeviceModel::default()))
    }
}
