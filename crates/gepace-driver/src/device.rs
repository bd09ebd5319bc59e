/*!
 * Device and entity proxies.
 *
 * A [`Device`] owns one [`Dispatcher`] and hands out lightweight [`Channel`]
 * and [`Loop`] views. Every accessor encodes one command, asks the dispatcher
 * to send or queue it and returns a [`Reply`]: ready when the command went out
 * immediately, pending while a group is open.
 */
use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::marker::PhantomData;

use futures::future::BoxFuture;
use tokio::sync::RwLock;
use tracing::{debug, info, warn};

use gepace_core::error::Error as CoreError;
use gepace_core::types::Value;

use crate::codec::{Command, Encoder, Target};
use crate::dispatcher::{DispatchOptions, DispatchStats, Dispatched, Dispatcher, Group};
use crate::error::{DeviceError, Result};
use crate::group::{GroupReplies, Placeholder};
use crate::protocol::Transport;
use crate::registry::{serial_property, AddressRegistry, SERIAL_COMPONENTS};

/// Conversion of a decoded value into an accessor's return type
pub trait FromValue: Sized {
    /// Convert, failing if the value has the wrong shape
    fn from_value(value: Value) -> Result<Self>;
}

impl<T> FromValue for T
where
    T: TryFrom<Value>,
    DeviceError: From<T::Error>,
{
    fn from_value(value: Value) -> Result<Self> {
        Ok(T::try_from(value)?)
    }
}

/// Result of an accessor call
#[derive(Debug, Clone)]
pub enum Reply<T> {
    /// The command was transmitted and its reply decoded
    Ready(T),
    /// The command was queued in an open group
    Pending(Pending<T>),
}

impl<T: FromValue> Reply<T> {
    /// The value, reading the group result for pending replies
    pub fn value(self) -> Result<T> {
        match self {
            Reply::Ready(value) => Ok(value),
            Reply::Pending(pending) => pending.value(),
        }
    }
}

impl<T> Reply<T> {
    /// Whether the reply waits on a group
    pub fn is_pending(&self) -> bool {
        matches!(self, Reply::Pending(_))
    }

    /// The value if it is already available
    pub fn ready(&self) -> Option<&T> {
        match self {
            Reply::Ready(value) => Some(value),
            Reply::Pending(_) => None,
        }
    }
}

/// Typed handle on a queued reply
pub struct Pending<T> {
    placeholder: Placeholder,
    _marker: PhantomData<fn() -> T>,
}

impl<T> Pending<T> {
    fn new(placeholder: Placeholder) -> Self {
        Self {
            placeholder,
            _marker: PhantomData,
        }
    }

    /// The untyped placeholder
    pub fn placeholder(&self) -> &Placeholder {
        &self.placeholder
    }

    /// Whether the group resolved
    pub fn is_resolved(&self) -> bool {
        self.placeholder.is_resolved()
    }
}

impl<T: FromValue> Pending<T> {
    /// The converted reply, or [`DeviceError::Unresolved`]
    pub fn value(&self) -> Result<T> {
        T::from_value(self.placeholder.value()?)
    }
}

impl<T> Clone for Pending<T> {
    fn clone(&self) -> Self {
        Self::new(self.placeholder.clone())
    }
}

impl<T> fmt::Debug for Pending<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Pending")
            .field("command", &self.placeholder.command())
            .field("resolved", &self.placeholder.is_resolved())
            .finish()
    }
}

/// Entry of the error queue
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ErrorStatus {
    /// Error code, `0` when the queue is empty
    pub code: i64,
    /// Error text
    pub message: String,
}

impl ErrorStatus {
    /// Whether this entry reports no error
    pub fn is_ok(&self) -> bool {
        self.code == 0
    }
}

impl TryFrom<Value> for ErrorStatus {
    type Error = CoreError;

    fn try_from(value: Value) -> std::result::Result<Self, Self::Error> {
        match value {
            Value::Array(items) => match items.as_slice() {
                [Value::Integer(code), Value::String(message)] => Ok(Self {
                    code: *code,
                    message: message.clone(),
                }),
                _ => Err(CoreError::conversion(format!("expected [code, message], got {:?}", items))),
            },
            other => Err(CoreError::conversion(format!(
                "expected error status, got {}",
                other.type_name()
            ))),
        }
    }
}

/// Slew rate mode of a control loop
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum RateMode {
    /// Fastest possible slew
    Maximum,
    /// Linear slew at the configured rate
    Linear,
}

impl RateMode {
    /// Wire token
    pub fn token(self) -> &'static str {
        match self {
            RateMode::Maximum => "MAX",
            RateMode::Linear => "LIN",
        }
    }
}

impl TryFrom<Value> for RateMode {
    type Error = CoreError;

    fn try_from(value: Value) -> std::result::Result<Self, Self::Error> {
        match value.as_str() {
            Some("MAX") => Ok(RateMode::Maximum),
            Some("LIN") => Ok(RateMode::Linear),
            _ => Err(CoreError::conversion(format!("unknown rate mode {}", value))),
        }
    }
}

impl From<RateMode> for Value {
    fn from(mode: RateMode) -> Self {
        Value::String(mode.token().to_string())
    }
}

/// Pressure reading together with the instrument's in-limits flag
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct InLimits {
    /// Measured pressure
    pub pressure: f64,
    /// Whether the pressure is within the configured limits
    pub in_limits: bool,
}

impl TryFrom<Value> for InLimits {
    type Error = CoreError;

    fn try_from(value: Value) -> std::result::Result<Self, Self::Error> {
        match value {
            Value::Array(items) => match items.as_slice() {
                [Value::Float(pressure), Value::Bool(in_limits)] => Ok(Self {
                    pressure: *pressure,
                    in_limits: *in_limits,
                }),
                _ => Err(CoreError::conversion(format!("expected [pressure, flag], got {:?}", items))),
            },
            other => Err(CoreError::conversion(format!(
                "expected pressure with flag, got {}",
                other.type_name()
            ))),
        }
    }
}

/// Operating mode of the instrument
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Mode {
    /// Measure only
    Measure,
    /// Control to the setpoint
    Control,
}

impl Mode {
    /// Wire token
    pub fn token(self) -> &'static str {
        match self {
            Mode::Measure => "MEAS",
            Mode::Control => "CONT",
        }
    }

    fn from_token(token: &str) -> Option<Self> {
        match token {
            "MEAS" => Some(Mode::Measure),
            "CONT" => Some(Mode::Control),
            _ => None,
        }
    }
}

/// Mode and setpoint applied at power-up
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct StartupMode {
    /// Operating mode
    pub mode: Mode,
    /// Setpoint
    pub setpoint: f64,
}

impl TryFrom<Value> for StartupMode {
    type Error = CoreError;

    fn try_from(value: Value) -> std::result::Result<Self, Self::Error> {
        if let Value::Array(items) = &value {
            if let [Value::String(token), Value::Float(setpoint)] = items.as_slice() {
                if let Some(mode) = Mode::from_token(token) {
                    return Ok(Self {
                        mode,
                        setpoint: *setpoint,
                    });
                }
            }
        }
        Err(CoreError::conversion(format!("expected [mode, setpoint], got {}", value)))
    }
}

impl From<StartupMode> for Value {
    fn from(startup: StartupMode) -> Self {
        Value::Array(vec![
            Value::String(startup.mode.token().to_string()),
            Value::Float(startup.setpoint),
        ])
    }
}

#[derive(Debug, Clone)]
enum Cached {
    Value(Value),
    Pending(Placeholder),
}

/// A connected instrument
#[derive(Debug)]
pub struct Device {
    dispatcher: Dispatcher,
    encoder: Encoder,
    cache: RwLock<HashMap<String, Cached>>,
}

impl Device {
    /// Create a device driving `transport`
    pub fn new<T>(transport: T, registry: AddressRegistry, options: DispatchOptions) -> Self
    where
        T: Transport + 'static,
    {
        Self::from_dispatcher(Dispatcher::new(transport, registry.framing().clone(), options), registry)
    }

    /// Create a device for the default model and dispatch options
    pub fn with_defaults<T>(transport: T) -> Self
    where
        T: Transport + 'static,
    {
        Self::new(transport, AddressRegistry::default(), DispatchOptions::default())
    }

    /// Create a device around an existing dispatcher
    pub fn from_dispatcher(dispatcher: Dispatcher, registry: AddressRegistry) -> Self {
        info!("Device for model {}", registry.model().name);
        Self {
            dispatcher,
            encoder: Encoder::new(registry),
            cache: RwLock::new(HashMap::new()),
        }
    }

    /// The address registry
    pub fn registry(&self) -> &AddressRegistry {
        self.encoder.registry()
    }

    /// The dispatcher
    pub fn dispatcher(&self) -> &Dispatcher {
        &self.dispatcher
    }

    /// Transmission counters
    pub async fn stats(&self) -> DispatchStats {
        self.dispatcher.stats().await
    }

    /// A channel view; fails if `letter` is not defined for the model
    pub fn channel(&self, letter: char) -> Result<Channel<'_>> {
        self.registry().validate_channel(letter)?;
        Ok(Channel {
            device: self,
            letter,
            target: Target::channel(letter),
        })
    }

    /// A control loop view; fails if `number` is not defined for the model
    pub fn control_loop(&self, number: u32) -> Result<Loop<'_>> {
        self.registry().validate_loop(number)?;
        Ok(Loop {
            device: self,
            number,
            target: Target::control_loop(number),
        })
    }

    /// Views of every channel of the model
    pub fn channels(&self) -> Vec<Channel<'_>> {
        self.registry()
            .model()
            .channels
            .iter()
            .map(|&letter| Channel {
                device: self,
                letter,
                target: Target::channel(letter),
            })
            .collect()
    }

    /// Views of every control loop of the model
    pub fn loops(&self) -> Vec<Loop<'_>> {
        self.registry()
            .model()
            .loops
            .iter()
            .map(|&number| Loop {
                device: self,
                number,
                target: Target::control_loop(number),
            })
            .collect()
    }

    /// Open a group on this device's dispatcher
    pub fn begin_group(&self) -> Result<Group<'_>> {
        self.dispatcher.begin_group()
    }

    /// Run `body` inside a group
    ///
    /// The group is ended whatever `body` returns, so commands queued before a
    /// failure still go out. A failing body's error is returned in preference
    /// to a failure of the group itself.
    pub async fn grouped<'a, F>(&'a self, body: F) -> Result<GroupReplies>
    where
        F: FnOnce(&'a Device) -> BoxFuture<'a, Result<()>>,
    {
        let group = self.begin_group()?;
        match body(self).await {
            Ok(()) => group.end().await,
            Err(e) => {
                if let Err(end) = group.end().await {
                    warn!("Group after failed body did not complete: {}", end);
                }
                Err(e)
            }
        }
    }

    /// Discard unread input and stale replies, see [`Dispatcher::resync`]
    pub async fn resync(&self) -> Result<()> {
        self.dispatcher.resync().await
    }

    /// Send an arbitrary command; a reply is expected iff it contains `?`
    pub async fn raw(&self, command: &str) -> Result<Reply<Value>> {
        let command = Command::raw(command, self.registry().framing().strip_header);
        self.submit(command).await
    }

    /// Read a property of any entity by name
    pub async fn read_property<T: FromValue>(&self, target: &Target, property: &str) -> Result<Reply<T>> {
        let command = self.encoder.encode_read(target, property)?;
        let cacheable = self.encoder.is_cached(target, property);
        let key = command.text.clone();

        if cacheable && !self.dispatcher.is_grouping() {
            if let Some(value) = self.cached(&key).await {
                debug!("Cache hit for {}", key);
                return Ok(Reply::Ready(T::from_value(value)?));
            }
        }

        match self.dispatcher.execute(command).await? {
            Dispatched::Sent(value) => {
                if cacheable {
                    self.cache.write().await.insert(key, Cached::Value(value.clone()));
                }
                Ok(Reply::Ready(T::from_value(value)?))
            }
            Dispatched::Queued(placeholder) => {
                if cacheable {
                    self.cache
                        .write()
                        .await
                        .insert(key, Cached::Pending(placeholder.clone()));
                }
                Ok(Reply::Pending(Pending::new(placeholder)))
            }
        }
    }

    /// Write a property of any entity by name
    ///
    /// The reply holds the read-back value when the model enables write
    /// read-back, `Null` otherwise.
    pub async fn write_property<V: Into<Value>>(
        &self,
        target: &Target,
        property: &str,
        value: V,
    ) -> Result<Reply<Value>> {
        let command = self.encoder.encode_write(target, property, &value.into())?;
        if self.encoder.is_cached(target, property) {
            if let Ok(query) = self.encoder.encode_read(target, property) {
                self.cache.write().await.remove(&query.text);
            }
        }
        self.submit(command).await
    }

    async fn submit(&self, command: Command) -> Result<Reply<Value>> {
        Ok(match self.dispatcher.execute(command).await? {
            Dispatched::Sent(value) => Reply::Ready(value),
            Dispatched::Queued(placeholder) => Reply::Pending(Pending::new(placeholder)),
        })
    }

    async fn cached(&self, key: &str) -> Option<Value> {
        let mut cache = self.cache.write().await;
        let hit = match cache.get(key) {
            Some(Cached::Value(value)) => Some(value.clone()),
            Some(Cached::Pending(placeholder)) => placeholder.value().ok(),
            None => None,
        };
        match &hit {
            Some(value) => {
                cache.insert(key.to_string(), Cached::Value(value.clone()));
            }
            None => {
                cache.remove(key);
            }
        }
        hit
    }

    /// Drop every cached value
    pub async fn clear_cache(&self) {
        self.cache.write().await.clear();
    }

    /// Read every readable property of `target` in one group
    ///
    /// Pairs come in registry name order. Fails with
    /// [`DeviceError::GroupAlreadyActive`] inside a caller's group.
    pub async fn snapshot_of(&self, target: &Target) -> Result<Vec<(String, Value)>> {
        let names: Vec<String> = self
            .registry()
            .properties(target.kind)
            .filter(|desc| desc.access.is_readable())
            .map(|desc| desc.name.clone())
            .collect();
        let values = self.read_grouped(target, &names).await?;
        Ok(names.into_iter().zip(values).collect())
    }

    /// Read `names` of `target` in one group; nothing is sent if any fails to encode
    async fn read_grouped(&self, target: &Target, names: &[String]) -> Result<Vec<Value>> {
        let group = self.begin_group()?;
        let mut replies = Vec::with_capacity(names.len());
        for name in names {
            match self.read_property::<Value>(target, name).await {
                Ok(reply) => replies.push(reply),
                Err(e) => {
                    group.abort();
                    return Err(e);
                }
            }
        }
        group.end().await?;
        replies.into_iter().map(Reply::value).collect()
    }

    /// Serial numbers of the instrument's modules, keyed by component
    ///
    /// Read in one group the first time and served from the cache afterwards.
    /// Fails with [`DeviceError::GroupAlreadyActive`] inside a caller's group.
    pub async fn serial_numbers(&self) -> Result<BTreeMap<String, i64>> {
        let target = Target::device();
        let names: Vec<String> = SERIAL_COMPONENTS.iter().map(|c| serial_property(c)).collect();

        let mut values = Vec::with_capacity(names.len());
        if !self.dispatcher.is_grouping() {
            for name in &names {
                let key = self.encoder.encode_read(&target, name)?.text;
                match self.cached(&key).await {
                    Some(value) => values.push(value),
                    None => break,
                }
            }
        }
        if values.len() != names.len() {
            values = self.read_grouped(&target, &names).await?;
        }

        SERIAL_COMPONENTS
            .iter()
            .zip(values)
            .map(|(component, value)| Ok((component.to_string(), i64::from_value(value)?)))
            .collect()
    }

    /// Every readable device level property
    pub async fn snapshot(&self) -> Result<Vec<(String, Value)>> {
        self.snapshot_of(&Target::device()).await
    }

    async fn get<T: FromValue>(&self, property: &str) -> Result<Reply<T>> {
        self.read_property(&Target::device(), property).await
    }

    /// Identification string (`*IDN?`), cached after the first read
    pub async fn identity(&self) -> Result<Reply<String>> {
        self.get("identity").await
    }

    /// Result of the self test (`*TST?`)
    pub async fn hw_test(&self) -> Result<Reply<bool>> {
        self.get("hw_test").await
    }

    /// Next entry of the error queue
    pub async fn error(&self) -> Result<Reply<ErrorStatus>> {
        self.get("error").await
    }

    /// Firmware version, cached
    pub async fn version(&self) -> Result<Reply<String>> {
        self.get("version").await
    }

    /// Configured world area, cached
    pub async fn world_area(&self) -> Result<Reply<String>> {
        self.get("world_area").await
    }

    /// MAC address, cached
    pub async fn mac(&self) -> Result<Reply<String>> {
        self.get("mac").await
    }

    /// Running task
    pub async fn task(&self) -> Result<Reply<String>> {
        self.get("task").await
    }

    /// Whether the pressure output is controlling
    pub async fn control_state(&self) -> Result<Reply<bool>> {
        self.get("control_state").await
    }

    /// Switch the pressure output control on or off
    pub async fn set_control_state(&self, on: bool) -> Result<Reply<Value>> {
        self.write_property(&Target::device(), "control_state", on).await
    }

    /// Start controlling
    pub async fn start(&self) -> Result<Reply<Value>> {
        self.set_control_state(true).await
    }

    /// Stop controlling
    pub async fn stop(&self) -> Result<Reply<Value>> {
        self.set_control_state(false).await
    }

    /// State of logic output relay `number` (1 to 3)
    pub async fn relay(&self, number: u8) -> Result<Reply<bool>> {
        self.get(&format!("relay{}", number)).await
    }

    /// Switch logic output relay `number` (1 to 3)
    pub async fn set_relay(&self, number: u8, on: bool) -> Result<Reply<Value>> {
        self.write_property(&Target::device(), &format!("relay{}", number), on)
            .await
    }

    /// Mode and setpoint applied at power-up
    pub async fn startup_mode(&self) -> Result<Reply<StartupMode>> {
        self.get("startup_mode").await
    }

    /// Change the power-up mode and setpoint
    pub async fn set_startup_mode(&self, startup: StartupMode) -> Result<Reply<Value>> {
        self.write_property(&Target::device(), "startup_mode", startup).await
    }
}

/// View on one measurement channel
#[derive(Debug, Clone)]
pub struct Channel<'d> {
    device: &'d Device,
    letter: char,
    target: Target,
}

impl<'d> Channel<'d> {
    /// Channel letter
    pub fn letter(&self) -> char {
        self.letter
    }

    /// Addressed entity
    pub fn target(&self) -> &Target {
        &self.target
    }

    async fn get<T: FromValue>(&self, property: &str) -> Result<Reply<T>> {
        self.device.read_property(&self.target, property).await
    }

    async fn set<V: Into<Value>>(&self, property: &str, value: V) -> Result<Reply<Value>> {
        self.device.write_property(&self.target, property, value).await
    }

    /// Sensor temperature
    pub async fn temperature(&self) -> Result<Reply<f64>> {
        self.get("temperature").await
    }

    /// Measured pressure
    pub async fn pressure(&self) -> Result<Reply<f64>> {
        self.get("pressure").await
    }

    /// Barometric reference pressure
    pub async fn barometric_pressure(&self) -> Result<Reply<f64>> {
        self.get("barometric_pressure").await
    }

    /// Pressure unit
    pub async fn unit(&self) -> Result<Reply<String>> {
        self.get("unit").await
    }

    /// Change the pressure unit
    pub async fn set_unit(&self, unit: &str) -> Result<Reply<Value>> {
        self.set("unit", unit).await
    }

    /// Selected range name
    pub async fn range(&self) -> Result<Reply<String>> {
        self.get("range").await
    }

    /// Select a range by name
    pub async fn set_range(&self, range: &str) -> Result<Reply<Value>> {
        self.set("range", range).await
    }

    /// Displayed resolution in digits
    pub async fn resolution(&self) -> Result<Reply<i64>> {
        self.get("resolution").await
    }

    /// Change the displayed resolution
    pub async fn set_resolution(&self, digits: i64) -> Result<Reply<Value>> {
        self.set("resolution", digits).await
    }

    /// Sensor type
    pub async fn sensor_type(&self) -> Result<Reply<String>> {
        self.get("sensor_type").await
    }

    /// Measured pressure and whether it is within limits
    pub async fn pressure_in_limits(&self) -> Result<Reply<InLimits>> {
        self.get("pressure_in_limits").await
    }

    /// Every readable property of the channel, in one group
    pub async fn snapshot(&self) -> Result<Vec<(String, Value)>> {
        self.device.snapshot_of(&self.target).await
    }
}

/// View on one pressure control loop
#[derive(Debug, Clone)]
pub struct Loop<'d> {
    device: &'d Device,
    number: u32,
    target: Target,
}

impl<'d> Loop<'d> {
    /// Loop number
    pub fn number(&self) -> u32 {
        self.number
    }

    /// Addressed entity
    pub fn target(&self) -> &Target {
        &self.target
    }

    async fn get<T: FromValue>(&self, property: &str) -> Result<Reply<T>> {
        self.device.read_property(&self.target, property).await
    }

    async fn set<V: Into<Value>>(&self, property: &str, value: V) -> Result<Reply<Value>> {
        self.device.write_property(&self.target, property, value).await
    }

    /// Channel the loop regulates
    pub async fn source(&self) -> Result<Reply<String>> {
        self.get("source").await
    }

    /// Select the regulated channel
    pub async fn set_source(&self, source: &str) -> Result<Reply<Value>> {
        self.set("source", source).await
    }

    /// Pressure setpoint
    pub async fn setpoint(&self) -> Result<Reply<f64>> {
        self.get("setpoint").await
    }

    /// Change the pressure setpoint
    pub async fn set_setpoint(&self, setpoint: f64) -> Result<Reply<Value>> {
        self.set("setpoint", setpoint).await
    }

    /// Whether the loop regulates
    pub async fn enabled(&self) -> Result<Reply<bool>> {
        self.get("enabled").await
    }

    /// Enable or disable regulation
    pub async fn set_enabled(&self, enabled: bool) -> Result<Reply<Value>> {
        self.set("enabled", enabled).await
    }

    /// Controller effort in percent
    pub async fn effort(&self) -> Result<Reply<f64>> {
        self.get("effort").await
    }

    /// Slew rate
    pub async fn slew_rate(&self) -> Result<Reply<f64>> {
        self.get("slew_rate").await
    }

    /// Change the slew rate
    pub async fn set_slew_rate(&self, rate: f64) -> Result<Reply<Value>> {
        self.set("slew_rate", rate).await
    }

    /// Slew mode
    pub async fn slew_mode(&self) -> Result<Reply<RateMode>> {
        self.get("slew_mode").await
    }

    /// Change the slew mode
    pub async fn set_slew_mode(&self, mode: RateMode) -> Result<Reply<Value>> {
        self.set("slew_mode", mode).await
    }

    /// Whether overshoot is allowed while slewing
    pub async fn overshoot(&self) -> Result<Reply<bool>> {
        self.get("overshoot").await
    }

    /// Allow or forbid overshoot
    pub async fn set_overshoot(&self, allowed: bool) -> Result<Reply<Value>> {
        self.set("overshoot", allowed).await
    }

    /// Positive supply pressure
    pub async fn source_pressure_pos(&self) -> Result<Reply<f64>> {
        self.get("source_pressure_pos").await
    }

    /// Negative supply pressure
    pub async fn source_pressure_neg(&self) -> Result<Reply<f64>> {
        self.get("source_pressure_neg").await
    }

    /// Enable regulation
    pub async fn start(&self) -> Result<Reply<Value>> {
        self.set_enabled(true).await
    }

    /// Disable regulation
    pub async fn stop(&self) -> Result<Reply<Value>> {
        self.set_enabled(false).await
    }

    /// Every readable property of the loop, in one group
    pub async fn snapshot(&self) -> Result<Vec<(String, Value)>> {
        self.device.snapshot_of(&self.target).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::registry::{DeviceModel, EntityKind};
    use crate::simulator::Simulator;
    use crate::transports::mock::MockTransport;
    use gepace_core::utils::box_future;

    fn device(mock: &MockTransport) -> Device {
        Device::with_defaults(mock.clone())
    }

    #[tokio::test(start_paused = true)]
    async fn test_direct_reads() {
        let mock = MockTransport::new().with_replies(["*IDN GE Druck,PACE5000", "23.5", "LIN"]);
        let device = device(&mock);
        assert_eq!(device.identity().await.unwrap().value().unwrap(), "GE Druck,PACE5000");
        let temp = device.channel('A').unwrap().temperature().await.unwrap();
        assert_eq!(temp.ready(), Some(&23.5));
        let mode = device.control_loop(2).unwrap().slew_mode().await.unwrap();
        assert_eq!(mode.value().unwrap(), RateMode::Linear);
        assert_eq!(mock.writes(), vec!["*IDN?\n", "A:TEMP?\n", "2:SLEW:MODE?\n"]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_identity_is_cached() {
        let mock = MockTransport::new().with_replies(["GE Druck"]);
        let device = device(&mock);
        device.identity().await.unwrap();
        let again = device.identity().await.unwrap();
        assert_eq!(again.value().unwrap(), "GE Druck");
        assert_eq!(mock.transmissions(), 1);

        device.clear_cache().await;
        assert!(device.identity().await.is_err());
    }

    #[tokio::test(start_paused = true)]
    async fn test_grouped_read_refreshes_cache() {
        let mock = MockTransport::new().with_replies(["GE Druck", "1"]);
        let device = device(&mock);

        let group = device.begin_group().unwrap();
        let identity = device.identity().await.unwrap();
        let state = device.control_state().await.unwrap();
        assert!(identity.is_pending());
        group.end().await.unwrap();

        assert_eq!(identity.value().unwrap(), "GE Druck");
        assert!(state.value().unwrap());
        assert_eq!(device.identity().await.unwrap().value().unwrap(), "GE Druck");
        assert_eq!(mock.transmissions(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_invalid_addresses_fail_before_transmission() {
        let mock = MockTransport::new();
        let device = device(&mock);
        assert!(matches!(
            device.channel('C'),
            Err(DeviceError::InvalidAddress {
                kind: EntityKind::Channel,
                ..
            })
        ));
        assert!(matches!(device.control_loop(0), Err(DeviceError::InvalidAddress { .. })));
        assert!(matches!(
            device.read_property::<Value>(&Target::device(), "nope").await,
            Err(DeviceError::UnknownProperty { .. })
        ));
        assert!(mock.calls().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_grouped_helper_ends_group_on_error() {
        let mock = MockTransport::new().with_replies(["0"]);
        let device = device(&mock);
        let mut self_test = None;
        let slot = &mut self_test;
        let result = device
            .grouped(|d| {
                box_future(async move {
                    *slot = Some(d.hw_test().await?);
                    d.channel('Z')?;
                    Ok(())
                })
            })
            .await;
        assert!(matches!(result, Err(DeviceError::InvalidAddress { .. })));
        assert_eq!(mock.writes(), vec!["*TST?\n".to_string()]);
        assert!(!self_test.unwrap().value().unwrap());
        assert!(!device.dispatcher().is_grouping());
    }

    #[tokio::test(start_paused = true)]
    async fn test_grouped_helper_prefers_body_error() {
        let mock = MockTransport::new();
        let device = device(&mock);
        let result = device
            .grouped(|d| {
                box_future(async move {
                    d.hw_test().await?;
                    d.control_loop(9)?;
                    Ok(())
                })
            })
            .await;
        assert!(matches!(result, Err(DeviceError::InvalidAddress { .. })));
        assert_eq!(mock.transmissions(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_snapshot_through_simulator() {
        let sim = Simulator::new(&AddressRegistry::default())
            .with_value("1:SETP", "12.5")
            .with_value("1:SLEW:MODE", "LIN");
        let device = Device::with_defaults(sim);
        let snapshot = device.control_loop(1).unwrap().snapshot().await.unwrap();
        let names: Vec<&str> = snapshot.iter().map(|(n, _)| n.as_str()).collect();
        assert_eq!(
            names,
            vec![
                "effort",
                "enabled",
                "overshoot",
                "setpoint",
                "slew_mode",
                "slew_rate",
                "source",
                "source_pressure_neg",
                "source_pressure_pos"
            ]
        );
        assert!(snapshot.contains(&("setpoint".to_string(), Value::Float(12.5))));
        assert_eq!(device.stats().await.transmissions, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_write_readback() {
        let registry = AddressRegistry::new(DeviceModel::default().with_write_readback(true)).unwrap();
        let device = Device::new(
            Simulator::new(&registry),
            registry,
            DispatchOptions::default(),
        );
        let lp = device.control_loop(1).unwrap();
        let echoed = lp.set_slew_mode(RateMode::Linear).await.unwrap();
        assert_eq!(echoed.value().unwrap(), Value::String("LIN".into()));
        assert_eq!(lp.slew_mode().await.unwrap().value().unwrap(), RateMode::Linear);
    }

    #[tokio::test(start_paused = true)]
    async fn test_device_snapshot_is_split_at_batch_ceiling() {
        let registry = AddressRegistry::default();
        let device = Device::new(Simulator::new(&registry), registry, DispatchOptions::default());
        let snapshot = device.snapshot().await.unwrap();
        assert_eq!(snapshot.len(), device.registry().properties(EntityKind::Device).count());
        assert!(device.stats().await.transmissions > 1);
        assert!(snapshot.contains(&("relay2".to_string(), Value::Bool(false))));
    }

    #[tokio::test(start_paused = true)]
    async fn test_serial_numbers_are_read_once() {
        let sim = Simulator::new(&AddressRegistry::default())
            .with_value(":INST:SN1", "10388796")
            .with_value(":INST:SN7", "42");
        let device = Device::with_defaults(sim);

        let serials = device.serial_numbers().await.unwrap();
        assert_eq!(serials.len(), 7);
        assert_eq!(serials["ui"], 10388796);
        assert_eq!(serials["vfc2"], 42);
        assert_eq!(serials["ctrl1"], 0);
        assert_eq!(device.serial_numbers().await.unwrap(), serials);
        assert_eq!(device.stats().await.transmissions, 1);

        let group = device.begin_group().unwrap();
        assert!(matches!(device.serial_numbers().await, Err(DeviceError::GroupAlreadyActive)));
        group.abort();
    }

    #[tokio::test(start_paused = true)]
    async fn test_relays_and_startup_mode() {
        let mock = MockTransport::new().with_replies(["1", "CONT,1000.0", "1013.25,0", "7.5"]);
        let device = device(&mock);

        device.set_relay(2, true).await.unwrap();
        assert!(device.relay(2).await.unwrap().value().unwrap());
        assert!(matches!(device.relay(4).await, Err(DeviceError::UnknownProperty { .. })));

        let startup = StartupMode {
            mode: Mode::Measure,
            setpoint: 20.0,
        };
        device.set_startup_mode(startup).await.unwrap();
        assert_eq!(
            device.startup_mode().await.unwrap().value().unwrap(),
            StartupMode {
                mode: Mode::Control,
                setpoint: 1000.0
            }
        );

        let limits = device.channel('A').unwrap().pressure_in_limits().await.unwrap();
        assert_eq!(
            limits.value().unwrap(),
            InLimits {
                pressure: 1013.25,
                in_limits: false
            }
        );
        let pos = device.control_loop(1).unwrap().source_pressure_pos().await.unwrap();
        assert_eq!(pos.value().unwrap(), 7.5);

        assert_eq!(
            mock.writes(),
            vec![
                ":OUTP:LOG2 1\n",
                ":OUTP:LOG2?\n",
                ":SYST:SET MEAS,20\n",
                ":SYST:SET?\n",
                "A:PRES:INL?\n",
                "1:COMP1?\n"
            ]
        );
    }

    #[test]
    fn test_error_status_conversion() {
        let status = ErrorStatus::try_from(Value::Array(vec![
            Value::Integer(-113),
            Value::String("Undefined header".into()),
        ]))
        .unwrap();
        assert_eq!(status.code, -113);
        assert!(!status.is_ok());
        assert!(ErrorStatus::try_from(Value::Integer(0)).is_err());
        assert!(RateMode::try_from(Value::String("FAST".into())).is_err());
        assert!(StartupMode::try_from(Value::Array(vec![
            Value::String("IDLE".into()),
            Value::Float(0.0)
        ]))
        .is_err());
        assert!(InLimits::try_from(Value::Float(1.0)).is_err());
    }
}
