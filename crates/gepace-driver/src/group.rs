/*!
 * Grouped mode bookkeeping.
 *
 * While a group is open every command issued through the dispatcher becomes a
 * [`PendingCommand`] whose reply lands in a shared slot once the group
 * resolves. Callers hold a [`Placeholder`] on that slot.
 */
use std::ops::{Index, Range};
use std::sync::{Arc, OnceLock};

use gepace_core::types::Value;

use crate::codec::Command;
use crate::error::{DeviceError, Result};

#[derive(Debug)]
enum SlotState {
    Resolved(Value),
    Failed,
}

#[derive(Debug)]
struct Slot {
    command: String,
    state: OnceLock<SlotState>,
}

/// Handle on the reply of a queued command
///
/// Reading it before its group resolved, or after the group failed, is an
/// [`DeviceError::Unresolved`] error, never a default value.
#[derive(Debug, Clone)]
pub struct Placeholder(Arc<Slot>);

impl Placeholder {
    fn new(command: &str) -> Self {
        Self(Arc::new(Slot {
            command: command.to_string(),
            state: OnceLock::new(),
        }))
    }

    /// The queued command text
    pub fn command(&self) -> &str {
        &self.0.command
    }

    /// Whether the group resolved successfully
    pub fn is_resolved(&self) -> bool {
        matches!(self.0.state.get(), Some(SlotState::Resolved(_)))
    }

    /// Whether the group failed or was abandoned
    pub fn is_failed(&self) -> bool {
        matches!(self.0.state.get(), Some(SlotState::Failed))
    }

    /// The decoded reply
    pub fn value(&self) -> Result<Value> {
        match self.0.state.get() {
            Some(SlotState::Resolved(value)) => Ok(value.clone()),
            _ => Err(DeviceError::Unresolved {
                command: self.0.command.clone(),
            }),
        }
    }

    fn fulfill(&self, value: Value) {
        let _ = self.0.state.set(SlotState::Resolved(value));
    }

    fn fail(&self) {
        let _ = self.0.state.set(SlotState::Failed);
    }
}

/// A command captured while grouping
#[derive(Debug)]
pub(crate) struct PendingCommand {
    pub(crate) command: Command,
    pub(crate) placeholder: Placeholder,
}

/// Commands accumulated by one open group
#[derive(Debug)]
pub(crate) struct GroupState {
    pub(crate) id: u64,
    pub(crate) pending: Vec<PendingCommand>,
}

impl GroupState {
    pub(crate) fn new(id: u64) -> Self {
        Self {
            id,
            pending: Vec::new(),
        }
    }

    pub(crate) fn enqueue(&mut self, command: Command) -> Placeholder {
        let placeholder = Placeholder::new(&command.text);
        self.pending.push(PendingCommand {
            command,
            placeholder: placeholder.clone(),
        });
        placeholder
    }

    /// Number of reply lines the whole group expects
    pub(crate) fn expected_replies(&self) -> usize {
        self.pending.iter().filter(|p| p.command.expects_reply).count()
    }

    /// Split the queue into transmissions no longer than `max_len` bytes
    ///
    /// A single command longer than the limit still gets its own batch.
    pub(crate) fn batches(&self, join: &str, max_len: Option<usize>) -> Vec<Range<usize>> {
        let Some(max_len) = max_len else {
            return if self.pending.is_empty() {
                Vec::new()
            } else {
                vec![0..self.pending.len()]
            };
        };

        let mut batches = Vec::new();
        let mut start = 0;
        let mut len = 0;
        for (i, p) in self.pending.iter().enumerate() {
            let extra = if i == start { p.command.text.len() } else { join.len() + p.command.text.len() };
            if i > start && len + extra > max_len {
                batches.push(start..i);
                start = i;
                len = p.command.text.len();
            } else {
                len += extra;
            }
        }
        if start < self.pending.len() {
            batches.push(start..self.pending.len());
        }
        batches
    }

    pub(crate) fn resolve(self, values: &[Value]) {
        for (p, value) in self.pending.iter().zip(values) {
            p.placeholder.fulfill(value.clone());
        }
    }

    pub(crate) fn fail(self) {
        for p in &self.pending {
            p.placeholder.fail();
        }
    }
}

/// Decoded replies of a resolved group, in enqueue order
///
/// Commands that expect no reply contribute [`Value::Null`].
#[derive(Debug, Clone, Default, PartialEq)]
pub struct GroupReplies(Vec<Value>);

impl GroupReplies {
    pub(crate) fn new(values: Vec<Value>) -> Self {
        Self(values)
    }

    /// Number of replies
    pub fn len(&self) -> usize {
        self.0.len()
    }

    /// Whether the group was empty
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// Reply of the i-th queued command
    pub fn get(&self, index: usize) -> Option<&Value> {
        self.0.get(index)
    }

    /// Iterate the replies
    pub fn iter(&self) -> std::slice::Iter<'_, Value> {
        self.0.iter()
    }

    /// The replies as a vector
    pub fn into_vec(self) -> Vec<Value> {
        self.0
    }
}

impl Index<usize> for GroupReplies {
    type Output = Value;

    fn index(&self, index: usize) -> &Value {
        &self.0[index]
    }
}

impl IntoIterator for GroupReplies {
    type Item = Value;
    type IntoIter = std::vec::IntoIter<Value>;

    fn into_iter(self) -> Self::IntoIter {
        self.0.into_iter()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn state(commands: &[&str]) -> GroupState {
        let mut state = GroupState::new(1);
        for text in commands {
            state.enqueue(Command::raw(text, true));
        }
        state
    }

    #[test]
    fn test_placeholder_lifecycle() {
        let mut group = GroupState::new(1);
        let a = group.enqueue(Command::raw("*IDN?", true));
        let b = group.enqueue(Command::raw(":OUTP:STAT 1", true));
        assert!(matches!(a.value(), Err(DeviceError::Unresolved { ref command }) if command == "*IDN?"));
        assert_eq!(group.expected_replies(), 1);

        group.resolve(&[Value::String("GE".into()), Value::Null]);
        assert!(a.is_resolved());
        assert_eq!(a.value().unwrap(), Value::String("GE".into()));
        assert_eq!(b.value().unwrap(), Value::Null);
    }

    #[test]
    fn test_failed_group_leaves_placeholders_unresolved() {
        let mut group = GroupState::new(1);
        let a = group.enqueue(Command::raw("A:TEMP?", true));
        group.fail();
        assert!(a.is_failed());
        assert!(a.value().is_err());
    }

    #[test]
    fn test_unbounded_batches() {
        assert!(state(&[]).batches(";", None).is_empty());
        assert_eq!(state(&["A?", "B?", "C?"]).batches(";", None), vec![0..3]);
    }

    #[test]
    fn test_bounded_batches() {
        // "AAAA?;BBBB?" is 11 bytes, a third command would exceed 12
        let group = state(&["AAAA?", "BBBB?", "CCCC?"]);
        assert_eq!(group.batches(";", Some(12)), vec![0..2, 2..3]);
        assert_eq!(group.batches(";", Some(4)), vec![0..1, 1..2, 2..3]);
        assert_eq!(group.batches(";", Some(100)), vec![0..3]);
    }
}
