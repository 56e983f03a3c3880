//! Core identifier and name types for the bug-finding runtime.
//!
//! These types provide type-safe identities for the entities the scheduler
//! reasons about: machines, event types, state names, and operation groups.
//! All of them are cheap to clone; identity comparisons never look at the
//! human-readable parts.

use core::fmt;
use std::rc::Rc;

// ============================================================================
// MachineId
// ============================================================================

/// A globally unique identity for a machine.
///
/// The numeric value is allocated monotonically by the runtime that created
/// the machine; the type name, friendly name, and partition tag exist for
/// diagnostics and routing. Two ids are equal iff the numeric value matches.
#[derive(Clone)]
pub struct MachineId {
    value: u64,
    type_name: Rc<str>,
    friendly_name: Option<Rc<str>>,
    partition: Rc<str>,
}

impl MachineId {
    /// Creates a machine id (internal use; the runtime allocates the value).
    #[must_use]
    pub(crate) fn new(
        value: u64,
        type_name: &str,
        friendly_name: Option<&str>,
        partition: &str,
    ) -> Self {
        Self {
            value,
            type_name: Rc::from(type_name),
            friendly_name: friendly_name.map(Rc::from),
            partition: Rc::from(partition),
        }
    }

    /// Returns the runtime-scoped numeric value.
    #[must_use]
    pub const fn value(&self) -> u64 {
        self.value
    }

    /// Returns the machine type name.
    #[must_use]
    pub fn type_name(&self) -> &str {
        &self.type_name
    }

    /// Returns the friendly name, if one was supplied at creation.
    #[must_use]
    pub fn friendly_name(&self) -> Option<&str> {
        self.friendly_name.as_deref()
    }

    /// Returns the partition this machine lives in.
    #[must_use]
    pub fn partition(&self) -> &str {
        &self.partition
    }

    /// Creates a machine id for unit tests that do not care about routing.
    #[doc(hidden)]
    #[must_use]
    pub fn new_for_test(value: u64, type_name: &str) -> Self {
        Self::new(value, type_name, None, "local")
    }
}

impl PartialEq for MachineId {
    fn eq(&self, other: &Self) -> bool {
        self.value == other.value
    }
}

impl Eq for MachineId {}

impl PartialOrd for MachineId {
    fn partial_cmp(&self, other: &Self) -> Option<core::cmp::Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for MachineId {
    fn cmp(&self, other: &Self) -> core::cmp::Ordering {
        self.value.cmp(&other.value)
    }
}

impl core::hash::Hash for MachineId {
    fn hash<H: core::hash::Hasher>(&self, state: &mut H) {
        self.value.hash(state);
    }
}

impl fmt::Debug for MachineId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "MachineId({}:{})", self.type_name, self.value)
    }
}

impl fmt::Display for MachineId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.friendly_name {
            Some(name) => write!(f, "{name}({})", self.value),
            None => write!(f, "{}({})", self.type_name, self.value),
        }
    }
}

// ============================================================================
// EventType
// ============================================================================

/// Name of the reserved halt event type.
pub const HALT_EVENT: &str = "halt";

/// The identity of an event type.
///
/// Event types are compared by name; the payload of an event never takes part
/// in handler resolution.
#[derive(Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct EventType(Rc<str>);

impl EventType {
    /// Creates an event type from its name.
    #[must_use]
    pub fn new(name: &str) -> Self {
        Self(Rc::from(name))
    }

    /// Returns the reserved halt event type.
    ///
    /// Dequeuing an unhandled halt event halts the machine gracefully.
    #[must_use]
    pub fn halt() -> Self {
        Self::new(HALT_EVENT)
    }

    /// Returns the event type name.
    #[must_use]
    pub fn name(&self) -> &str {
        &self.0
    }

    /// Returns true if this is the reserved halt event type.
    #[must_use]
    pub fn is_halt(&self) -> bool {
        &*self.0 == HALT_EVENT
    }
}

impl fmt::Debug for EventType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "EventType({})", self.0)
    }
}

impl fmt::Display for EventType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for EventType {
    fn from(name: &str) -> Self {
        Self::new(name)
    }
}

// ============================================================================
// StateName
// ============================================================================

/// The name of a declared state within a machine type.
#[derive(Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct StateName(Rc<str>);

impl StateName {
    /// Creates a state name.
    #[must_use]
    pub fn new(name: &str) -> Self {
        Self(Rc::from(name))
    }

    /// Returns the state name as a string.
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Debug for StateName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "StateName({})", self.0)
    }
}

impl fmt::Display for StateName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for StateName {
    fn from(name: &str) -> Self {
        Self::new(name)
    }
}

// ============================================================================
// OperationGroupId
// ============================================================================

/// Correlation tag propagated from sender to receiver to relate causally
/// linked events.
///
/// Values are drawn from a dedicated deterministic RNG stream so that traces
/// stay reproducible across runs; the display form is uuid-shaped for log
/// familiarity.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
pub struct OperationGroupId(u128);

impl OperationGroupId {
    /// The nil group: no correlation.
    pub const NIL: Self = Self(0);

    /// Creates an operation group id from a raw value.
    #[must_use]
    pub const fn from_raw(value: u128) -> Self {
        Self(value)
    }

    /// Returns the raw value.
    #[must_use]
    pub const fn as_raw(self) -> u128 {
        self.0
    }

    /// Returns true if this is the nil group.
    #[must_use]
    pub const fn is_nil(self) -> bool {
        self.0 == 0
    }
}

impl fmt::Debug for OperationGroupId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "OperationGroupId({self})")
    }
}

impl fmt::Display for OperationGroupId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let v = self.0;
        write!(
            f,
            "{:08x}-{:04x}-{:04x}-{:04x}-{:012x}",
            (v >> 96) as u32,
            (v >> 80) as u16,
            (v >> 64) as u16,
            (v >> 48) as u16,
            v & 0xffff_ffff_ffff
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn machine_id_equality_ignores_names() {
        let a = MachineId::new(7, "Client", Some("alice"), "local");
        let b = MachineId::new(7, "Server", None, "remote");
        assert_eq!(a, b);

        let c = MachineId::new(8, "Client", Some("alice"), "local");
        assert_ne!(a, c);
    }

    #[test]
    fn machine_id_display_prefers_friendly_name() {
        let named = MachineId::new(3, "Client", Some("alice"), "local");
        assert_eq!(named.to_string(), "alice(3)");

        let anon = MachineId::new(3, "Client", None, "local");
        assert_eq!(anon.to_string(), "Client(3)");
    }

    #[test]
    fn halt_event_type_is_reserved() {
        assert!(EventType::halt().is_halt());
        assert!(!EventType::new("Ping").is_halt());
    }

    #[test]
    fn operation_group_display_is_uuid_shaped() {
        let id = OperationGroupId::from_raw(0x0011_2233_4455_6677_8899_aabb_ccdd_eeff);
        assert_eq!(id.to_string(), "00112233-4455-6677-8899-aabbccddeeff");
        assert!(OperationGroupId::NIL.is_nil());
    }
}
