//! Peripheral and characteristic identifiers shared by the link layer, the
//! discovery fold and the state machine.

use uuid::Uuid;

/// Platform identifier of a peripheral seen during a scan
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct PeripheralId(String);

impl PeripheralId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for PeripheralId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

/// A live connection. Only the [`LinkManager`](crate::LinkManager) holds one,
/// and it is gone once the link is disconnected.
#[derive(Debug, PartialEq, Eq)]
pub struct PeripheralHandle {
    id: PeripheralId,
}

impl PeripheralHandle {
    pub(crate) fn new(id: PeripheralId) -> Self {
        Self { id }
    }

    pub fn id(&self) -> &PeripheralId {
        &self.id
    }
}

/// Property flags of a characteristic
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Capabilities {
    pub read: bool,
    pub write: bool,
    pub write_without_response: bool,
    pub notify: bool,
    pub indicate: bool,
}

impl Capabilities {
    pub fn can_write(&self) -> bool {
        self.write || self.write_without_response
    }

    /// Value can reach us, either by an explicit read or by a push
    pub fn can_observe(&self) -> bool {
        self.read || self.notify || self.indicate
    }

    pub fn can_push(&self) -> bool {
        self.notify || self.indicate
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CharacteristicRef {
    pub service: Uuid,
    pub characteristic: Uuid,
    pub capabilities: Capabilities,
}

impl std::fmt::Display for CharacteristicRef {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}/{}", self.service, self.characteristic)
    }
}
