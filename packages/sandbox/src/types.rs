// ABOUTME: Core value types shared by the lifecycle backends and the pool manager
// ABOUTME: Slot identifiers, sandbox endpoints and per-sandbox resource budgets

use serde::{Deserialize, Serialize};
use std::fmt;

/// Opaque, immutable identifier of a pool slot
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct SlotId(String);

impl SlotId {
    /// Generate a fresh slot id
    pub fn generate() -> Self {
        Self(format!("slot-{}", uuid::Uuid::new_v4().simple()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for SlotId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for SlotId {
    fn from(value: &str) -> Self {
        Self(value.to_string())
    }
}

impl From<String> for SlotId {
    fn from(value: String) -> Self {
        Self(value)
    }
}

/// Network address (`host:port`) of a live sandbox
pub type Endpoint = String;

/// Resources reserved for a single sandbox, fixed at creation
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResourceSpec {
    /// CPU budget in thousandths of a core
    pub cpu_millicores: u32,
    /// Memory budget in bytes
    pub memory_bytes: u64,
}

impl ResourceSpec {
    pub fn new(cpu_millicores: u32, memory_mb: u64) -> Self {
        Self {
            cpu_millicores,
            memory_bytes: memory_mb.saturating_mul(1024 * 1024),
        }
    }

    pub fn memory_mb(&self) -> u64 {
        self.memory_bytes / (1024 * 1024)
    }
}

impl Default for ResourceSpec {
    fn default() -> Self {
        Self::new(4000, 8000)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_generated_slot_ids_are_unique() {
        let a = SlotId::generate();
        let b = SlotId::generate();
        assert_ne!(a, b);
        assert!(a.as_str().starts_with("slot-"));
    }

    #[test]
    fn test_resource_spec_memory_conversion() {
        let spec = ResourceSpec::new(6000, 12000);
        assert_eq!(spec.memory_bytes, 12000 * 1024 * 1024);
        assert_eq!(spec.memory_mb(), 12000);
    }

    #[test]
    fn test_slot_id_serializes_as_plain_string() {
        let id = SlotId::from("slot-abc");
        assert_eq!(serde_json::to_string(&id).unwrap(), "\"slot-abc\"");
    }
}
