//! Typed ID definitions for fleet resources.

use crate::define_id;

// =============================================================================
// Membership
// =============================================================================

define_id!(ControllerId, "ctl", "controller");
define_id!(NodeId, "node", "executor node");
define_id!(LeaseId, "lease", "membership lease");

// =============================================================================
// Instances
// =============================================================================

define_id!(InstanceId, "inst", "service instance");
define_id!(BootId, "boot", "container activation");
define_id!(RequestId, "req", "provision request");

// =============================================================================
// Events
// =============================================================================

/// Lifecycle event ID: a notifier-local monotonic counter, not ULID-based.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct EventId(u64);

impl EventId {
    /// Creates a new EventId from a u64.
    #[must_use]
    pub const fn new(id: u64) -> Self {
        Self(id)
    }

    /// Returns the underlying value.
    #[must_use]
    pub const fn value(&self) -> u64 {
        self.0
    }
}

impl std::fmt::Display for EventId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<u64> for EventId {
    fn from(id: u64) -> Self {
        Self(id)
    }
}

impl serde::Serialize for EventId {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: serde::Serializer,
    {
        serializer.serialize_u64(self.0)
    }
}

impl<'de> serde::Deserialize<'de> for EventId {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: serde::Deserializer<'de>,
    {
        let id = u64::deserialize(deserializer)?;
        Ok(Self(id))
    }
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn test_node_id_roundtrip() {
        let id = NodeId::new();
        let s = id.to_string();
        let parsed: NodeId = s.parse().unwrap();
        assert_eq!(id, parsed);
        assert!(s.starts_with("node_"));
    }

    #[test]
    fn test_lease_id_rejects_node_prefix() {
        let node = NodeId::new().to_string();
        let err = node.parse::<LeaseId>().unwrap_err();
        assert!(err.is_wrong_kind());
        assert_eq!(err.kind(), "membership lease");
        assert!(err.to_string().starts_with("expected a membership lease id (lease_...)"));
    }

    #[test]
    fn test_missing_separator() {
        let result: Result<InstanceId, _> = "inst01HV4Z2WQXKJNM8GPQY6VBKC3D".parse();
        assert_eq!(
            result.unwrap_err(),
            crate::IdError::MissingSeparator {
                kind: "service instance"
            }
        );
    }

    #[test]
    fn test_empty() {
        let result: Result<InstanceId, _> = "".parse();
        assert_eq!(
            result.unwrap_err(),
            crate::IdError::Empty {
                kind: "service instance"
            }
        );
    }

    #[test]
    fn test_invalid_ulid() {
        let result: Result<ControllerId, _> = "ctl_invalid".parse();
        assert!(matches!(
            result.unwrap_err(),
            crate::IdError::InvalidUlid { kind: "controller", .. }
        ));
    }

    #[test]
    fn test_json_roundtrip() {
        let id = InstanceId::new();
        let json = serde_json::to_string(&id).unwrap();
        assert_eq!(json, format!("\"{id}\""));
        let parsed: InstanceId = serde_json::from_str(&json).unwrap();
        assert_eq!(id, parsed);
    }

    #[test]
    fn test_short_label() {
        let id = NodeId::new();
        let short = id.short();
        assert!(short.starts_with("node_"));
        assert_eq!(short.len(), "node_".len() + 8);
        assert!(id.to_string().ends_with(&short["node_".len()..]));
    }

    #[test]
    fn test_instance_id_sortable() {
        let id1 = InstanceId::new();
        std::thread::sleep(std::time::Duration::from_millis(2));
        let id2 = InstanceId::new();
        assert!(id1 < id2);
    }

    #[test]
    fn test_event_id_roundtrip() {
        let id = EventId::new(12345);
        let json = serde_json::to_string(&id).unwrap();
        let parsed: EventId = serde_json::from_str(&json).unwrap();
        assert_eq!(id, parsed);
    }

    #[test]
    fn test_all_id_prefixes_unique() {
        let prefixes = [
            ControllerId::PREFIX,
            NodeId::PREFIX,
            LeaseId::PREFIX,
            InstanceId::PREFIX,
            BootId::PREFIX,
            RequestId::PREFIX,
        ];

        let unique: std::collections::HashSet<_> = prefixes.iter().collect();
        assert_eq!(prefixes.len(), unique.len(), "Duplicate ID prefixes found!");
    }

    proptest! {
        #[test]
        fn prop_parse_display_roundtrip(millis in 0u64..(1u64 << 48), random in any::<u128>()) {
            let ulid = crate::Ulid::from_parts(millis, random);
            let id = NodeId::from_ulid(ulid);
            let parsed = NodeId::parse(&id.to_string()).unwrap();
            prop_assert_eq!(id, parsed);
        }
    }
}
