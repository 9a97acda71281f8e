//! The `define_id!` macro behind every ULID-backed fleet id.

/// Defines a ULID-backed id newtype.
///
/// `$prefix` is the wire prefix and `$kind` names what the id identifies;
/// it appears in docs and parse errors. The generated type is `Copy`,
/// sorts by creation time, serializes as `{prefix}_{ulid}` and refuses
/// ids of other kinds.
///
/// ```ignore
/// define_id!(LeaseId, "lease", "lease");
///
/// let lease = LeaseId::new();
/// assert_eq!(lease, lease.to_string().parse()?);
/// ```
#[macro_export]
macro_rules! define_id {
    ($name:ident, $prefix:literal, $kind:literal) => {
        #[doc = concat!("Identifies a ", $kind, ". Rendered as `", $prefix, "_{ulid}`.")]
        #[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
        pub struct $name($crate::Ulid);

        impl $name {
            pub const PREFIX: &'static str = $prefix;
            pub const KIND: &'static str = $kind;

            #[must_use]
            pub fn new() -> Self {
                Self($crate::Ulid::new())
            }

            #[must_use]
            pub const fn from_ulid(ulid: $crate::Ulid) -> Self {
                Self(ulid)
            }

            #[must_use]
            pub const fn ulid(&self) -> $crate::Ulid {
                self.0
            }

            /// Prefix plus the last eight ULID characters, for log lines
            /// where the full id is noise.
            #[must_use]
            pub fn short(&self) -> String {
                let ulid = self.0.to_string();
                format!("{}_{}", Self::PREFIX, &ulid[ulid.len() - 8..])
            }

            pub fn parse(s: &str) -> Result<Self, $crate::IdError> {
                let kind = Self::KIND;
                let Some((prefix, ulid)) = s.split_once('_') else {
                    return Err(if s.is_empty() {
                        $crate::IdError::Empty { kind }
                    } else {
                        $crate::IdError::MissingSeparator { kind }
                    });
                };
                if prefix != Self::PREFIX {
                    return Err($crate::IdError::WrongKind {
                        kind,
                        expected: Self::PREFIX,
                        found: prefix.to_string(),
                    });
                }
                ulid.parse::<$crate::Ulid>()
                    .map(Self)
                    .map_err(|e| $crate::IdError::InvalidUlid {
                        kind,
                        reason: e.to_string(),
                    })
            }
        }

        impl Default for $name {
            fn default() -> Self {
                Self::new()
            }
        }

        impl std::fmt::Display for $name {
            fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
                write!(f, "{}_{}", Self::PREFIX, self.0)
            }
        }

        impl std::str::FromStr for $name {
            type Err = $crate::IdError;

            fn from_str(s: &str) -> Result<Self, Self::Err> {
                Self::parse(s)
            }
        }

        impl serde::Serialize for $name {
            fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
                serializer.collect_str(self)
            }
        }

        impl<'de> serde::Deserialize<'de> for $name {
            fn deserialize<D: serde::Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
                let raw = String::deserialize(deserializer)?;
                Self::parse(&raw).map_err(serde::de::Error::custom)
            }
        }
    };
}
