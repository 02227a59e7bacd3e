//! Opaque identifiers for units, routes, steps, resources and materials.
//!
//! Every id is a string newtype so they cannot be mixed up at call sites.
//! Ordering is derived only so queue sets iterate deterministically; it
//! carries no domain meaning.

use serde::{Deserialize, Serialize};
use std::fmt;
use uuid::Uuid;

macro_rules! opaque_id {
    ($(#[$meta:meta])* $name:ident) => {
        $(#[$meta])*
        #[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
        #[serde(transparent)]
        pub struct $name(String);

        impl $name {
            pub fn new(value: impl Into<String>) -> Self {
                Self(value.into())
            }

            pub fn as_str(&self) -> &str {
                &self.0
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str(&self.0)
            }
        }

        impl From<&str> for $name {
            fn from(value: &str) -> Self {
                Self(value.to_string())
            }
        }

        impl From<String> for $name {
            fn from(value: String) -> Self {
                Self(value)
            }
        }
    };
}

opaque_id!(
    /// A physical unit of work-in-process.
    WipId
);
opaque_id!(RouteId);
opaque_id!(
    /// A node of the route graph.
    RouteStepId
);
opaque_id!(ResourceId);
opaque_id!(MaterialId);

impl WipId {
    /// Mint a fresh unit id for a newly released unit.
    pub fn generate() -> Self {
        Self(Uuid::new_v4().to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_ids_compare_by_value() {
        assert_eq!(RouteStepId::from("S10"), RouteStepId::new("S10".to_string()));
        assert_ne!(MaterialId::from("M-1"), MaterialId::from("M-2"));
    }

    #[test]
    fn test_generated_wip_ids_are_unique() {
        assert_ne!(WipId::generate(), WipId::generate());
    }

    #[test]
    fn test_ids_serialize_transparently() {
        let json = serde_json::to_string(&ResourceId::from("press-4")).unwrap();
        assert_eq!(json, "\"press-4\"");
    }
}
