use serde::{Deserialize, Serialize};
use std::fmt::{Display, Formatter, Result as FmtResult};

macro_rules! string_id {
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

            pub fn into_inner(self) -> String {
                self.0
            }
        }

        impl Display for $name {
            fn fmt(&self, f: &mut Formatter<'_>) -> FmtResult {
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

        impl AsRef<str> for $name {
            fn as_ref(&self) -> &str {
                &self.0
            }
        }
    };
}

string_id!(
    /// Identifier of a constraint definition (one per protected resource class).
    ConstraintId
);

string_id!(
    /// Partition key within a constraint; capacity applies per unit.
    ResourceUnit
);

string_id!(
    /// Caller-supplied identifier of one admission request.
    ConsumerId
);

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ids_display_their_raw_value() {
        let id = ConsumerId::from("step-42");
        assert_eq!(id.to_string(), "step-42");
        assert_eq!(id.as_str(), "step-42");
    }

    #[test]
    fn ids_serialize_transparently() {
        let unit = ResourceUnit::new("acct/token");
        let json = serde_json::to_string(&unit).unwrap();
        assert_eq!(json, "\"acct/token\"");
        let back: ResourceUnit = serde_json::from_str(&json).unwrap();
        assert_eq!(back, unit);
    }
}
