use std::fmt::{Display, Formatter};
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use ulid::Ulid;

use crate::EngineError;

macro_rules! define_id {
    ($name:ident, $label:literal) => {
        #[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq, Ord, PartialOrd, Hash)]
        pub struct $name(pub Ulid);

        impl $name {
            #[must_use]
            pub fn new() -> Self {
                Self(Ulid::new())
            }

            /// Parses a ULID string into a typed identifier.
            ///
            /// # Errors
            /// Returns [`EngineError::Validation`] when `raw` is not a ULID.
            pub fn parse(raw: &str) -> Result<Self, EngineError> {
                Ulid::from_string(raw.trim()).map(Self).map_err(|_| {
                    EngineError::Validation(format!(concat!("invalid ", $label, ": {}"), raw))
                })
            }
        }

        impl Default for $name {
            fn default() -> Self {
                Self::new()
            }
        }

        impl Display for $name {
            fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
                write!(f, "{}", self.0)
            }
        }

        impl FromStr for $name {
            type Err = EngineError;

            fn from_str(raw: &str) -> Result<Self, Self::Err> {
                Self::parse(raw)
            }
        }
    };
}

define_id!(UserId, "user id");
define_id!(AppId, "app id");
define_id!(RecordId, "record id");
define_id!(DepartmentId, "department id");
define_id!(JobTitleId, "job title id");
define_id!(NotificationId, "notification id");
define_id!(EventId, "event id");

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ids_serialize_as_plain_ulid_strings() {
        let raw = "01J0SQQP7M70P6Y3R4T8D8G8M2";
        let id = match UserId::parse(raw) {
            Ok(value) => value,
            Err(err) => panic!("fixture id: {err}"),
        };
        let encoded = match serde_json::to_value(id) {
            Ok(value) => value,
            Err(err) => panic!("encode: {err}"),
        };
        assert_eq!(encoded, serde_json::json!(raw));
        assert_eq!(id.to_string(), raw);
    }

    #[test]
    fn parse_reports_which_id_was_invalid() {
        let err = match AppId::parse("not-a-ulid") {
            Ok(value) => panic!("unexpected id {value}"),
            Err(err) => err,
        };
        assert_eq!(
            err,
            EngineError::Validation("invalid app id: not-a-ulid".to_string())
        );
    }
}
