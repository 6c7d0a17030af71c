use std::collections::HashMap;
use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

use crate::error::{Error, ErrorKind};

/// Unique identifier for managers
pub type Id = Uuid;

/// Generic metadata container
pub type Metadata = HashMap<String, Value>;

/// Separator between application id and instance name on the wire
pub const INSTANCE_SEPARATOR: &str = "__";

/// Identity of one managed component instance, `<applicationId>__<instanceName>` on the wire.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct ServiceInstanceId {
    pub application_id: String,
    pub instance_name: String,
}

impl ServiceInstanceId {
    pub fn new(application_id: impl Into<String>, instance_name: impl Into<String>) -> Self {
        Self {
            application_id: application_id.into(),
            instance_name: instance_name.into(),
        }
    }
}

impl fmt::Display for ServiceInstanceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}{}{}",
            self.application_id, INSTANCE_SEPARATOR, self.instance_name
        )
    }
}

impl FromStr for ServiceInstanceId {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.split_once(INSTANCE_SEPARATOR) {
            Some((app, name)) if !app.is_empty() && !name.is_empty() => Ok(Self::new(app, name)),
            _ => Err(Error::new(
                ErrorKind::Application,
                format!("Malformed service instance identifier: {}", s),
            )),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_instance_id_round_trips_through_display() {
        let id = ServiceInstanceId::new("App1", "comp1");
        assert_eq!(id.to_string(), "App1__comp1");
        assert_eq!("App1__comp1".parse::<ServiceInstanceId>().unwrap(), id);
    }

    #[test]
    fn test_instance_id_splits_on_first_separator() {
        let id: ServiceInstanceId = "App1__comp__2".parse().unwrap();
        assert_eq!(id.application_id, "App1");
        assert_eq!(id.instance_name, "comp__2");
    }

    #[test]
    fn test_malformed_instance_id() {
        assert!("App1".parse::<ServiceInstanceId>().is_err());
        assert!("__comp1".parse::<ServiceInstanceId>().is_err());
    }
}
