// Registered service instances and the derived application view

use crate::error::{Error, Result};
use crate::hlc::HlcTimestamp;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::time::Duration;

/// Longest lease a client may ask for.
pub const MAX_LEASE_DURATION: Duration = Duration::from_secs(3600);

/// Identity of an instance: unique by (service, instance id).
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct InstanceKey {
    pub service: String,
    pub instance_id: String,
}

impl InstanceKey {
    pub fn new(service: impl Into<String>, instance_id: impl Into<String>) -> Self {
        Self {
            service: service.into(),
            instance_id: instance_id.into(),
        }
    }

    /// Reject names that could not round-trip through a URL path segment.
    pub fn validate(&self) -> Result<()> {
        validate_name("service name", &self.service)?;
        validate_name("instance id", &self.instance_id)
    }
}

impl std::fmt::Display for InstanceKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}/{}", self.service, self.instance_id)
    }
}

fn validate_name(what: &str, value: &str) -> Result<()> {
    if value.is_empty() {
        return Err(Error::validation(format!("{what} must not be empty")));
    }
    if let Some(bad) = value
        .chars()
        .find(|c| !(c.is_ascii_alphanumeric() || matches!(c, '.' | '_' | '-')))
    {
        return Err(Error::validation(format!(
            "{what} {value:?} contains invalid character {bad:?}"
        )));
    }
    Ok(())
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum InstanceStatus {
    #[default]
    Up,
    Down,
    Starting,
    OutOfService,
    Unknown,
}

impl InstanceStatus {
    pub const ALL: [InstanceStatus; 5] = [
        InstanceStatus::Up,
        InstanceStatus::Down,
        InstanceStatus::Starting,
        InstanceStatus::OutOfService,
        InstanceStatus::Unknown,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            InstanceStatus::Up => "UP",
            InstanceStatus::Down => "DOWN",
            InstanceStatus::Starting => "STARTING",
            InstanceStatus::OutOfService => "OUT_OF_SERVICE",
            InstanceStatus::Unknown => "UNKNOWN",
        }
    }
}

impl std::fmt::Display for InstanceStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for InstanceStatus {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        let upper = s.trim().to_ascii_uppercase();
        Self::ALL
            .into_iter()
            .find(|status| status.as_str() == upper)
            .ok_or_else(|| Error::validation(format!("unknown instance status {s:?}")))
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct InstanceAddress {
    pub host: String,
    pub port: u16,
}

impl std::fmt::Display for InstanceAddress {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}:{}", self.host, self.port)
    }
}

/// A registered service instance
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Instance {
    pub instance_id: String,
    pub service_name: String,
    pub address: InstanceAddress,
    pub status: InstanceStatus,
    #[serde(default)]
    pub metadata: BTreeMap<String, String>,
    /// Wall time (ms) of the last successful renewal
    pub last_renewal_timestamp: u64,
    /// Wall time (ms) the instance first registered
    pub registration_timestamp: u64,
    pub lease_duration_secs: u64,
    /// Version of the registration data, compared for last-writer-wins
    #[serde(default)]
    pub last_dirty: HlcTimestamp,
}

impl Instance {
    pub fn new(
        service_name: impl Into<String>,
        instance_id: impl Into<String>,
        host: impl Into<String>,
        port: u16,
    ) -> Self {
        Self {
            instance_id: instance_id.into(),
            service_name: service_name.into(),
            address: InstanceAddress {
                host: host.into(),
                port,
            },
            status: InstanceStatus::Up,
            metadata: BTreeMap::new(),
            last_renewal_timestamp: 0,
            registration_timestamp: 0,
            lease_duration_secs: 0,
            last_dirty: HlcTimestamp::zero(),
        }
    }

    pub fn with_lease_duration(mut self, lease: Duration) -> Self {
        self.lease_duration_secs = lease.as_secs();
        self
    }

    pub fn with_status(mut self, status: InstanceStatus) -> Self {
        self.status = status;
        self
    }

    pub fn with_metadata(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.metadata.insert(key.into(), value.into());
        self
    }

    pub fn key(&self) -> InstanceKey {
        InstanceKey::new(self.service_name.clone(), self.instance_id.clone())
    }

    pub fn lease_duration(&self) -> Duration {
        Duration::from_secs(self.lease_duration_secs)
    }

    /// Payload checks applied at the API boundary, before the store sees it.
    pub fn validate(&self) -> Result<()> {
        self.key().validate()?;
        if self.address.host.trim().is_empty() {
            return Err(Error::validation("host must not be empty"));
        }
        if self.address.port == 0 {
            return Err(Error::validation("port must not be zero"));
        }
        if self.lease_duration_secs == 0 || self.lease_duration() > MAX_LEASE_DURATION {
            return Err(Error::validation(format!(
                "lease duration must be within 1..={}s, got {}s",
                MAX_LEASE_DURATION.as_secs(),
                self.lease_duration_secs
            )));
        }
        Ok(())
    }
}

/// All instances sharing a service name. Derived from a snapshot, never stored.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Application {
    pub name: String,
    pub instances: Vec<Instance>,
}

impl Application {
    /// Group instances by service name, ordered by name then instance id.
    pub fn group(instances: &[Instance]) -> Vec<Application> {
        let mut by_name: BTreeMap<&str, Vec<Instance>> = BTreeMap::new();
        for instance in instances {
            by_name
                .entry(instance.service_name.as_str())
                .or_default()
                .push(instance.clone());
        }

        by_name
            .into_iter()
            .map(|(name, mut instances)| {
                instances.sort_by(|a, b| a.instance_id.cmp(&b.instance_id));
                Application {
                    name: name.to_string(),
                    instances,
                }
            })
            .collect()
    }

    pub fn up_instances(&self) -> impl Iterator<Item = &Instance> {
        self.instances
            .iter()
            .filter(|i| i.status == InstanceStatus::Up)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn instance() -> Instance {
        Instance::new("billing", "billing-1", "10.0.0.7", 8080)
            .with_lease_duration(Duration::from_secs(30))
    }

    #[test]
    fn test_status_parsing_is_case_insensitive() {
        assert_eq!("up".parse::<InstanceStatus>().unwrap(), InstanceStatus::Up);
        assert_eq!(
            "Out_Of_Service".parse::<InstanceStatus>().unwrap(),
            InstanceStatus::OutOfService
        );
        assert!("SLEEPING".parse::<InstanceStatus>().is_err());
    }

    #[test]
    fn test_status_serializes_screaming_case() {
        let json = serde_json::to_string(&InstanceStatus::OutOfService).unwrap();
        assert_eq!(json, "\"OUT_OF_SERVICE\"");
    }

    #[test]
    fn test_valid_instance_passes() {
        assert!(instance().validate().is_ok());
    }

    #[test]
    fn test_validation_rejects_bad_payloads() {
        let mut bad_port = instance();
        bad_port.address.port = 0;
        assert!(matches!(bad_port.validate(), Err(Error::Validation(_))));

        let mut no_host = instance();
        no_host.address.host = "  ".into();
        assert!(no_host.validate().is_err());

        let zero_lease = instance().with_lease_duration(Duration::ZERO);
        assert!(zero_lease.validate().is_err());

        let huge_lease = instance().with_lease_duration(MAX_LEASE_DURATION + Duration::from_secs(1));
        assert!(huge_lease.validate().is_err());

        let slashed = Instance::new("bill/ing", "1", "h", 1)
            .with_lease_duration(Duration::from_secs(30));
        assert!(slashed.validate().is_err());
    }

    #[test]
    fn test_group_by_service() {
        let instances = vec![
            Instance::new("orders", "o-2", "h", 1),
            Instance::new("billing", "b-1", "h", 1),
            Instance::new("orders", "o-1", "h", 1).with_status(InstanceStatus::Down),
        ];

        let apps = Application::group(&instances);
        assert_eq!(apps.len(), 2);
        assert_eq!(apps[0].name, "billing");
        assert_eq!(apps[1].name, "orders");
        assert_eq!(apps[1].instances[0].instance_id, "o-1");
        assert_eq!(apps[1].up_instances().count(), 1);
    }
}
