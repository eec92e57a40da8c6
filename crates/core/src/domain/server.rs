use serde::{Deserialize, Deserializer, Serialize, Serializer};
use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

use crate::error::CoreError;

/// Target node a phase runs against.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Server {
    pub advertise_ip: String,
    pub hostname: String,
    #[serde(default)]
    pub role: String,
}

impl Server {
    pub fn new(advertise_ip: impl Into<String>, hostname: impl Into<String>) -> Self {
        Self {
            advertise_ip: advertise_ip.into(),
            hostname: hostname.into(),
            role: String::new(),
        }
    }

    pub fn with_role(mut self, role: impl Into<String>) -> Self {
        self.role = role.into();
        self
    }
}

impl fmt::Display for Server {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.hostname, self.advertise_ip)
    }
}

/// Package locator in `repository/name:version` form.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Locator {
    pub repository: String,
    pub name: String,
    pub version: String,
}

impl Locator {
    pub fn new(
        repository: impl Into<String>,
        name: impl Into<String>,
        version: impl Into<String>,
    ) -> Self {
        Self {
            repository: repository.into(),
            name: name.into(),
            version: version.into(),
        }
    }
}

impl fmt::Display for Locator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}:{}", self.repository, self.name, self.version)
    }
}

impl FromStr for Locator {
    type Err = CoreError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let invalid = || CoreError::InvalidLocator(s.to_string());

        let (repository, rest) = s.split_once('/').ok_or_else(invalid)?;
        let (name, version) = rest.rsplit_once(':').ok_or_else(invalid)?;
        if repository.is_empty() || name.is_empty() || version.is_empty() {
            return Err(invalid());
        }

        Ok(Self::new(repository, name, version))
    }
}

impl Serialize for Locator {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

impl<'de> Deserialize<'de> for Locator {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let raw = String::deserialize(deserializer)?;
        raw.parse().map_err(serde::de::Error::custom)
    }
}

/// Renders labels as `key=value` pairs joined by commas, sorted by key.
pub fn format_labels(labels: &BTreeMap<String, String>) -> String {
    labels
        .iter()
        .map(|(key, value)| format!("{}={}", key, value))
        .collect::<Vec<_>>()
        .join(",")
}
