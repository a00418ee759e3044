use std::fmt;

use error_stack::Report;
use serde::Deserialize;
use serde::Serialize;

use super::ConfigError;

/// Domain prepended to resource names given without one.
pub const DEFAULT_RESOURCE_DOMAIN: &str = "nvidia.com";

const MAX_RESOURCE_NAME_LEN: usize = 63;

/// Fully qualified name of a schedulable resource, e.g. `nvidia.com/gpu`.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct ResourceName(String);

impl ResourceName {
    /// Parse a resource name, prefixing [`DEFAULT_RESOURCE_DOMAIN`] when `name`
    /// carries no domain.
    ///
    /// # Errors
    ///
    /// - [`ConfigError::InvalidResourceName`] if the name part is empty, longer
    ///   than 63 characters, or not made of alphanumerics, `-`, `_` and `.`
    ///   with alphanumerics at both ends
    pub fn new(name: &str) -> Result<Self, Report<ConfigError>> {
        let invalid = || {
            Report::new(ConfigError::InvalidResourceName {
                name: name.to_string(),
            })
        };

        let (domain, short) = match name.split_once('/') {
            Some((domain, short)) => (domain, short),
            None => (DEFAULT_RESOURCE_DOMAIN, name),
        };

        if domain.is_empty() || short.contains('/') || !is_valid_name_part(short) {
            return Err(invalid());
        }

        Ok(Self(format!("{domain}/{short}")))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

fn is_valid_name_part(name: &str) -> bool {
    let alnum = |c: char| c.is_ascii_alphanumeric();
    !name.is_empty()
        && name.len() <= MAX_RESOURCE_NAME_LEN
        && name.starts_with(alnum)
        && name.ends_with(alnum)
        && name
            .chars()
            .all(|c| alnum(c) || c == '-' || c == '_' || c == '.')
}

impl Default for ResourceName {
    /// `nvidia.com/gpu`
    fn default() -> Self {
        Self(format!("{DEFAULT_RESOURCE_DOMAIN}/gpu"))
    }
}

impl fmt::Display for ResourceName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl TryFrom<String> for ResourceName {
    type Error = Report<ConfigError>;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        Self::new(&value)
    }
}

impl From<ResourceName> for String {
    fn from(value: ResourceName) -> Self {
        value.0
    }
}

/// Pairs a glob pattern with the resource name matching devices are exposed as.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Resource {
    /// Glob matched against a GPU product name or a MIG profile string
    pub pattern: String,
    pub name: ResourceName,
}

impl Resource {
    /// # Errors
    ///
    /// - [`ConfigError::InvalidPattern`] if `pattern` is not a valid glob
    /// - [`ConfigError::InvalidResourceName`] if `name` is not a valid resource name
    pub fn new(pattern: &str, name: &str) -> Result<Self, Report<ConfigError>> {
        validate_pattern(pattern)?;
        Ok(Self {
            pattern: pattern.to_string(),
            name: ResourceName::new(name)?,
        })
    }

    pub fn matches(&self, value: &str) -> bool {
        glob::Pattern::new(&self.pattern)
            .map(|pattern| pattern.matches(value))
            .unwrap_or(false)
    }
}

pub(crate) fn validate_pattern(pattern: &str) -> Result<(), Report<ConfigError>> {
    glob::Pattern::new(pattern).map_err(|e| {
        Report::new(ConfigError::InvalidPattern {
            pattern: pattern.to_string(),
        })
        .attach_printable(e.to_string())
    })?;
    Ok(())
}

/// Resource matching rules for whole GPUs and MIG devices.
///
/// Rules are evaluated in insertion order and the first match wins.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Resources {
    #[serde(default)]
    pub gpus: Vec<Resource>,
    #[serde(default)]
    pub mig: Vec<Resource>,
}

impl Resources {
    pub fn add_gpu_resource(&mut self, pattern: &str, name: &str) -> Result<(), Report<ConfigError>> {
        self.gpus.push(Resource::new(pattern, name)?);
        Ok(())
    }

    pub fn add_mig_resource(&mut self, pattern: &str, name: &str) -> Result<(), Report<ConfigError>> {
        self.mig.push(Resource::new(pattern, name)?);
        Ok(())
    }

    /// First GPU rule matching `product_name`.
    pub fn match_gpu(&self, product_name: &str) -> Option<&Resource> {
        self.gpus.iter().find(|r| r.matches(product_name))
    }

    /// First MIG rule matching `profile`.
    pub fn match_mig(&self, profile: &str) -> Option<&Resource> {
        self.mig.iter().find(|r| r.matches(profile))
    }

    pub(crate) fn validate(&self) -> Result<(), Report<ConfigError>> {
        self.gpus
            .iter()
            .chain(&self.mig)
            .try_for_each(|r| validate_pattern(&r.pattern))
    }
}
