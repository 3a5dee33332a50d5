//! Execution profiles
//!
//! A profile declares the dependencies, actions and monitors of a run. Profiles
//! are JSON documents in the PascalCase layout used by existing profile files:
//!
//! ```json
//! {
//!   "Description": "Compression benchmark",
//!   "Parameters": { "Threads": 4 },
//!   "Actions": [
//!     { "Type": "WorkloadExecutor", "Parameters": { "Scenario": "lzbench", "Threads": "$.Parameters.Threads" } }
//!   ]
//! }
//! ```
//!
//! Loading resolves `$.Parameters.<Name>` references ("inlining") against the
//! profile-level parameters. Anything left unresolved is reported later by
//! component validation.

use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::path::Path;
use std::str::FromStr;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::error::{ConfigError, ConfigResult};

/// Prefix of a profile parameter reference
pub const REFERENCE_PREFIX: &str = "$.";
const PARAMETER_REFERENCE_PREFIX: &str = "$.parameters.";

/// A typed parameter or metadata value
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum ParameterValue {
    Bool(bool),
    Integer(i64),
    Float(f64),
    String(String),
}

impl ParameterValue {
    pub fn as_str(&self) -> Option<&str> {
        match self {
            ParameterValue::String(value) => Some(value),
            _ => None,
        }
    }

    fn is_unresolved_reference(&self) -> bool {
        self.as_str()
            .map(|value| value.trim_start().starts_with(REFERENCE_PREFIX))
            .unwrap_or(false)
    }

    /// Best-effort conversion of a command-line override into a typed value
    pub fn parse_loose(raw: &str) -> Self {
        if let Ok(value) = raw.parse::<bool>() {
            ParameterValue::Bool(value)
        } else if let Ok(value) = raw.parse::<i64>() {
            ParameterValue::Integer(value)
        } else if let Ok(value) = raw.parse::<f64>() {
            ParameterValue::Float(value)
        } else {
            ParameterValue::String(raw.to_string())
        }
    }
}

impl fmt::Display for ParameterValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ParameterValue::Bool(value) => write!(f, "{}", value),
            ParameterValue::Integer(value) => write!(f, "{}", value),
            ParameterValue::Float(value) => write!(f, "{}", value),
            ParameterValue::String(value) => f.write_str(value),
        }
    }
}

impl From<&str> for ParameterValue {
    fn from(value: &str) -> Self {
        ParameterValue::String(value.to_string())
    }
}

impl From<String> for ParameterValue {
    fn from(value: String) -> Self {
        ParameterValue::String(value)
    }
}

impl From<i64> for ParameterValue {
    fn from(value: i64) -> Self {
        ParameterValue::Integer(value)
    }
}

impl From<bool> for ParameterValue {
    fn from(value: bool) -> Self {
        ParameterValue::Bool(value)
    }
}

impl From<f64> for ParameterValue {
    fn from(value: f64) -> Self {
        ParameterValue::Float(value)
    }
}

/// Named parameters with case-insensitive lookup
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Parameters(BTreeMap<String, ParameterValue>);

impl Parameters {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with(mut self, name: &str, value: impl Into<ParameterValue>) -> Self {
        self.insert(name, value);
        self
    }

    /// Inserts or replaces a value, keeping the existing key's casing
    pub fn insert(&mut self, name: &str, value: impl Into<ParameterValue>) {
        let key = self.key_for(name).unwrap_or_else(|| name.to_string());
        self.0.insert(key, value.into());
    }

    fn key_for(&self, name: &str) -> Option<String> {
        self.0.keys().find(|key| key.eq_ignore_ascii_case(name)).cloned()
    }

    pub fn get(&self, name: &str) -> Option<&ParameterValue> {
        self.0
            .get(name)
            .or_else(|| self.0.iter().find(|(key, _)| key.eq_ignore_ascii_case(name)).map(|(_, v)| v))
    }

    pub fn contains(&self, name: &str) -> bool {
        self.get(name).is_some()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&String, &ParameterValue)> {
        self.0.iter()
    }

    pub fn iter_mut(&mut self) -> impl Iterator<Item = (&String, &mut ParameterValue)> {
        self.0.iter_mut()
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn get_string(&self, name: &str) -> ConfigResult<String> {
        match self.get(name) {
            Some(value) => {
                let value = value.to_string();
                if value.trim().is_empty() {
                    Err(ConfigError::MissingParameter { name: name.to_string() })
                } else {
                    Ok(value)
                }
            }
            None => Err(ConfigError::MissingParameter { name: name.to_string() }),
        }
    }

    pub fn get_string_or(&self, name: &str, default: &str) -> String {
        self.get(name).map(|value| value.to_string()).unwrap_or_else(|| default.to_string())
    }

    pub fn get_optional_string(&self, name: &str) -> Option<String> {
        self.get(name)
            .map(|value| value.to_string())
            .filter(|value| !value.trim().is_empty())
    }

    pub fn get_i64(&self, name: &str) -> ConfigResult<i64> {
        match self.get(name) {
            Some(ParameterValue::Integer(value)) => Ok(*value),
            Some(ParameterValue::Float(value)) if value.fract() == 0.0 => Ok(*value as i64),
            Some(other) => other.to_string().trim().parse().map_err(|_| ConfigError::InvalidValue {
                field: name.to_string(),
                value: other.to_string(),
            }),
            None => Err(ConfigError::MissingParameter { name: name.to_string() }),
        }
    }

    pub fn get_u64_or(&self, name: &str, default: u64) -> ConfigResult<u64> {
        if !self.contains(name) {
            return Ok(default);
        }
        let value = self.get_i64(name)?;
        u64::try_from(value).map_err(|_| ConfigError::InvalidValue {
            field: name.to_string(),
            value: value.to_string(),
        })
    }

    pub fn get_bool_or(&self, name: &str, default: bool) -> ConfigResult<bool> {
        match self.get(name) {
            Some(ParameterValue::Bool(value)) => Ok(*value),
            Some(other) => other.to_string().trim().to_lowercase().parse().map_err(|_| {
                ConfigError::InvalidValue { field: name.to_string(), value: other.to_string() }
            }),
            None => Ok(default),
        }
    }

    /// Parses an enum-typed parameter, rejecting values that are not a defined member
    pub fn get_enum<T: FromStr>(&self, name: &str) -> ConfigResult<T> {
        let raw = self.get_string(name)?;
        raw.parse().map_err(|_| ConfigError::InvalidValue { field: name.to_string(), value: raw })
    }

    pub fn get_enum_or<T: FromStr>(&self, name: &str, default: T) -> ConfigResult<T> {
        if self.contains(name) {
            self.get_enum(name)
        } else {
            Ok(default)
        }
    }

    pub fn get_duration(&self, name: &str) -> ConfigResult<Duration> {
        match self.get(name) {
            Some(ParameterValue::Integer(secs)) if *secs >= 0 => Ok(Duration::from_secs(*secs as u64)),
            Some(other) => parse_timespan(&other.to_string()).map_err(|_| ConfigError::InvalidValue {
                field: name.to_string(),
                value: other.to_string(),
            }),
            None => Err(ConfigError::MissingParameter { name: name.to_string() }),
        }
    }

    pub fn get_duration_or(&self, name: &str, default: Duration) -> ConfigResult<Duration> {
        if self.contains(name) {
            self.get_duration(name)
        } else {
            Ok(default)
        }
    }

    /// Parameters whose value is still a `$.` reference after inlining
    pub fn unresolved_references(&self) -> Vec<(String, String)> {
        self.0
            .iter()
            .filter(|(_, value)| value.is_unresolved_reference())
            .map(|(name, value)| (name.clone(), value.to_string()))
            .collect()
    }
}

impl<const N: usize> From<[(&str, ParameterValue); N]> for Parameters {
    fn from(entries: [(&str, ParameterValue); N]) -> Self {
        let mut parameters = Parameters::new();
        for (name, value) in entries {
            parameters.insert(name, value);
        }
        parameters
    }
}

/// One dependency, action or monitor declaration
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct ProfileElement {
    /// Component type identifier resolved through the registry
    #[serde(rename = "Type")]
    pub component_type: String,

    #[serde(default)]
    pub parameters: Parameters,

    #[serde(default)]
    pub metadata: Parameters,
}

impl ProfileElement {
    pub fn new(component_type: &str) -> Self {
        Self {
            component_type: component_type.to_string(),
            ..Default::default()
        }
    }

    pub fn with_parameter(mut self, name: &str, value: impl Into<ParameterValue>) -> Self {
        self.parameters.insert(name, value);
        self
    }

    pub fn scenario(&self) -> Option<String> {
        self.parameters.get_optional_string("Scenario")
    }

    /// Display name used in logs and reports
    pub fn display_name(&self) -> String {
        match self.scenario() {
            Some(scenario) => format!("{} ({})", self.component_type, scenario),
            None => self.component_type.clone(),
        }
    }
}

/// A loaded, already-inlined profile
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct ExecutionProfile {
    #[serde(default)]
    pub description: Option<String>,

    #[serde(default)]
    pub parameters: Parameters,

    #[serde(default)]
    pub metadata: Parameters,

    /// Minimum time between iteration starts (`hh:mm:ss`)
    #[serde(default)]
    pub minimum_execution_interval: Option<String>,

    #[serde(default)]
    pub dependencies: Vec<ProfileElement>,

    #[serde(default)]
    pub actions: Vec<ProfileElement>,

    #[serde(default)]
    pub monitors: Vec<ProfileElement>,
}

impl ExecutionProfile {
    /// Load and inline a profile from a JSON file
    pub fn from_file<P: AsRef<Path>>(path: P) -> ConfigResult<Self> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path)
            .map_err(|_| ConfigError::FileNotFound { path: path.to_string_lossy().to_string() })?;
        Self::from_json(&content)
    }

    /// Parse and inline a profile from JSON text
    pub fn from_json(content: &str) -> ConfigResult<Self> {
        let mut profile: ExecutionProfile = serde_json::from_str(content)
            .map_err(|e| ConfigError::ParseError { reason: e.to_string() })?;
        profile.inline();
        Ok(profile)
    }

    /// Override profile-level parameters, then re-run inlining
    pub fn apply_overrides(&mut self, overrides: &HashMap<String, ParameterValue>) {
        for (name, value) in overrides {
            self.parameters.insert(name, value.clone());
        }
        self.inline();
    }

    /// Replace `$.Parameters.<Name>` values with the matching profile parameter
    pub fn inline(&mut self) {
        let source = self.parameters.clone();
        let elements = self
            .dependencies
            .iter_mut()
            .chain(self.actions.iter_mut())
            .chain(self.monitors.iter_mut());

        for element in elements {
            for (name, value) in element.parameters.iter_mut() {
                let Some(raw) = value.as_str() else { continue };
                let Some(reference) = parameter_reference(raw) else { continue };
                if let Some(resolved) = source.get(reference) {
                    debug!(parameter = %name, reference = %reference, "Inlined profile parameter");
                    *value = resolved.clone();
                }
            }
        }
    }

    pub fn minimum_interval(&self) -> ConfigResult<Option<Duration>> {
        self.minimum_execution_interval
            .as_deref()
            .map(parse_timespan)
            .transpose()
    }

    pub fn is_empty(&self) -> bool {
        self.dependencies.is_empty() && self.actions.is_empty() && self.monitors.is_empty()
    }
}

/// The `<Name>` of a `$.Parameters.<Name>` value, matched case-insensitively
fn parameter_reference(raw: &str) -> Option<&str> {
    let trimmed = raw.trim();
    let prefix = trimmed.get(..PARAMETER_REFERENCE_PREFIX.len())?;
    if !prefix.eq_ignore_ascii_case(PARAMETER_REFERENCE_PREFIX) {
        return None;
    }
    trimmed.get(PARAMETER_REFERENCE_PREFIX.len()..).filter(|name| !name.is_empty())
}

/// Parse a duration written as seconds (`90`), with a unit (`90s`, `5m`, `2h`),
/// as `hh:mm:ss` or as `d.hh:mm:ss`
pub fn parse_timespan(raw: &str) -> ConfigResult<Duration> {
    let value = raw.trim();
    let invalid = || ConfigError::InvalidValue { field: "timespan".to_string(), value: raw.to_string() };

    if let Ok(secs) = value.parse::<u64>() {
        return Ok(Duration::from_secs(secs));
    }

    if !value.contains(':') {
        let (number, multiplier) = match value.chars().last() {
            Some('s') if value.ends_with("ms") => {
                let millis: u64 = value[..value.len() - 2].parse().map_err(|_| invalid())?;
                return Ok(Duration::from_millis(millis));
            }
            Some('s') => (&value[..value.len() - 1], 1),
            Some('m') => (&value[..value.len() - 1], 60),
            Some('h') => (&value[..value.len() - 1], 3600),
            Some('d') => (&value[..value.len() - 1], 86_400),
            _ => return Err(invalid()),
        };
        let number: u64 = number.parse().map_err(|_| invalid())?;
        return Ok(Duration::from_secs(number * multiplier));
    }

    let (days, clock) = match value.split_once('.') {
        Some((days, rest)) if rest.contains(':') && !days.contains(':') => {
            (days.parse::<u64>().map_err(|_| invalid())?, rest)
        }
        _ => (0, value),
    };

    let parts: Vec<&str> = clock.split(':').collect();
    if parts.len() != 3 {
        return Err(invalid());
    }

    let hours: u64 = parts[0].parse().map_err(|_| invalid())?;
    let minutes: u64 = parts[1].parse().map_err(|_| invalid())?;
    let seconds: f64 = parts[2].parse().map_err(|_| invalid())?;
    if minutes >= 60 || !(0.0..60.0).contains(&seconds) {
        return Err(invalid());
    }

    let whole = days * 86_400 + hours * 3600 + minutes * 60;
    Ok(Duration::from_secs(whole) + Duration::from_secs_f64(seconds))
}

#[cfg(test)]
mod tests {
    use super::*;

    const PROFILE: &str = r#"{
        "Description": "Client/server example",
        "MinimumExecutionInterval": "00:01:00",
        "Parameters": { "Port": 9092, "ServerInstances": 3 },
        "Dependencies": [
            { "Type": "RequirePackage", "Parameters": { "PackageName": "kafka" } }
        ],
        "Actions": [
            {
                "Type": "ServerWorkload",
                "Parameters": {
                    "Scenario": "Broker",
                    "Port": "$.Parameters.Port",
                    "ServerInstances": "$.Parameters.ServerInstances",
                    "Missing": "$.Parameters.NotDefined"
                }
            }
        ]
    }"#;

    #[test]
    fn test_profile_parsing_and_inlining() {
        let profile = ExecutionProfile::from_json(PROFILE).unwrap();
        assert_eq!(profile.dependencies.len(), 1);
        assert_eq!(profile.actions.len(), 1);
        assert!(profile.monitors.is_empty());

        let action = &profile.actions[0];
        assert_eq!(action.parameters.get("Port"), Some(&ParameterValue::Integer(9092)));
        assert_eq!(action.parameters.get_i64("serverinstances").unwrap(), 3);
        assert_eq!(action.scenario().as_deref(), Some("Broker"));

        let unresolved = action.parameters.unresolved_references();
        assert_eq!(unresolved, vec![("Missing".to_string(), "$.Parameters.NotDefined".to_string())]);
        assert_eq!(profile.minimum_interval().unwrap(), Some(Duration::from_secs(60)));
    }

    #[test]
    fn test_non_ascii_values_are_left_alone() {
        let profile = ExecutionProfile::from_json(
            r#"{
                "Parameters": { "Port": 9092 },
                "Actions": [
                    {
                        "Type": "ExecuteCommand",
                        "Parameters": {
                            "Label": "Описание теста",
                            "Note": "$.ПараметрыПорт",
                            "Port": "$.PARAMETERS.Port"
                        }
                    }
                ]
            }"#,
        )
        .unwrap();

        let parameters = &profile.actions[0].parameters;
        assert_eq!(parameters.get_string("Label").unwrap(), "Описание теста");
        assert_eq!(parameters.get_i64("Port").unwrap(), 9092);
        assert_eq!(parameter_reference("Описание теста"), None);
        assert_eq!(parameter_reference("$.Parameters."), None);
        assert_eq!(parameter_reference(" $.parameters.Port "), Some("Port"));
    }

    #[test]
    fn test_overrides_reinline() {
        let mut profile = ExecutionProfile::from_json(PROFILE).unwrap();
        // Already-inlined values are no longer references, so overrides apply to fresh
        // references only
        let mut overrides = HashMap::new();
        overrides.insert("NotDefined".to_string(), ParameterValue::parse_loose("42"));
        profile.apply_overrides(&overrides);

        let action = &profile.actions[0];
        assert_eq!(action.parameters.get("Missing"), Some(&ParameterValue::Integer(42)));
        assert!(action.parameters.unresolved_references().is_empty());
    }

    #[test]
    fn test_typed_getters() {
        let parameters = Parameters::new()
            .with("Enabled", "TRUE")
            .with("Timeout", "00:00:30")
            .with("Count", "7")
            .with("Empty", "");

        assert!(parameters.get_bool_or("Enabled", false).unwrap());
        assert_eq!(parameters.get_duration("Timeout").unwrap(), Duration::from_secs(30));
        assert_eq!(parameters.get_u64_or("Count", 1).unwrap(), 7);
        assert_eq!(parameters.get_u64_or("Absent", 1).unwrap(), 1);
        assert!(matches!(parameters.get_string("Empty"), Err(ConfigError::MissingParameter { .. })));
        assert!(parameters.get_i64("Enabled").is_err());
    }

    #[test]
    fn test_parse_timespan_formats() {
        assert_eq!(parse_timespan("90").unwrap(), Duration::from_secs(90));
        assert_eq!(parse_timespan("90s").unwrap(), Duration::from_secs(90));
        assert_eq!(parse_timespan("250ms").unwrap(), Duration::from_millis(250));
        assert_eq!(parse_timespan("5m").unwrap(), Duration::from_secs(300));
        assert_eq!(parse_timespan("2h").unwrap(), Duration::from_secs(7200));
        assert_eq!(parse_timespan("01:30:00").unwrap(), Duration::from_secs(5400));
        assert_eq!(parse_timespan("1.00:00:10").unwrap(), Duration::from_secs(86_410));
        assert!(parse_timespan("00:61:00").is_err());
        assert!(parse_timespan("soon").is_err());
    }
}
