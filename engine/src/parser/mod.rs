//! Metrics parser framework
//!
//! A parser turns the captured output of one tool run into a list of
//! [`Metric`]s. Parsers are pure: the same input always yields the same
//! metrics. Non-empty output that yields no metrics is a schema error, never
//! an empty success.

pub mod compression;
pub mod key_value;

use std::collections::BTreeMap;
use std::fmt;

use serde::{Deserialize, Serialize};

use crate::error::{ParseError, ParseResult};

pub use compression::CompressionCsvParser;
pub use key_value::KeyValueParser;

/// Whether larger values of a metric are better
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
pub enum MetricRelativity {
    HigherIsBetter,
    LowerIsBetter,
    #[default]
    Undefined,
}

/// A single named measurement
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Metric {
    pub name: String,
    pub value: f64,
    pub unit: String,
    pub relativity: MetricRelativity,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub metadata: BTreeMap<String, String>,
}

impl Metric {
    pub fn new(name: &str, value: f64, unit: &str, relativity: MetricRelativity) -> Self {
        Self {
            name: name.to_string(),
            value,
            unit: unit.to_string(),
            relativity,
            description: None,
            metadata: BTreeMap::new(),
        }
    }

    pub fn with_description(mut self, description: &str) -> Self {
        self.description = Some(description.to_string());
        self
    }

    pub fn with_metadata(mut self, key: &str, value: &str) -> Self {
        self.metadata.insert(key.to_string(), value.to_string());
        self
    }
}

impl fmt::Display for Metric {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.unit.is_empty() {
            write!(f, "{} = {}", self.name, self.value)
        } else {
            write!(f, "{} = {} {}", self.name, self.value, self.unit)
        }
    }
}

/// Converts one tool's raw output into metrics
pub trait MetricsParser: Send + Sync {
    /// Stable name used to select the parser from a profile
    fn name(&self) -> &'static str;

    /// Parse captured output
    fn parse(&self, output: &str) -> ParseResult<Vec<Metric>>;
}

/// Shared guard for the "empty input" and "nothing recognised" cases
pub(crate) fn require_metrics(parser: &str, output: &str, metrics: Vec<Metric>) -> ParseResult<Vec<Metric>> {
    if output.trim().is_empty() {
        return Err(ParseError::Schema {
            parser: parser.to_string(),
            reason: "output is empty".to_string(),
        });
    }

    if metrics.is_empty() {
        return Err(ParseError::Schema {
            parser: parser.to_string(),
            reason: "no metrics recognised in non-empty output".to_string(),
        });
    }

    Ok(metrics)
}

/// Names accepted by [`parser_for`]
pub const PARSER_NAMES: &[&str] = &[CompressionCsvParser::NAME, KeyValueParser::NAME];

/// Look up a parser by name (case-insensitive)
pub fn parser_for(name: &str) -> ParseResult<Box<dyn MetricsParser>> {
    match name.trim().to_ascii_lowercase().as_str() {
        CompressionCsvParser::NAME => Ok(Box::new(CompressionCsvParser)),
        KeyValueParser::NAME => Ok(Box::new(KeyValueParser)),
        _ => Err(ParseError::UnknownParser { name: name.to_string() }),
    }
}
