//! Generic `name: value [unit]` / `name=value [unit]` parser
//!
//! Lines that do not carry a numeric value are ignored. A trailing `(+)` or
//! `(-)` marker on the name sets the relativity.

use regex::Regex;

use super::{require_metrics, Metric, MetricRelativity, MetricsParser};
use crate::error::{ParseError, ParseResult};

#[derive(Debug, Clone, Copy, Default)]
pub struct KeyValueParser;

impl KeyValueParser {
    pub const NAME: &'static str = "key-value";

    fn line_pattern() -> ParseResult<Regex> {
        Regex::new(r"^\s*(?P<name>[^:=]+?)\s*(?P<marker>\([+-]\))?\s*[:=]\s*(?P<value>[-+]?\d+(?:\.\d+)?(?:[eE][-+]?\d+)?)\s*(?P<unit>\S*)\s*$")
            .map_err(|e| ParseError::Schema { parser: Self::NAME.to_string(), reason: e.to_string() })
    }
}

impl MetricsParser for KeyValueParser {
    fn name(&self) -> &'static str {
        Self::NAME
    }

    fn parse(&self, output: &str) -> ParseResult<Vec<Metric>> {
        let pattern = Self::line_pattern()?;

        let metrics = output
            .lines()
            .filter_map(|line| pattern.captures(line))
            .filter_map(|captures| {
                let value = captures.name("value")?.as_str().parse::<f64>().ok()?;
                let relativity = match captures.name("marker").map(|m| m.as_str()) {
                    Some("(+)") => MetricRelativity::HigherIsBetter,
                    Some("(-)") => MetricRelativity::LowerIsBetter,
                    _ => MetricRelativity::Undefined,
                };
                let unit = captures.name("unit").map(|m| m.as_str()).unwrap_or_default();
                Some(Metric::new(captures.name("name")?.as_str(), value, unit, relativity))
            })
            .collect();

        require_metrics(Self::NAME, output, metrics)
    }
}
