//! Parser for lzbench-style compression CSV output
//!
//! Expected columns, with or without a header row:
//!
//! ```text
//! Compressor name,Compression speed,Decompression speed,Original size,Compressed size,Ratio,Filename
//! zstd 1.5.5 -1,512.30,1580.12,211938580,73654000,34.75,silesia.tar
//! ```
//!
//! Each data row yields three metrics tagged with the compressor name.

use csv::{ReaderBuilder, StringRecord, Trim};

use super::{require_metrics, Metric, MetricRelativity, MetricsParser};
use crate::error::{ParseError, ParseResult};

const COMPRESSOR: usize = 0;
const COMPRESSION_SPEED: usize = 1;
const DECOMPRESSION_SPEED: usize = 2;
const RATIO: usize = 5;
const FILENAME: usize = 6;
const MIN_FIELDS: usize = 6;

#[derive(Debug, Clone, Copy, Default)]
pub struct CompressionCsvParser;

impl CompressionCsvParser {
    pub const NAME: &'static str = "compression-csv";

    fn is_header(record: &StringRecord) -> bool {
        record
            .get(COMPRESSION_SPEED)
            .map(|field| field.parse::<f64>().is_err())
            .unwrap_or(false)
            && record
                .get(COMPRESSOR)
                .map(|field| field.to_ascii_lowercase().contains("compressor"))
                .unwrap_or(false)
    }

    fn field(record: &StringRecord, index: usize, line: u64) -> ParseResult<f64> {
        let raw = record.get(index).unwrap_or_default();
        raw.parse::<f64>().map_err(|_| ParseError::Schema {
            parser: Self::NAME.to_string(),
            reason: format!("line {}: column {} is not numeric: '{}'", line, index + 1, raw),
        })
    }

    fn row_metrics(record: &StringRecord, line: u64) -> ParseResult<Vec<Metric>> {
        if record.len() < MIN_FIELDS {
            return Err(ParseError::Schema {
                parser: Self::NAME.to_string(),
                reason: format!("line {}: expected at least {} columns, found {}", line, MIN_FIELDS, record.len()),
            });
        }

        let compressor = record.get(COMPRESSOR).unwrap_or_default();
        let compression = Self::field(record, COMPRESSION_SPEED, line)?;
        let decompression = Self::field(record, DECOMPRESSION_SPEED, line)?;
        let ratio = Self::field(record, RATIO, line)?;

        let tag = |metric: Metric| {
            let metric = metric.with_metadata("compressor", compressor);
            match record.get(FILENAME).filter(|name| !name.is_empty()) {
                Some(file) => metric.with_metadata("file", file),
                None => metric,
            }
        };

        Ok(vec![
            tag(Metric::new("Compression Speed", compression, "MB/s", MetricRelativity::HigherIsBetter)
                .with_description("Compression throughput")),
            tag(Metric::new("Decompression Speed", decompression, "MB/s", MetricRelativity::HigherIsBetter)
                .with_description("Decompression throughput")),
            tag(Metric::new("Compression Ratio", ratio, "%", MetricRelativity::LowerIsBetter)
                .with_description("Compressed size as a percentage of the original")),
        ])
    }
}

impl MetricsParser for CompressionCsvParser {
    fn name(&self) -> &'static str {
        Self::NAME
    }

    fn parse(&self, output: &str) -> ParseResult<Vec<Metric>> {
        let mut reader = ReaderBuilder::new()
            .has_headers(false)
            .flexible(true)
            .trim(Trim::All)
            .from_reader(output.as_bytes());

        let mut metrics = Vec::new();
        for (index, record) in reader.records().enumerate() {
            let record = record.map_err(|e| ParseError::Schema {
                parser: Self::NAME.to_string(),
                reason: e.to_string(),
            })?;
            let line = index as u64 + 1;

            if record.iter().all(str::is_empty) || (index == 0 && Self::is_header(&record)) {
                continue;
            }

            metrics.extend(Self::row_metrics(&record, line)?);
        }

        require_metrics(Self::NAME, output, metrics)
    }
}
