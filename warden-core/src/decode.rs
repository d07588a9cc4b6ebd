// Warden - tenant-aware admission control
// File: warden-core/src/decode.rs

use std::collections::BTreeMap;
use std::io::Read;

use prost::Message;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::remote_write::{WriteRequest, NAME_LABEL};

/// How many sample metrics a parse captures for denial forensics.
pub const SAMPLE_METRIC_LIMIT: usize = 10;

/// Default ceiling on decompressed payload size (64 MiB). Guards against
/// pathological compression ratios; the raw body size is bounded upstream
/// by `max_request_bytes` / `max_body_bytes`.
pub const DEFAULT_MAX_DECOMPRESSED_BYTES: u64 = 64 * 1024 * 1024;

const GZIP_MAGIC: [u8; 2] = [0x1f, 0x8b];
const SNAPPY_FRAME_MAGIC: [u8; 10] = [0xff, 0x06, 0x00, 0x00, 0x73, 0x4e, 0x61, 0x50, 0x70, 0x59];

#[derive(Error, Debug)]
pub enum DecodeError {
    #[error("decompression failed: {0}")]
    Decompress(String),
    #[error("structural parse failed: {0}")]
    Parse(String),
}

impl DecodeError {
    /// Whether the failure happened before any structural inspection.
    pub fn is_decompress(&self) -> bool {
        matches!(self, DecodeError::Decompress(_))
    }
}

/// One captured sample from the payload, kept for denial records and the
/// admin surface.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SampleMetric {
    pub metric_name: String,
    pub labels: BTreeMap<String, String>,
    pub value: f64,
    pub timestamp_ms: i64,
}

/// Structural summary of one remote-write payload.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ParseResult {
    pub samples: u64,
    pub series: u64,
    pub labels: u64,
    /// Largest label set seen on any single series.
    pub max_labels_in_series: u64,
    /// Longest label value seen anywhere in the payload, in bytes.
    pub max_label_value_len: u64,
    pub sample_metrics: Vec<SampleMetric>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum PayloadEncoding {
    Snappy,
    SnappyFramed,
    Gzip,
    Identity,
}

/// Resolves the effective codec from the declared content encoding,
/// sniffing the two recognized magic prefixes when nothing is declared.
fn detect_encoding(declared: Option<&str>, body: &[u8]) -> Result<PayloadEncoding, DecodeError> {
    let declared = declared.map(str::trim).unwrap_or("");
    match declared.to_ascii_lowercase().as_str() {
        "snappy" => {
            if body.starts_with(&SNAPPY_FRAME_MAGIC) {
                Ok(PayloadEncoding::SnappyFramed)
            } else {
                Ok(PayloadEncoding::Snappy)
            }
        }
        "gzip" | "x-gzip" => Ok(PayloadEncoding::Gzip),
        "identity" | "" => {
            if body.starts_with(&GZIP_MAGIC) {
                Ok(PayloadEncoding::Gzip)
            } else if body.starts_with(&SNAPPY_FRAME_MAGIC) {
                Ok(PayloadEncoding::SnappyFramed)
            } else {
                Ok(PayloadEncoding::Identity)
            }
        }
        other => Err(DecodeError::Decompress(format!(
            "unsupported content-encoding {other:?}"
        ))),
    }
}

fn decompress(
    body: &[u8],
    encoding: PayloadEncoding,
    max_decompressed: u64,
) -> Result<Vec<u8>, DecodeError> {
    match encoding {
        PayloadEncoding::Identity => Ok(body.to_vec()),
        PayloadEncoding::Snappy => {
            let len = snap::raw::decompress_len(body)
                .map_err(|e| DecodeError::Decompress(e.to_string()))?;
            if len as u64 > max_decompressed {
                return Err(DecodeError::Decompress(format!(
                    "decompressed size {len} exceeds cap {max_decompressed}"
                )));
            }
            snap::raw::Decoder::new()
                .decompress_vec(body)
                .map_err(|e| DecodeError::Decompress(e.to_string()))
        }
        PayloadEncoding::SnappyFramed => {
            bounded_read(snap::read::FrameDecoder::new(body), max_decompressed)
        }
        PayloadEncoding::Gzip => {
            bounded_read(flate2::read::GzDecoder::new(body), max_decompressed)
        }
    }
}

fn bounded_read<R: Read>(reader: R, max_decompressed: u64) -> Result<Vec<u8>, DecodeError> {
    let mut out = Vec::new();
    let mut limited = reader.take(max_decompressed + 1);
    limited
        .read_to_end(&mut out)
        .map_err(|e| DecodeError::Decompress(e.to_string()))?;
    if out.len() as u64 > max_decompressed {
        return Err(DecodeError::Decompress(format!(
            "decompressed size exceeds cap {max_decompressed}"
        )));
    }
    Ok(out)
}

/// Decompresses and structurally parses a remote-write body, counting
/// samples, series and labels in a single pass over the decoded request.
///
/// The decoder never forges success: decompression and parse failures
/// surface as errors and the caller decides fail-open vs fail-closed.
pub fn parse(
    body: &[u8],
    content_encoding: Option<&str>,
    max_decompressed: u64,
) -> Result<ParseResult, DecodeError> {
    if body.is_empty() {
        return Ok(ParseResult::default());
    }

    let encoding = detect_encoding(content_encoding, body)?;
    let raw = decompress(body, encoding, max_decompressed)?;

    let request =
        WriteRequest::decode(raw.as_slice()).map_err(|e| DecodeError::Parse(e.to_string()))?;

    let mut result = ParseResult::default();
    for series in &request.timeseries {
        result.series += 1;
        result.samples += series.samples.len() as u64;
        result.labels += series.labels.len() as u64;
        result.max_labels_in_series = result.max_labels_in_series.max(series.labels.len() as u64);
        for label in &series.labels {
            result.max_label_value_len =
                result.max_label_value_len.max(label.value.len() as u64);
        }

        if result.sample_metrics.len() < SAMPLE_METRIC_LIMIT {
            if let Some(sample) = series.samples.first() {
                let mut labels = BTreeMap::new();
                let mut metric_name = None;
                for label in &series.labels {
                    if label.name == NAME_LABEL {
                        metric_name = Some(label.value.clone());
                    }
                    labels.insert(label.name.clone(), label.value.clone());
                }
                result.sample_metrics.push(SampleMetric {
                    metric_name: metric_name.unwrap_or_else(|| "__unknown__".to_string()),
                    labels,
                    value: sample.value,
                    timestamp_ms: sample.timestamp,
                });
            }
        }
    }
    Ok(result)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::remote_write::{Label, Sample, TimeSeries};
    use flate2::write::GzEncoder;
    use flate2::Compression;
    use std::io::Write;

    fn series(name: &str, labels: &[(&str, &str)], samples: usize) -> TimeSeries {
        let mut all = vec![Label {
            name: NAME_LABEL.to_string(),
            value: name.to_string(),
        }];
        all.extend(labels.iter().map(|(k, v)| Label {
            name: k.to_string(),
            value: v.to_string(),
        }));
        TimeSeries {
            labels: all,
            samples: (0..samples)
                .map(|i| Sample {
                    value: i as f64,
                    timestamp: 1_700_000_000_000 + i as i64,
                })
                .collect(),
        }
    }

    fn encode(request: &WriteRequest) -> Vec<u8> {
        let mut buf = Vec::new();
        request.encode(&mut buf).unwrap();
        buf
    }

    fn snappy(raw: &[u8]) -> Vec<u8> {
        snap::raw::Encoder::new().compress_vec(raw).unwrap()
    }

    fn gzip(raw: &[u8]) -> Vec<u8> {
        let mut enc = GzEncoder::new(Vec::new(), Compression::default());
        enc.write_all(raw).unwrap();
        enc.finish().unwrap()
    }

    #[test]
    fn empty_body_counts_zero() {
        let result = parse(&[], None, DEFAULT_MAX_DECOMPRESSED_BYTES).unwrap();
        assert_eq!(result, ParseResult::default());
    }

    #[test]
    fn snappy_round_trip_recovers_counts() {
        let request = WriteRequest {
            timeseries: vec![
                series("http_requests_total", &[("job", "edge"), ("code", "200")], 3),
                series("node_load1", &[("instance", "n1")], 2),
            ],
        };
        let body = snappy(&encode(&request));

        let result = parse(&body, Some("snappy"), DEFAULT_MAX_DECOMPRESSED_BYTES).unwrap();
        assert_eq!(result.series, 2);
        assert_eq!(result.samples, 5);
        assert_eq!(result.labels, 3 + 2);
        assert_eq!(result.max_labels_in_series, 3);
        assert_eq!(result.sample_metrics.len(), 2);
        assert_eq!(result.sample_metrics[0].metric_name, "http_requests_total");
        assert_eq!(result.sample_metrics[0].labels["job"], "edge");
        assert_eq!(result.sample_metrics[0].value, 0.0);
    }

    #[test]
    fn gzip_and_sniffed_gzip_both_decode() {
        let request = WriteRequest {
            timeseries: vec![series("up", &[], 1)],
        };
        let body = gzip(&encode(&request));

        for declared in [Some("gzip"), None] {
            let result = parse(&body, declared, DEFAULT_MAX_DECOMPRESSED_BYTES).unwrap();
            assert_eq!(result.series, 1);
            assert_eq!(result.samples, 1);
        }
    }

    #[test]
    fn identity_payload_parses_without_declaration() {
        let request = WriteRequest {
            timeseries: vec![series("up", &[("job", "j")], 4)],
        };
        let body = encode(&request);
        let result = parse(&body, None, DEFAULT_MAX_DECOMPRESSED_BYTES).unwrap();
        assert_eq!(result.samples, 4);
        assert_eq!(result.labels, 2);
    }

    #[test]
    fn corrupt_snappy_is_a_decompress_error() {
        let err = parse(
            b"\x02\x00not snappy at all",
            Some("snappy"),
            DEFAULT_MAX_DECOMPRESSED_BYTES,
        )
        .unwrap_err();
        assert!(err.is_decompress(), "got {err}");
    }

    #[test]
    fn valid_compression_with_garbage_inside_is_a_parse_error() {
        let body = snappy(&[0xffu8; 64]);
        let err = parse(&body, Some("snappy"), DEFAULT_MAX_DECOMPRESSED_BYTES).unwrap_err();
        assert!(matches!(err, DecodeError::Parse(_)), "got {err}");
    }

    #[test]
    fn unknown_declared_encoding_is_rejected() {
        let err = parse(b"abc", Some("zstd"), DEFAULT_MAX_DECOMPRESSED_BYTES).unwrap_err();
        assert!(err.is_decompress());
    }

    #[test]
    fn decompression_cap_is_enforced() {
        let raw = vec![0u8; 4096];
        let body = snappy(&raw);
        let err = parse(&body, Some("snappy"), 1024).unwrap_err();
        assert!(err.is_decompress());

        let gz = gzip(&raw);
        let err = parse(&gz, Some("gzip"), 1024).unwrap_err();
        assert!(err.is_decompress());
    }

    #[test]
    fn sample_metric_capture_stops_at_ten() {
        let request = WriteRequest {
            timeseries: (0..25).map(|i| series(&format!("m{i}"), &[], 1)).collect(),
        };
        let body = snappy(&encode(&request));
        let result = parse(&body, Some("snappy"), DEFAULT_MAX_DECOMPRESSED_BYTES).unwrap();
        assert_eq!(result.series, 25);
        assert_eq!(result.sample_metrics.len(), SAMPLE_METRIC_LIMIT);
        assert_eq!(result.sample_metrics[9].metric_name, "m9");
    }

    #[test]
    fn missing_name_label_reports_unknown() {
        let request = WriteRequest {
            timeseries: vec![TimeSeries {
                labels: vec![Label {
                    name: "job".into(),
                    value: "j".into(),
                }],
                samples: vec![Sample {
                    value: 1.0,
                    timestamp: 1,
                }],
            }],
        };
        let body = snappy(&encode(&request));
        let result = parse(&body, Some("snappy"), DEFAULT_MAX_DECOMPRESSED_BYTES).unwrap();
        assert_eq!(result.sample_metrics[0].metric_name, "__unknown__");
    }

    #[test]
    fn label_value_maximum_is_tracked() {
        let request = WriteRequest {
            timeseries: vec![series("up", &[("path", "/a/very/long/label/value")], 1)],
        };
        let body = snappy(&encode(&request));
        let result = parse(&body, Some("snappy"), DEFAULT_MAX_DECOMPRESSED_BYTES).unwrap();
        assert_eq!(result.max_label_value_len, "/a/very/long/label/value".len() as u64);
    }
}
