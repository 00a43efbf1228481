//! Decoding of scamper JSONL payloads into typed traces.
//!
//! A payload is a metadata line followed by a cycle-start record, one or
//! more measurement records (tracelb for mda, trace for regular), and a
//! cycle-stop record. Anything else is a parse error; a measurement
//! record that parses but yields no usable hops is an extract error.

use std::collections::BTreeSet;

use serde::Deserialize;
use thiserror::Error;

use crate::scamper::Metadata;

/// Errors from decoding a trace payload.
#[derive(Debug, Error)]
pub enum ParseError {
    #[error("invalid traceroute type: {0}")]
    InvalidTraceType(String),

    #[error("trace payload is not UTF-8: {0}")]
    NotUtf8(#[source] std::str::Utf8Error),

    #[error("empty trace payload")]
    Empty,

    #[error("line {line}: invalid {expected} record: {source}")]
    InvalidRecord {
        line: usize,
        expected: &'static str,
        #[source]
        source: serde_json::Error,
    },

    #[error("line {line}: expected {expected} record, got {got:?}")]
    UnexpectedRecord {
        line: usize,
        expected: &'static str,
        got: String,
    },

    #[error("truncated trace payload: missing {missing} record")]
    Truncated { missing: &'static str },
}

/// Errors from extracting hops out of a parsed trace.
#[derive(Debug, Error)]
pub enum ExtractError {
    #[error("node {index} has an empty address")]
    EmptyNodeAddress { index: usize },

    #[error("trace contains no hops")]
    NoHops,
}

/// Session marker record (cycle-start / cycle-stop).
#[derive(Debug, Clone, Deserialize)]
pub struct CycleRecord {
    #[serde(rename = "type")]
    pub kind: String,
    #[serde(default)]
    pub list_name: String,
    #[serde(default)]
    pub id: u64,
    #[serde(default)]
    pub hostname: String,
    #[serde(default)]
    pub start_time: i64,
    #[serde(default)]
    pub stop_time: i64,
}

/// Multipath (tracelb) measurement record.
#[derive(Debug, Clone, Deserialize)]
pub struct Tracelb {
    #[serde(default)]
    pub src: String,
    #[serde(default)]
    pub dst: String,
    #[serde(default)]
    pub probec: u64,
    #[serde(default)]
    pub nodec: u64,
    #[serde(default)]
    pub linkc: u64,
    #[serde(default)]
    pub nodes: Vec<TracelbNode>,
}

/// One node observed by tracelb, with its outgoing links.
#[derive(Debug, Clone, Deserialize)]
pub struct TracelbNode {
    #[serde(default)]
    pub addr: String,
    #[serde(default)]
    pub links: Vec<Vec<TracelbLink>>,
}

/// A link between two tracelb nodes; `addr` is the far end.
#[derive(Debug, Clone, Deserialize)]
pub struct TracelbLink {
    #[serde(default)]
    pub addr: String,
}

/// Classic (regular) traceroute measurement record.
#[derive(Debug, Clone, Deserialize)]
pub struct RouteTrace {
    #[serde(default)]
    pub src: String,
    #[serde(default)]
    pub dst: String,
    #[serde(default)]
    pub hop_count: u64,
    #[serde(default)]
    pub hops: Vec<RouteHop>,
}

/// One responding hop in a regular traceroute.
#[derive(Debug, Clone, Deserialize)]
pub struct RouteHop {
    #[serde(default)]
    pub addr: String,
    #[serde(default)]
    pub probe_ttl: u64,
}

/// A measurement record of either flavor.
#[derive(Debug, Clone)]
pub enum TraceResult {
    Tracelb(Tracelb),
    Route(RouteTrace),
}

/// Fully decoded trace payload.
#[derive(Debug, Clone)]
pub struct Trace {
    pub metadata: Metadata,
    pub cycle_start: CycleRecord,
    pub results: Vec<TraceResult>,
    pub cycle_stop: CycleRecord,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum TraceType {
    Mda,
    Regular,
}

impl TraceType {
    fn result_record(self) -> &'static str {
        match self {
            TraceType::Mda => "tracelb",
            TraceType::Regular => "trace",
        }
    }
}

/// Parser for one configured traceroute flavor.
#[derive(Debug, Clone, Copy)]
pub struct TraceParser {
    trace_type: TraceType,
}

/// Minimal view of a record used to dispatch on its type tag.
#[derive(Deserialize)]
struct RecordTag {
    #[serde(rename = "type", default)]
    kind: String,
}

impl TraceParser {
    /// Build a parser for "mda" or "regular" payloads; anything else is
    /// rejected.
    pub fn new(trace_type: &str) -> Result<Self, ParseError> {
        let trace_type = match trace_type {
            "mda" => TraceType::Mda,
            "regular" => TraceType::Regular,
            other => return Err(ParseError::InvalidTraceType(other.to_string())),
        };

        Ok(Self { trace_type })
    }

    /// Decode a full payload into a [`Trace`].
    pub fn parse(&self, payload: &[u8]) -> Result<Trace, ParseError> {
        let text = std::str::from_utf8(payload).map_err(ParseError::NotUtf8)?;

        // Line numbers are 1-based and count non-empty lines only;
        // scamper never emits blank lines but cached payloads may end
        // with one.
        let mut lines = text
            .lines()
            .map(str::trim)
            .enumerate()
            .filter(|(_, l)| !l.is_empty())
            .map(|(i, l)| (i + 1, l));

        let (line, meta_line) = lines.next().ok_or(ParseError::Empty)?;
        let metadata: Metadata =
            serde_json::from_str(meta_line).map_err(|source| ParseError::InvalidRecord {
                line,
                expected: "metadata",
                source,
            })?;

        let (line, start_line) = lines.next().ok_or(ParseError::Truncated {
            missing: "cycle-start",
        })?;
        let cycle_start = decode_typed::<CycleRecord>(line, start_line, "cycle-start")?;

        let result_kind = self.trace_type.result_record();
        let mut results = Vec::new();
        let cycle_stop = loop {
            let (line, record) = lines.next().ok_or(ParseError::Truncated {
                missing: "cycle-stop",
            })?;

            let tag: RecordTag =
                serde_json::from_str(record).map_err(|source| ParseError::InvalidRecord {
                    line,
                    expected: result_kind,
                    source,
                })?;

            if tag.kind == "cycle-stop" {
                if results.is_empty() {
                    return Err(ParseError::Truncated {
                        missing: result_kind,
                    });
                }
                break decode_typed::<CycleRecord>(line, record, "cycle-stop")?;
            }

            if tag.kind != result_kind {
                return Err(ParseError::UnexpectedRecord {
                    line,
                    expected: result_kind,
                    got: tag.kind,
                });
            }

            results.push(match self.trace_type {
                TraceType::Mda => {
                    TraceResult::Tracelb(decode_typed::<Tracelb>(line, record, "tracelb")?)
                }
                TraceType::Regular => {
                    TraceResult::Route(decode_typed::<RouteTrace>(line, record, "trace")?)
                }
            });
        };

        if let Some((line, extra)) = lines.next() {
            let tag: RecordTag = serde_json::from_str(extra).unwrap_or(RecordTag {
                kind: String::new(),
            });
            return Err(ParseError::UnexpectedRecord {
                line,
                expected: "end of payload",
                got: tag.kind,
            });
        }

        Ok(Trace {
            metadata,
            cycle_start,
            results,
            cycle_stop,
        })
    }

    /// Return the sorted, deduplicated set of hop addresses referenced
    /// by the trace's measurement records.
    pub fn extract_hops(&self, trace: &Trace) -> Result<Vec<String>, ExtractError> {
        let mut hops = BTreeSet::new();

        for result in &trace.results {
            match result {
                TraceResult::Tracelb(tracelb) => {
                    for (index, node) in tracelb.nodes.iter().enumerate() {
                        if node.addr.is_empty() {
                            return Err(ExtractError::EmptyNodeAddress { index });
                        }
                        hops.insert(node.addr.clone());

                        for link in node.links.iter().flatten() {
                            if !link.addr.is_empty() {
                                hops.insert(link.addr.clone());
                            }
                        }
                    }
                }
                TraceResult::Route(route) => {
                    for hop in &route.hops {
                        if !hop.addr.is_empty() {
                            hops.insert(hop.addr.clone());
                        }
                    }
                }
            }
        }

        if hops.is_empty() {
            return Err(ExtractError::NoHops);
        }

        Ok(hops.into_iter().collect())
    }
}

fn decode_typed<T: serde::de::DeserializeOwned>(
    line: usize,
    record: &str,
    expected: &'static str,
) -> Result<T, ParseError> {
    let tag: RecordTag =
        serde_json::from_str(record).map_err(|source| ParseError::InvalidRecord {
            line,
            expected,
            source,
        })?;

    if tag.kind != expected {
        return Err(ParseError::UnexpectedRecord {
            line,
            expected,
            got: tag.kind,
        });
    }

    serde_json::from_str(record).map_err(|source| ParseError::InvalidRecord {
        line,
        expected,
        source,
    })
}
