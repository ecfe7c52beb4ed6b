//! Connection metrics: labeled request/response counters.
//!
//! Counters are monotonically increasing and safe to bump from every
//! connection task concurrently. The label sets mirror what the dispatch
//! loop knows: requests are keyed by opcode and command, responses add the
//! offending argument and the outcome.

use std::collections::HashMap;

use dashmap::DashMap;

/// Label key for a request counter.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct RequestLabels {
    /// Rendered opcode, e.g. `OP_MSG`.
    pub op_code: String,
    /// Command name, or `unknown`.
    pub command: String,
}

/// Label key for a response counter.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct ResponseLabels {
    /// Rendered opcode of the response.
    pub op_code: String,
    /// Command name, or `unknown`.
    pub command: String,
    /// Offending argument, or `unknown`.
    pub argument: String,
    /// Outcome: `ok`, an error code name, `write-error`, `panic`,
    /// `unhandled`, or `unexpected`.
    pub result: String,
}

/// Shared counters for every connection of one listener.
#[derive(Debug, Default)]
pub struct ConnMetrics {
    requests: DashMap<RequestLabels, u64>,
    responses: DashMap<ResponseLabels, u64>,
}

impl ConnMetrics {
    /// Fresh counters, all zero.
    pub fn new() -> Self {
        Self::default()
    }

    /// Count one processed request.
    pub fn inc_request(&self, op_code: &str, command: &str) {
        *self
            .requests
            .entry(RequestLabels {
                op_code: op_code.to_owned(),
                command: command.to_owned(),
            })
            .or_insert(0) += 1;
    }

    /// Count one produced response.
    pub fn inc_response(&self, op_code: &str, command: &str, argument: &str, result: &str) {
        *self
            .responses
            .entry(ResponseLabels {
                op_code: op_code.to_owned(),
                command: command.to_owned(),
                argument: argument.to_owned(),
                result: result.to_owned(),
            })
            .or_insert(0) += 1;
    }

    /// Snapshot of the request counters.
    pub fn requests(&self) -> HashMap<RequestLabels, u64> {
        self.requests
            .iter()
            .map(|e| (e.key().clone(), *e.value()))
            .collect()
    }

    /// Snapshot of the response counters.
    pub fn responses(&self) -> HashMap<ResponseLabels, u64> {
        self.responses
            .iter()
            .map(|e| (e.key().clone(), *e.value()))
            .collect()
    }
}
