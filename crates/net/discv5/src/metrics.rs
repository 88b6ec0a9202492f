//! Counters tracked by the discovery service.

use metrics::{counter, gauge, Counter, Gauge};

/// Metrics of a running discovery service.
#[derive(Clone)]
pub(crate) struct Discv5Metrics {
    /// Inbound datagrams that failed to decode, dropped silently.
    pub(crate) decode_failures: Counter,
    /// Total sessions established, both directions.
    pub(crate) established_sessions: Counter,
    /// Sessions currently held.
    pub(crate) active_sessions: Gauge,
    /// Records inserted into the routing table.
    pub(crate) kbucket_insertions: Counter,
    /// Requests that exhausted their retries.
    pub(crate) request_timeouts: Counter,
    /// Responses that did not match any outstanding request id.
    pub(crate) unsolicited_responses: Counter,
}

impl Default for Discv5Metrics {
    fn default() -> Self {
        Self {
            decode_failures: counter!("discv5.decode_failures"),
            established_sessions: counter!("discv5.established_sessions"),
            active_sessions: gauge!("discv5.active_sessions"),
            kbucket_insertions: counter!("discv5.kbucket_insertions"),
            request_timeouts: counter!("discv5.request_timeouts"),
            unsolicited_responses: counter!("discv5.unsolicited_responses"),
        }
    }
}
