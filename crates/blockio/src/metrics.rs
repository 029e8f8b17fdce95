//! Block I/O metrics.
//!
//! The constants defined in this module are the names of metrics that the
//! workers and transports maintain via [`metrics`] crate interfaces.

use std::sync::Once;

use ::metrics::{describe_counter, describe_histogram, Unit as MetricUnit};

/// Total number of requests executed by worker dispatch loops.
pub const REQUESTS_DISPATCHED: &str = "blockio.requests_dispatched";

/// Total number of requests whose execution failed.
pub const REQUESTS_FAILED: &str = "blockio.requests_failed";

/// Histogram of request round-trip latency seen by callers, in seconds.
pub const REQUEST_LATENCY: &str = "blockio.request_latency";

/// Total number of responses that matched no outstanding request.
pub const RESPONSES_UNMATCHED: &str = "blockio.responses_unmatched";

/// Total number of times a remote link was re-established.
pub const RECONNECTS: &str = "blockio.reconnects";

/// Total number of UDP requests sent again after a timeout.
pub const UDP_RETRANSMITS: &str = "blockio.udp_retransmits";

/// Total number of free blocks handed out by allocators.
pub const BLOCKS_ALLOCATED: &str = "blockio.blocks_allocated";

/// Total number of tablespace file extensions.
pub const TABLESPACE_EXTENSIONS: &str = "blockio.tablespace_extensions";

/// Total number of node block buffer hits.
pub const BUFFER_HIT: &str = "blockio.buffer_hit";

/// Total number of node block buffer misses.
pub const BUFFER_MISS: &str = "blockio.buffer_miss";

/// Total number of node block buffer evictions.
pub const BUFFER_EVICTIONS: &str = "blockio.buffer_evictions";

/// Registers descriptions for all of the metrics above.  Idempotent.
pub fn describe_metrics() {
    static ONCE: Once = Once::new();
    ONCE.call_once(|| {
        describe_counter!(
            REQUESTS_DISPATCHED,
            MetricUnit::Count,
            "requests executed by tablespace workers"
        );
        describe_counter!(
            REQUESTS_FAILED,
            MetricUnit::Count,
            "requests whose execution failed"
        );
        describe_histogram!(
            REQUEST_LATENCY,
            MetricUnit::Seconds,
            "request latency observed by callers"
        );
        describe_counter!(
            RESPONSES_UNMATCHED,
            MetricUnit::Count,
            "responses dropped because no request was waiting for them"
        );
        describe_counter!(RECONNECTS, MetricUnit::Count, "remote links re-established");
        describe_counter!(
            UDP_RETRANSMITS,
            MetricUnit::Count,
            "datagram requests sent again after a timeout"
        );
        describe_counter!(
            BLOCKS_ALLOCATED,
            MetricUnit::Count,
            "free blocks handed out"
        );
        describe_counter!(
            TABLESPACE_EXTENSIONS,
            MetricUnit::Count,
            "tablespace file extensions"
        );
        describe_counter!(BUFFER_HIT, MetricUnit::Count, "node block buffer hits");
        describe_counter!(BUFFER_MISS, MetricUnit::Count, "node block buffer misses");
        describe_counter!(
            BUFFER_EVICTIONS,
            MetricUnit::Count,
            "node block buffer evictions"
        );
    });
}
