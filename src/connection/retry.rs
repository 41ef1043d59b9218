//! Transient error classification.
//!
//! A transport failure is transient when its message matches one of the
//! patterns below. Matching is case-insensitive on the driver's message,
//! since the driver is opaque and only reports text. SQL errors are never
//! transient, whatever their text says.

use std::time::Duration;

use crate::error::ConduitError;

/// Fixed pause between resetting a handle and the single retry.
pub const RETRY_DELAY: Duration = Duration::from_millis(100);

/// A named family of transient failures and the message fragments that identify it.
#[derive(Debug, Clone, Copy)]
pub struct TransientPattern {
    pub name: &'static str,
    pub needles: &'static [&'static str],
}

impl TransientPattern {
    fn matches(&self, message: &str) -> bool {
        self.needles.iter().any(|needle| message.contains(needle))
    }
}

/// Transient failure table. Needles are lower-case.
pub const TRANSIENT_PATTERNS: &[TransientPattern] = &[
    TransientPattern {
        name: "connection reset",
        needles: &["connection reset", "econnreset", "reset by peer"],
    },
    TransientPattern {
        name: "broken pipe",
        needles: &["broken pipe", "epipe"],
    },
    TransientPattern {
        name: "operation timed out",
        needles: &["timed out", "etimedout"],
    },
    TransientPattern {
        name: "host unreachable",
        needles: &["host unreachable", "ehostunreach", "no route to host", "network is unreachable"],
    },
    TransientPattern {
        name: "connection refused",
        needles: &["connection refused", "econnrefused"],
    },
    TransientPattern {
        name: "connection closed",
        needles: &["connection closed", "connection was closed"],
    },
    TransientPattern {
        name: "transport error",
        needles: &["transport error", "websocket error", "websocket closed"],
    },
    TransientPattern {
        name: "socket hang up",
        needles: &["socket hang up"],
    },
    TransientPattern {
        name: "pool exhausted",
        needles: &["pool timed out", "pool exhausted", "pool closed"],
    },
    TransientPattern {
        name: "timeout",
        needles: &["timeout"],
    },
];

/// Returns the matching pattern for an error, if it is transient.
pub fn transient_pattern(error: &ConduitError) -> Option<&'static TransientPattern> {
    match error {
        ConduitError::Connection(msg) => {
            let message = msg.to_lowercase();
            TRANSIENT_PATTERNS.iter().find(|p| p.matches(&message))
        }
        ConduitError::Query(_)
        | ConduitError::Config(_)
        | ConduitError::ConnectionTest(_)
        | ConduitError::Cancelled
        | ConduitError::Persistence(_)
        | ConduitError::Internal(_) => None,
    }
}

/// Returns true if the error is eligible for one automatic retry.
pub fn is_transient(error: &ConduitError) -> bool {
    transient_pattern(error).is_some()
}
