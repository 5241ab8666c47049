//! Outcomes a probe can fail with.

use std::fmt;

/// Terminal outcome of a pending reply expectation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProbeError {
    /// No matching reply arrived before the deadline.
    Timeout,
    /// The pending's deadline was implausibly far in the future, which
    /// happens when the system clock jumps backwards after arming.
    ClockWarp,
    /// The service shut down while the request was in flight.
    Closed,
    /// A reply arrived that the target should never have sent.
    UnsolicitedReply,
    /// The reply's recovered identity does not match the expected node.
    UnknownNode,
    /// A neighbors reply contained an entry the target can only have
    /// learned from spoofed input.
    CorruptDht,
}

impl fmt::Display for ProbeError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let reason = match self {
            Self::Timeout => "timed out waiting for a reply",
            Self::ClockWarp => "reply deadline too far in the future",
            Self::Closed => "socket closed",
            Self::UnsolicitedReply => "unsolicited reply",
            Self::UnknownNode => "reply from unexpected node",
            Self::CorruptDht => "neighbors data contains a spoofed entry",
        };
        f.write_str(reason)
    }
}

impl std::error::Error for ProbeError {}
