//! Error handling for partitioned requests and their transports
//!
//! Every operation of a `PartitionedRequest` returns a `Result`. Violated preconditions (calling a
//! sender-only operation on a receiver, signaling a partition twice, freeing a request that is
//! still in flight, ...) are reported as distinct variants of `Error` instead of being left to
//! undefined behavior. Failures of the underlying persistent point-to-point substrate are wrapped
//! in `Error::Transport`.

use std::fmt;
use std::os::raw::c_int;

use thiserror::Error;

use crate::partitioned::{Role, State};
use crate::{Rank, Tag};

/// Result type used throughout the crate
pub type Result<T> = std::result::Result<T, Error>;

/// Errors reported by partitioned requests
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum Error {
    /// A partitioned request needs at least one partition
    #[error("the number of partitions must be positive")]
    ZeroPartitions,
    /// Every partition needs at least one element
    #[error("the number of elements per partition must be positive")]
    ZeroCount,
    /// The buffer cannot hold `partitions * count` elements
    #[error("buffer holds {len} elements, but {partitions} partitions of {count} elements need {required}")]
    BufferTooSmall {
        /// Elements in the supplied buffer
        len: usize,
        /// Elements needed
        required: usize,
        /// Requested partition count
        partitions: usize,
        /// Requested elements per partition
        count: usize,
    },
    /// `base_tag + partition` does not fit into a `Tag`
    #[error("base tag {base_tag} cannot address {partitions} partitions")]
    TagOverflow {
        /// Tag of partition 0
        base_tag: Tag,
        /// Requested partition count
        partitions: usize,
    },
    /// Partition index outside of `0..partitions`
    #[error("partition {index} is out of range for a request with {partitions} partitions")]
    PartitionOutOfRange {
        /// Offending index
        index: usize,
        /// Partitions of the request
        partitions: usize,
    },
    /// `low > high` in a partition range
    #[error("invalid partition range {low}..={high}")]
    InvalidRange {
        /// First partition of the range
        low: usize,
        /// Last partition of the range
        high: usize,
    },
    /// The operation is only defined for the other side of the communication
    #[error("`{operation}` requires a {expected} request, but this is a {actual} request")]
    RoleMismatch {
        /// Name of the rejected operation
        operation: &'static str,
        /// Role the operation is defined for
        expected: Role,
        /// Role of the request
        actual: Role,
    },
    /// The operation is not allowed in the current state of the request
    #[error("`{operation}` is not allowed on an {state} request")]
    InvalidState {
        /// Name of the rejected operation
        operation: &'static str,
        /// State of the request
        state: State,
    },
    /// The partition was already started in the current round
    #[error("partition {index} is already in flight")]
    PartitionInFlight {
        /// Offending index
        index: usize,
    },
    /// The partition data is being transferred and cannot be accessed
    #[error("partition {index} cannot be accessed while it is in flight")]
    PartitionBusy {
        /// Offending index
        index: usize,
    },
    /// A blocking wait on a sender whose partitions have not all been signaled ready would never
    /// return
    #[error("{missing} of {partitions} partitions were never marked ready")]
    PartitionsNotReady {
        /// Partitions that are still idle
        missing: usize,
        /// Partitions of the request
        partitions: usize,
    },
    /// The persistent point-to-point substrate failed
    #[error(transparent)]
    Transport(#[from] TransportError),
}

/// Errors reported by a `Transport`
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum TransportError {
    /// The peer does not exist in the group
    #[error("rank {rank} is not part of a group of size {size}")]
    InvalidRank {
        /// Requested peer
        rank: Rank,
        /// Size of the group
        size: Rank,
    },
    /// The matched message is larger than the receive buffer
    #[error("message of {sent} bytes truncated to {capacity} bytes")]
    Truncated {
        /// Bytes sent by the peer
        sent: usize,
        /// Bytes available in the receive buffer
        capacity: usize,
    },
    /// A persistent channel was started while a previous transfer was still in flight
    #[error("persistent channel is already active")]
    AlreadyActive,
    /// The channel handle does not belong to this transport, or was released
    #[error("unknown persistent channel")]
    UnknownRequest,
    /// A length cannot be expressed in the transport's count type
    #[error("{0} bytes cannot be expressed as a transport count")]
    CountOverflow(usize),
    /// Another rank panicked while holding the fabric lock
    #[error("communication fabric is poisoned")]
    Poisoned,
    /// An MPI call returned something other than `MPI_SUCCESS`
    #[error("MPI call `{function}` failed with error code {code}")]
    Mpi {
        /// Name of the MPI function
        function: &'static str,
        /// Raw return code
        code: c_int,
    },
}

/// Error returned by `PartitionedRequest::free` when the request was not released cleanly
///
/// A request that is still in flight is handed back untouched, so that it can be completed and
/// freed again. If the transport failed while releasing the channels, the request is gone.
pub struct FreeError<R> {
    request: Option<R>,
    error: Error,
}

impl<R> FreeError<R> {
    pub(crate) fn new(request: R, error: Error) -> Self {
        FreeError {
            request: Some(request),
            error,
        }
    }

    pub(crate) fn released(error: Error) -> Self {
        FreeError {
            request: None,
            error,
        }
    }

    /// The reason why the request was not released
    pub fn error(&self) -> &Error {
        &self.error
    }

    /// Recover the request, if it was not released
    pub fn into_inner(self) -> Option<R> {
        self.request
    }

    /// Split into the request, if it was not released, and the reason
    pub fn into_parts(self) -> (Option<R>, Error) {
        (self.request, self.error)
    }
}

impl<R> fmt::Debug for FreeError<R> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FreeError")
            .field("returned", &self.request.is_some())
            .field("error", &self.error)
            .finish()
    }
}

impl<R> fmt::Display for FreeError<R> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "request not freed: {}", self.error)
    }
}

impl<R> std::error::Error for FreeError<R> {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        Some(&self.error)
    }
}

impl<R> From<FreeError<R>> for Error {
    fn from(err: FreeError<R>) -> Self {
        err.error
    }
}
