//! Persistent point-to-point substrates
//!
//! A partitioned request is built from one persistent channel per partition. This module defines
//! what is expected from the layer providing those channels: creation of persistent send and
//! receive channels bound to a buffer region, a peer and a tag; explicit start of a channel;
//! blocking and non-blocking completion; release.
//!
//! A persistent channel goes through the usual life cycle of a persistent request:
//!
//! - after creation it is *inactive*, testing it reports completion immediately,
//! - `start()` makes it *active*, the transfer may progress,
//! - once the transfer finished, the next `test()` or `wait()` reports completion and the channel
//!   is inactive again, ready to be restarted with the same buffer, peer and tag.
//!
//! Two substrates are provided:
//!
//! - [`local`](local/index.html): an in-process fabric connecting threads, always available,
//! - [`mpi`](mpi/index.html): MPI persistent requests, with the `mpi` feature.

use crate::error::TransportError;
use crate::{Rank, Tag};

pub mod local;
#[cfg(feature = "mpi")]
pub mod mpi;

/// Transport traits
pub mod traits {
    pub use super::Transport;
}

/// A communication group offering persistent two-sided point-to-point channels
///
/// Implementors guarantee that a channel never accesses its buffer after `free()` returned.
pub trait Transport {
    /// Handle of one persistent channel
    ///
    /// The handle is owned by exactly one partitioned request, it must not be `Clone`.
    type Request;

    /// Number of ranks in the group
    fn size(&self) -> Rank;

    /// Rank of the calling endpoint within the group
    fn rank(&self) -> Rank;

    /// Create a persistent send channel transferring `len` bytes starting at `buf` to
    /// `destination` with message tag `tag`.
    ///
    /// # Safety
    ///
    /// `buf` must be valid for reads of `len` bytes until the channel is released with `free()`,
    /// and must not be written to while the channel is active.
    unsafe fn send_init(
        &self,
        buf: *const u8,
        len: usize,
        destination: Rank,
        tag: Tag,
    ) -> Result<Self::Request, TransportError>;

    /// Create a persistent receive channel placing up to `len` bytes at `buf`, matching messages
    /// from `source` with message tag `tag`.
    ///
    /// # Safety
    ///
    /// `buf` must be valid for writes of `len` bytes until the channel is released with `free()`,
    /// and must not be accessed otherwise while the channel is active.
    unsafe fn recv_init(
        &self,
        buf: *mut u8,
        len: usize,
        source: Rank,
        tag: Tag,
    ) -> Result<Self::Request, TransportError>;

    /// Start a transfer on an inactive persistent channel.
    fn start(&self, request: &mut Self::Request) -> Result<(), TransportError>;

    /// Start transfers on several inactive persistent channels.
    fn start_all(&self, requests: &mut [Self::Request]) -> Result<(), TransportError> {
        for request in requests.iter_mut() {
            self.start(request)?;
        }
        Ok(())
    }

    /// Test whether the transfer of a channel has finished, without blocking.
    ///
    /// Returns `true` for a channel that is not active.
    fn test(&self, request: &mut Self::Request) -> Result<bool, TransportError>;

    /// Block until the transfer of a channel has finished.
    ///
    /// Returns immediately for a channel that is not active.
    fn wait(&self, request: &mut Self::Request) -> Result<(), TransportError>;

    /// Block until the transfers of all channels have finished.
    fn wait_all(&self, requests: &mut [Self::Request]) -> Result<(), TransportError> {
        for request in requests.iter_mut() {
            self.wait(request)?;
        }
        Ok(())
    }

    /// Release a persistent channel.
    fn free(&self, request: Self::Request) -> Result<(), TransportError>;
}

impl<'a, T: Transport> Transport for &'a T {
    type Request = T::Request;

    fn size(&self) -> Rank {
        (**self).size()
    }

    fn rank(&self) -> Rank {
        (**self).rank()
    }

    unsafe fn send_init(
        &self,
        buf: *const u8,
        len: usize,
        destination: Rank,
        tag: Tag,
    ) -> Result<Self::Request, TransportError> {
        (**self).send_init(buf, len, destination, tag)
    }

    unsafe fn recv_init(
        &self,
        buf: *mut u8,
        len: usize,
        source: Rank,
        tag: Tag,
    ) -> Result<Self::Request, TransportError> {
        (**self).recv_init(buf, len, source, tag)
    }

    fn start(&self, request: &mut Self::Request) -> Result<(), TransportError> {
        (**self).start(request)
    }

    fn start_all(&self, requests: &mut [Self::Request]) -> Result<(), TransportError> {
        (**self).start_all(requests)
    }

    fn test(&self, request: &mut Self::Request) -> Result<bool, TransportError> {
        (**self).test(request)
    }

    fn wait(&self, request: &mut Self::Request) -> Result<(), TransportError> {
        (**self).wait(request)
    }

    fn wait_all(&self, requests: &mut [Self::Request]) -> Result<(), TransportError> {
        (**self).wait_all(requests)
    }

    fn free(&self, request: Self::Request) -> Result<(), TransportError> {
        (**self).free(request)
    }
}

/// Check that `rank` names a member of a group of `size` ranks.
pub(crate) fn check_rank(rank: Rank, size: Rank) -> Result<(), TransportError> {
    if 0 <= rank && rank < size {
        Ok(())
    } else {
        Err(TransportError::InvalidRank { rank, size })
    }
}
