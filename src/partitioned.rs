//! Partitioned point-to-point communication
//!
//! A partitioned request transfers one message from a sender to a receiver in `partitions`
//! independent pieces. The sender marks each partition ready as soon as its data has been
//! produced (`pready()`, `pready_range()`, `pready_list()`) and the transfer of that partition
//! begins right away. The receiver can watch individual partitions arrive (`parrived()`), while
//! completion of the request as a whole (`test()`, `wait()`) is only reported once every
//! partition has been transferred.
//!
//! Each partition is carried by one persistent channel of the underlying `Transport`. Partition
//! `i` covers elements `i * count .. (i + 1) * count` of the buffer and uses tag `base_tag + i`,
//! so concurrent partitioned requests between the same pair of ranks need base tags at least
//! `partitions` apart. The channels are created once and reused for every round of
//! communication:
//!
//! - **sender**: `start()` (optional), `pready*()` for every partition, `wait()` or `test()`,
//! - **receiver**: `start()`, optionally `parrived()`, `wait()` or `test()`.
//!
//! Both sides must use the same number of partitions for the same message. This is not checked.
//!
//! The request borrows its buffer mutably for the lifetime of the [`Scope`](../scope/index.html)
//! it is registered with. The data can be reached through `partition()`, `partition_mut()`,
//! `buffer()` and `buffer_mut()`, which refuse access to data that is being transferred.
//!
//! There is no cancellation. Once a round is started it can only be completed.
//!
//! # Examples
//!
//! See `demos/local_pipeline.rs` and `demos/halo_exchange.rs`
//!
//! # Standard section(s)
//!
//! 4.2

use std::fmt;
use std::marker::PhantomData;
use std::mem;
use std::ptr::NonNull;
use std::slice;
use std::thread;

use conv::ConvUtil;
use log::{debug, trace, warn};
use smallvec::SmallVec;

use crate::datatype::{Equivalence, SystemDatatype};
use crate::error::{Error, FreeError, Result};
use crate::scope::{Scope, StaticScope};
use crate::transport::Transport;
use crate::{Rank, Tag};

/// Indices of the requests completed by `wait_some()` or `test_some()`
pub type Indices = SmallVec<[usize; 8]>;

/// Whether a partitioned request is in the middle of a round of communication
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash)]
pub enum State {
    /// All channels are quiescent and can be restarted
    Inactive,
    /// A round of communication has been started and not yet completed
    Active,
}

impl fmt::Display for State {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            State::Inactive => f.write_str("inactive"),
            State::Active => f.write_str("active"),
        }
    }
}

/// The side of the communication a partitioned request is on
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash)]
pub enum Role {
    /// Created by `send_init()`
    Sender,
    /// Created by `recv_init()`
    Receiver,
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Role::Sender => f.write_str("sender"),
            Role::Receiver => f.write_str("receiver"),
        }
    }
}

// Per-partition progress within the current round.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
enum Progress {
    // Not started (sender: not marked ready yet).
    Idle,
    // Channel started, completion not observed yet.
    Pending,
    // Completion observed.
    Arrived,
}

fn partition_tag(base_tag: Tag, index: usize) -> Option<Tag> {
    index
        .value_as::<Tag>()
        .ok()
        .and_then(|offset| base_tag.checked_add(offset))
}

/// A partitioned send or receive request
///
/// The request owns one persistent channel per partition and borrows the buffer of the message
/// for `'a`, the lifetime of the scope `S` it is registered with.
///
/// Dropping an active request blocks until every started partition has been transferred, then
/// releases the channels.
///
/// # Examples
///
/// ```
/// use mpi_partitioned::transport::local::LocalUniverse;
/// use mpi_partitioned::{scope, PartitionedRequest};
///
/// let universe = LocalUniverse::new(2);
/// let groups = universe.groups();
///
/// let mut data = [1.0f64, 2.0, 3.0, 4.0];
/// let mut halo = [0.0f64; 4];
///
/// scope(|scope| {
///     let mut send =
///         PartitionedRequest::send_init(scope, &groups[0], &mut data, 2, 2, 1, 100).unwrap();
///     let mut recv =
///         PartitionedRequest::recv_init(scope, &groups[1], &mut halo, 2, 2, 0, 100).unwrap();
///
///     recv.start().unwrap();
///     send.pready_range(0, 1).unwrap();
///     recv.wait().unwrap();
///     send.wait().unwrap();
///
///     send.free().unwrap();
///     recv.free().unwrap();
/// });
/// assert_eq!(halo, data);
/// ```
///
/// # Standard section(s)
///
/// 4.2.1
#[must_use]
pub struct PartitionedRequest<'a, E: Equivalence, C: Transport, S: Scope<'a> = StaticScope> {
    scope: S,
    group: C,
    channels: Box<[C::Request]>,
    progress: Box<[Progress]>,
    buffer: NonNull<E>,
    len: usize,
    state: State,
    role: Role,
    partitions: usize,
    send_partitions: usize,
    recv_partitions: usize,
    ready_count: usize,
    count: usize,
    peer: Rank,
    base_tag: Tag,
    datatype: SystemDatatype,
    phantom: PhantomData<&'a mut [E]>,
}

// SAFETY: the request has exclusive access to its buffer, as a `&'a mut [E]` would.
unsafe impl<'a, E, C, S> Send for PartitionedRequest<'a, E, C, S>
where
    E: Equivalence + Send,
    C: Transport + Send,
    C::Request: Send,
    S: Scope<'a> + Send,
{
}

impl<'a, E: Equivalence, C: Transport, S: Scope<'a>> PartitionedRequest<'a, E, C, S> {
    /// Create a partitioned send request.
    ///
    /// The first `partitions * count` elements of `buffer` are sent to `destination` in
    /// `partitions` partitions of `count` elements each, partition `i` with tag `base_tag + i`.
    ///
    /// The request starts out inactive. It is registered with `scope` until it is freed or
    /// dropped.
    ///
    /// # Errors
    ///
    /// - `ZeroPartitions`, `ZeroCount`, `BufferTooSmall`, `TagOverflow` for invalid arguments,
    /// - `Transport` if a channel cannot be created. Channels created before the failure are
    ///   released again.
    ///
    /// # Standard section(s)
    ///
    /// 4.2.1
    pub fn send_init(
        scope: S,
        group: C,
        buffer: &'a mut [E],
        partitions: usize,
        count: usize,
        destination: Rank,
        base_tag: Tag,
    ) -> Result<Self> {
        Self::init(
            Role::Sender,
            scope,
            group,
            buffer,
            partitions,
            count,
            destination,
            base_tag,
        )
    }

    /// Create a partitioned receive request.
    ///
    /// Partition `i` of the message from `source` is received with tag `base_tag + i` into
    /// elements `i * count .. (i + 1) * count` of `buffer`. The sender must use the same number of
    /// partitions.
    ///
    /// # Errors
    ///
    /// Same as `send_init()`.
    ///
    /// # Standard section(s)
    ///
    /// 4.2.1
    pub fn recv_init(
        scope: S,
        group: C,
        buffer: &'a mut [E],
        partitions: usize,
        count: usize,
        source: Rank,
        base_tag: Tag,
    ) -> Result<Self> {
        Self::init(
            Role::Receiver,
            scope,
            group,
            buffer,
            partitions,
            count,
            source,
            base_tag,
        )
    }

    fn init(
        role: Role,
        scope: S,
        group: C,
        buffer: &'a mut [E],
        partitions: usize,
        count: usize,
        peer: Rank,
        base_tag: Tag,
    ) -> Result<Self> {
        if partitions == 0 {
            return Err(Error::ZeroPartitions);
        }
        if count == 0 {
            return Err(Error::ZeroCount);
        }
        let required = partitions.saturating_mul(count);
        if required > buffer.len() {
            return Err(Error::BufferTooSmall {
                len: buffer.len(),
                required,
                partitions,
                count,
            });
        }
        let last_tag = partition_tag(base_tag, partitions - 1).ok_or(Error::TagOverflow {
            base_tag,
            partitions,
        })?;

        let datatype = E::equivalent_datatype();
        debug_assert_eq!(datatype.extent(), mem::size_of::<E>());
        // Cannot overflow, the partitions fit into `buffer`.
        let bytes = count * datatype.extent();

        let len = buffer.len();
        let base = buffer.as_mut_ptr();
        let mut channels = Vec::with_capacity(partitions);
        for index in 0..partitions {
            let tag = base_tag + index as Tag;
            // SAFETY: `index * count + count <= len`, so the partition lies inside `buffer`, which
            // stays mutably borrowed for `'a`. The request is registered with a `Scope<'a>`, so
            // the borrow cannot end while the channels exist, a leaked request aborts instead.
            let created = unsafe {
                let ptr = base.add(index * count) as *mut u8;
                match role {
                    Role::Sender => group.send_init(ptr as *const u8, bytes, peer, tag),
                    Role::Receiver => group.recv_init(ptr, bytes, peer, tag),
                }
            };
            match created {
                Ok(channel) => channels.push(channel),
                Err(err) => {
                    for channel in channels {
                        if let Err(free_err) = group.free(channel) {
                            warn!("failed to release partition channel: {}", free_err);
                        }
                    }
                    return Err(err.into());
                }
            }
        }

        debug!(
            "created {} request with rank {}: {} partitions of {} x {} ({} bytes), tags {}..={}",
            role,
            peer,
            partitions,
            count,
            datatype.name(),
            bytes,
            base_tag,
            last_tag
        );

        scope.register();
        Ok(PartitionedRequest {
            scope,
            group,
            channels: channels.into_boxed_slice(),
            progress: vec![Progress::Idle; partitions].into_boxed_slice(),
            // A slice pointer is never null.
            buffer: NonNull::new(base).unwrap_or(NonNull::dangling()),
            len,
            state: State::Inactive,
            role,
            partitions,
            send_partitions: partitions,
            recv_partitions: partitions,
            ready_count: 0,
            count,
            peer,
            base_tag,
            datatype,
            phantom: PhantomData,
        })
    }

    /// Whether a round of communication is in progress
    pub fn state(&self) -> State {
        self.state
    }

    /// `true` if a round of communication is in progress
    pub fn is_active(&self) -> bool {
        self.state == State::Active
    }

    /// The side of the communication this request is on
    pub fn role(&self) -> Role {
        self.role
    }

    /// Number of partitions
    pub fn partitions(&self) -> usize {
        self.partitions
    }

    /// Number of partitions assumed on the sending side
    pub fn send_partitions(&self) -> usize {
        self.send_partitions
    }

    /// Number of partitions assumed on the receiving side
    pub fn recv_partitions(&self) -> usize {
        self.recv_partitions
    }

    /// Number of partitions marked ready in the current round
    ///
    /// This is bookkeeping only, completion never depends on it. It is reset when a round
    /// completes.
    pub fn ready_count(&self) -> usize {
        self.ready_count
    }

    /// Number of elements per partition
    pub fn count(&self) -> usize {
        self.count
    }

    /// Rank of the destination (sender) or source (receiver)
    pub fn peer(&self) -> Rank {
        self.peer
    }

    /// Tag of partition 0
    pub fn base_tag(&self) -> Tag {
        self.base_tag
    }

    /// Tag used for the transfer of partition `index`
    pub fn tag_of(&self, index: usize) -> Result<Tag> {
        self.check_index(index)?;
        partition_tag(self.base_tag, index).ok_or(Error::TagOverflow {
            base_tag: self.base_tag,
            partitions: self.partitions,
        })
    }

    /// The datatype descriptor of the elements
    pub fn datatype(&self) -> SystemDatatype {
        self.datatype
    }

    /// The group the channels were created in
    pub fn group(&self) -> &C {
        &self.group
    }

    fn check_role(&self, operation: &'static str, expected: Role) -> Result<()> {
        if self.role == expected {
            Ok(())
        } else {
            Err(Error::RoleMismatch {
                operation,
                expected,
                actual: self.role,
            })
        }
    }

    fn check_index(&self, index: usize) -> Result<()> {
        if index < self.partitions {
            Ok(())
        } else {
            Err(Error::PartitionOutOfRange {
                index,
                partitions: self.partitions,
            })
        }
    }

    fn check_idle(&self, index: usize) -> Result<()> {
        if self.progress[index] == Progress::Idle {
            Ok(())
        } else {
            Err(Error::PartitionInFlight { index })
        }
    }

    fn check_inactive(&self, operation: &'static str) -> Result<()> {
        match self.state {
            State::Inactive => Ok(()),
            state => Err(Error::InvalidState { operation, state }),
        }
    }

    // Readiness on an inactive sender opens the round.
    fn begin_round(&mut self) {
        if self.state == State::Inactive {
            self.state = State::Active;
            self.ready_count = 0;
            trace!("sender round with rank {} started", self.peer);
        }
    }

    fn finish_round(&mut self) {
        debug_assert_eq!(self.channels.len(), self.partitions);
        self.state = State::Inactive;
        self.ready_count = 0;
        self.progress.fill(Progress::Idle);
        trace!("{} round with rank {} completed", self.role, self.peer);
    }

    /// Mark partition `partition` ready, starting its transfer.
    ///
    /// Marking a partition of an inactive request ready starts a new round.
    ///
    /// # Errors
    ///
    /// `RoleMismatch` on a receiver, `PartitionOutOfRange`, `PartitionInFlight` if the partition
    /// has already been marked ready in this round, `Transport`.
    ///
    /// # Standard section(s)
    ///
    /// 4.2.2
    pub fn pready(&mut self, partition: usize) -> Result<()> {
        self.check_role("pready", Role::Sender)?;
        self.check_index(partition)?;
        self.check_idle(partition)?;
        self.begin_round();

        self.group.start(&mut self.channels[partition])?;
        self.progress[partition] = Progress::Pending;
        self.ready_count += 1;
        trace!("partition {} ready for rank {}", partition, self.peer);
        Ok(())
    }

    /// Mark partitions `low..=high` ready, starting their transfers as one batch.
    ///
    /// # Errors
    ///
    /// Same as `pready()`, plus `InvalidRange` if `low > high`. Nothing is started if any
    /// partition of the range is rejected. If the transport fails while starting the batch, the
    /// whole range is treated as in flight.
    ///
    /// # Standard section(s)
    ///
    /// 4.2.2
    pub fn pready_range(&mut self, low: usize, high: usize) -> Result<()> {
        self.check_role("pready_range", Role::Sender)?;
        if low > high {
            return Err(Error::InvalidRange { low, high });
        }
        self.check_index(high)?;
        for index in low..=high {
            self.check_idle(index)?;
        }
        self.begin_round();

        // A failing batch may have started some of its channels, so the whole range counts as
        // in flight. Waiting on a channel that was not started returns immediately.
        self.progress[low..=high].fill(Progress::Pending);
        self.ready_count += high - low + 1;
        self.group.start_all(&mut self.channels[low..=high])?;
        trace!("partitions {}..={} ready for rank {}", low, high, self.peer);
        Ok(())
    }

    /// Mark the listed partitions ready, starting their transfers one after the other.
    ///
    /// The first failure aborts, partitions started before it stay in flight.
    ///
    /// # Errors
    ///
    /// Same as `pready()`. Indices are range checked before anything is started.
    ///
    /// # Standard section(s)
    ///
    /// 4.2.2
    pub fn pready_list(&mut self, partitions: &[usize]) -> Result<()> {
        self.check_role("pready_list", Role::Sender)?;
        for &index in partitions {
            self.check_index(index)?;
        }
        if partitions.is_empty() {
            return Ok(());
        }
        self.begin_round();

        for &index in partitions {
            self.check_idle(index)?;
            self.group.start(&mut self.channels[index])?;
            self.progress[index] = Progress::Pending;
            self.ready_count += 1;
        }
        trace!("partitions {:?} ready for rank {}", partitions, self.peer);
        Ok(())
    }

    /// Test whether partition `partition` has arrived, without blocking.
    ///
    /// The state of the request as a whole is not affected. An inactive request has nothing
    /// outstanding and reports every partition as arrived.
    ///
    /// # Errors
    ///
    /// `RoleMismatch` on a sender, `PartitionOutOfRange`, `Transport`.
    ///
    /// # Standard section(s)
    ///
    /// 4.2.2
    pub fn parrived(&mut self, partition: usize) -> Result<bool> {
        self.check_role("parrived", Role::Receiver)?;
        self.check_index(partition)?;
        if self.state == State::Inactive {
            return Ok(true);
        }

        match self.progress[partition] {
            Progress::Arrived => Ok(true),
            Progress::Idle => Ok(false),
            Progress::Pending => {
                if self.group.test(&mut self.channels[partition])? {
                    self.progress[partition] = Progress::Arrived;
                    trace!("partition {} arrived from rank {}", partition, self.peer);
                    Ok(true)
                } else {
                    Ok(false)
                }
            }
        }
    }

    /// Start a round of communication.
    ///
    /// On a receiver, every partition channel is started at once. On a sender, the partitions are
    /// started individually by `pready()` and friends.
    ///
    /// # Errors
    ///
    /// `InvalidState` if the request is already active, `Transport`. After a transport failure the
    /// request is active and has to be completed like any other round.
    ///
    /// # Standard section(s)
    ///
    /// 3.9
    pub fn start(&mut self) -> Result<()> {
        self.check_inactive("start")?;
        self.state = State::Active;
        self.ready_count = 0;
        if self.role == Role::Receiver {
            // As in `pready_range()`, a partially started batch is in flight as a whole.
            self.progress.fill(Progress::Pending);
            self.group.start_all(&mut self.channels)?;
        }
        trace!("{} round with rank {} started", self.role, self.peer);
        Ok(())
    }

    /// Test whether the round of communication has completed, without blocking.
    ///
    /// Returns `true` only if every partition has been transferred, the request is then inactive.
    /// Otherwise returns `false` and leaves the state unchanged. A sender with partitions that
    /// have not been marked ready is not complete. An inactive request is complete.
    ///
    /// Every started channel is tested on each call, including those already seen to complete.
    ///
    /// # Standard section(s)
    ///
    /// 3.7.3
    pub fn test(&mut self) -> Result<bool> {
        if self.state == State::Inactive {
            return Ok(true);
        }

        let mut complete = true;
        for (channel, progress) in self.channels.iter_mut().zip(self.progress.iter_mut()) {
            match *progress {
                Progress::Idle => complete = false,
                Progress::Pending | Progress::Arrived => {
                    if self.group.test(channel)? {
                        *progress = Progress::Arrived;
                    } else {
                        complete = false;
                    }
                }
            }
        }

        if complete {
            self.finish_round();
        }
        Ok(complete)
    }

    /// Block until every partition has been transferred, then make the request inactive.
    ///
    /// Returns immediately for an inactive request.
    ///
    /// # Errors
    ///
    /// `PartitionsNotReady` on a sender with partitions that have not been marked ready, since the
    /// wait could never return. `Transport`.
    ///
    /// # Standard section(s)
    ///
    /// 3.7.3
    pub fn wait(&mut self) -> Result<()> {
        if self.state == State::Inactive {
            return Ok(());
        }
        let missing = self
            .progress
            .iter()
            .filter(|&&progress| progress == Progress::Idle)
            .count();
        if missing > 0 {
            return Err(Error::PartitionsNotReady {
                missing,
                partitions: self.partitions,
            });
        }

        // Partitions that already arrived are inactive channels, which complete immediately.
        self.group.wait_all(&mut self.channels)?;
        self.finish_round();
        Ok(())
    }

    fn partition_ptr(&self, index: usize) -> *mut E {
        // SAFETY: `index < partitions`, so the offset stays inside the buffer.
        unsafe { self.buffer.as_ptr().add(index * self.count) }
    }

    /// The elements of partition `index`
    ///
    /// # Errors
    ///
    /// `PartitionOutOfRange`; `PartitionBusy` on a receiver if the partition has not been
    /// observed to arrive (`parrived()`) in the current round.
    pub fn partition(&self, index: usize) -> Result<&[E]> {
        self.check_index(index)?;
        if self.role == Role::Receiver && self.progress[index] == Progress::Pending {
            return Err(Error::PartitionBusy { index });
        }
        // SAFETY: nothing writes to the partition while it is not pending on a receiver.
        Ok(unsafe { slice::from_raw_parts(self.partition_ptr(index), self.count) })
    }

    /// The elements of partition `index`, for writing
    ///
    /// On a sender this is the way to fill a partition before marking it ready.
    ///
    /// # Errors
    ///
    /// `PartitionOutOfRange`; `PartitionBusy` if the partition is being transferred.
    pub fn partition_mut(&mut self, index: usize) -> Result<&mut [E]> {
        self.check_index(index)?;
        if self.progress[index] == Progress::Pending {
            return Err(Error::PartitionBusy { index });
        }
        // SAFETY: the transport does not access a partition that is not pending.
        Ok(unsafe { slice::from_raw_parts_mut(self.partition_ptr(index), self.count) })
    }

    /// The whole buffer
    ///
    /// # Errors
    ///
    /// `InvalidState` while a round is in progress.
    pub fn buffer(&self) -> Result<&[E]> {
        self.check_inactive("buffer")?;
        // SAFETY: all channels are quiescent.
        Ok(unsafe { slice::from_raw_parts(self.buffer.as_ptr(), self.len) })
    }

    /// The whole buffer, for writing
    ///
    /// # Errors
    ///
    /// `InvalidState` while a round is in progress.
    pub fn buffer_mut(&mut self) -> Result<&mut [E]> {
        self.check_inactive("buffer_mut")?;
        // SAFETY: all channels are quiescent.
        Ok(unsafe { slice::from_raw_parts_mut(self.buffer.as_ptr(), self.len) })
    }

    /// Release the request and all of its channels.
    ///
    /// Partitioned requests cannot be cancelled: an active request is handed back inside the
    /// error and has to be completed with `wait()` or `test()` first.
    ///
    /// # Errors
    ///
    /// `InvalidState` for an active request, `Transport` if a channel cannot be released.
    pub fn free(mut self) -> std::result::Result<(), FreeError<Self>> {
        if self.state == State::Active {
            let error = Error::InvalidState {
                operation: "free",
                state: State::Active,
            };
            return Err(FreeError::new(self, error));
        }
        debug!("freeing {} request with rank {}", self.role, self.peer);
        self.release().map_err(FreeError::released)
    }

    fn release(&mut self) -> Result<()> {
        let channels = mem::take(&mut self.channels);
        if channels.is_empty() {
            // Already released by `free()`.
            return Ok(());
        }
        let mut result = Ok(());
        for channel in channels.into_vec() {
            if let Err(err) = self.group.free(channel) {
                warn!("failed to release partition channel: {}", err);
                if result.is_ok() {
                    result = Err(err.into());
                }
            }
        }
        // SAFETY: registered once in `init()`, the channels are gone and `channels` is empty from
        // now on.
        unsafe { self.scope.unregister() };
        result
    }
}

impl<'a, E: Equivalence, C: Transport, S: Scope<'a>> Drop for PartitionedRequest<'a, E, C, S> {
    fn drop(&mut self) {
        if self.state == State::Active {
            warn!(
                "{} request with rank {} dropped while active, waiting for started partitions",
                self.role, self.peer
            );
            for (channel, progress) in self.channels.iter_mut().zip(self.progress.iter()) {
                if *progress == Progress::Pending {
                    if let Err(err) = self.group.wait(channel) {
                        warn!("failed to complete partition channel: {}", err);
                    }
                }
            }
        }
        // Errors are already logged, there is nobody left to report them to.
        let _ = self.release();
    }
}

impl<'a, E: Equivalence, C: Transport, S: Scope<'a>> fmt::Debug
    for PartitionedRequest<'a, E, C, S>
{
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PartitionedRequest")
            .field("state", &self.state)
            .field("role", &self.role)
            .field("partitions", &self.partitions)
            .field("ready_count", &self.ready_count)
            .field("count", &self.count)
            .field("datatype", &self.datatype)
            .field("peer", &self.peer)
            .field("base_tag", &self.base_tag)
            .finish()
    }
}

/// Start every request, in order. The first failure aborts.
///
/// # Standard section(s)
///
/// 3.9
pub fn start_all<'a, E: Equivalence, C: Transport, S: Scope<'a>>(
    requests: &mut [PartitionedRequest<'a, E, C, S>],
) -> Result<()> {
    for request in requests.iter_mut() {
        request.start()?;
    }
    Ok(())
}

/// Wait for every request, one after the other, in order.
///
/// # Standard section(s)
///
/// 3.7.5
pub fn wait_all<'a, E: Equivalence, C: Transport, S: Scope<'a>>(
    requests: &mut [PartitionedRequest<'a, E, C, S>],
) -> Result<()> {
    for request in requests.iter_mut() {
        request.wait()?;
    }
    Ok(())
}

/// Block until any request completes and return its index.
///
/// Polls `test()` over the requests in order until one reports completion. Inactive requests
/// count as complete. Returns `None` if `requests` is empty.
///
/// # Standard section(s)
///
/// 3.7.5
pub fn wait_any<'a, E: Equivalence, C: Transport, S: Scope<'a>>(
    requests: &mut [PartitionedRequest<'a, E, C, S>],
) -> Result<Option<usize>> {
    if requests.is_empty() {
        return Ok(None);
    }
    loop {
        if let Some(index) = test_any(requests)? {
            return Ok(Some(index));
        }
        thread::yield_now();
    }
}

/// Block until at least one request completes and return the indices of all requests found
/// complete in the same sweep.
///
/// Returns an empty set if `requests` is empty.
///
/// # Standard section(s)
///
/// 3.7.5
pub fn wait_some<'a, E: Equivalence, C: Transport, S: Scope<'a>>(
    requests: &mut [PartitionedRequest<'a, E, C, S>],
) -> Result<Indices> {
    if requests.is_empty() {
        return Ok(Indices::new());
    }
    loop {
        let completed = test_some(requests)?;
        if !completed.is_empty() {
            return Ok(completed);
        }
        thread::yield_now();
    }
}

/// Test every request and report whether all of them are complete.
///
/// Every request is tested, even after one reported `false`.
///
/// # Standard section(s)
///
/// 3.7.5
pub fn test_all<'a, E: Equivalence, C: Transport, S: Scope<'a>>(
    requests: &mut [PartitionedRequest<'a, E, C, S>],
) -> Result<bool> {
    let mut complete = true;
    for request in requests.iter_mut() {
        complete &= request.test()?;
    }
    Ok(complete)
}

/// Test the requests in order and return the index of the first complete one.
///
/// # Standard section(s)
///
/// 3.7.5
pub fn test_any<'a, E: Equivalence, C: Transport, S: Scope<'a>>(
    requests: &mut [PartitionedRequest<'a, E, C, S>],
) -> Result<Option<usize>> {
    for (index, request) in requests.iter_mut().enumerate() {
        if request.test()? {
            return Ok(Some(index));
        }
    }
    Ok(None)
}

/// Test every request and return the indices of the complete ones.
///
/// # Standard section(s)
///
/// 3.7.5
pub fn test_some<'a, E: Equivalence, C: Transport, S: Scope<'a>>(
    requests: &mut [PartitionedRequest<'a, E, C, S>],
) -> Result<Indices> {
    let mut completed = Indices::new();
    for (index, request) in requests.iter_mut().enumerate() {
        if request.test()? {
            completed.push(index);
        }
    }
    Ok(completed)
}

#[cfg(test)]
mod tests {
    use std::cell::Cell;

    use super::*;
    use crate::error::TransportError;
    use crate::scope::scope;
    use crate::transport::local::{LocalConfig, LocalGroup, LocalRequest, LocalUniverse};

    // Forwards to a `LocalGroup`, counting tests and refusing starts once the budget is spent.
    struct Instrumented {
        inner: LocalGroup,
        tests: Cell<usize>,
        start_budget: Cell<usize>,
    }

    impl Instrumented {
        fn new(inner: LocalGroup) -> Self {
            Instrumented {
                inner,
                tests: Cell::new(0),
                start_budget: Cell::new(usize::MAX),
            }
        }
    }

    impl Transport for Instrumented {
        type Request = LocalRequest;

        fn size(&self) -> Rank {
            self.inner.size()
        }

        fn rank(&self) -> Rank {
            self.inner.rank()
        }

        unsafe fn send_init(
            &self,
            buf: *const u8,
            len: usize,
            destination: Rank,
            tag: Tag,
        ) -> std::result::Result<LocalRequest, TransportError> {
            self.inner.send_init(buf, len, destination, tag)
        }

        unsafe fn recv_init(
            &self,
            buf: *mut u8,
            len: usize,
            source: Rank,
            tag: Tag,
        ) -> std::result::Result<LocalRequest, TransportError> {
            self.inner.recv_init(buf, len, source, tag)
        }

        fn start(&self, request: &mut LocalRequest) -> std::result::Result<(), TransportError> {
            let budget = self.start_budget.get();
            if budget == 0 {
                return Err(TransportError::Poisoned);
            }
            self.start_budget.set(budget - 1);
            self.inner.start(request)
        }

        fn test(&self, request: &mut LocalRequest) -> std::result::Result<bool, TransportError> {
            self.tests.set(self.tests.get() + 1);
            self.inner.test(request)
        }

        fn wait(&self, request: &mut LocalRequest) -> std::result::Result<(), TransportError> {
            self.inner.wait(request)
        }

        fn free(&self, request: LocalRequest) -> std::result::Result<(), TransportError> {
            self.inner.free(request)
        }
    }

    fn eager_pair() -> (LocalGroup, LocalGroup) {
        let universe = LocalUniverse::with_config(2, LocalConfig::new().with_eager_limit(1024));
        let mut groups = universe.groups().into_iter();
        (groups.next().unwrap(), groups.next().unwrap())
    }

    #[test]
    fn test_retests_every_started_partition() {
        let (zero, one) = eager_pair();
        let receiver = Instrumented::new(one);
        let mut data = [1u32, 2, 3];
        let mut halo = [0u32; 3];

        scope(|scope| {
            let mut send =
                PartitionedRequest::send_init(scope, &zero, &mut data, 3, 1, 1, 0).unwrap();
            let mut recv =
                PartitionedRequest::recv_init(scope, &receiver, &mut halo, 3, 1, 0, 0).unwrap();

            recv.start().unwrap();
            send.pready(0).unwrap();
            assert!(recv.parrived(0).unwrap());

            receiver.tests.set(0);
            assert!(!recv.test().unwrap());
            assert_eq!(receiver.tests.get(), 3);

            send.pready_range(1, 2).unwrap();
            receiver.tests.set(0);
            assert!(recv.test().unwrap());
            assert_eq!(receiver.tests.get(), 3);

            send.wait().unwrap();
            send.free().unwrap();
            recv.free().unwrap();
        });
        assert_eq!(halo, data);
    }

    #[test]
    fn failed_batch_start_leaves_the_range_in_flight() {
        let (zero, _one) = eager_pair();
        let sender = Instrumented::new(zero);
        let mut data = [0u16; 4];

        scope(|scope| {
            let mut send =
                PartitionedRequest::send_init(scope, &sender, &mut data, 4, 1, 1, 0).unwrap();

            sender.start_budget.set(1);
            assert_eq!(
                send.pready_range(0, 2),
                Err(Error::Transport(TransportError::Poisoned))
            );
            assert!(send.is_active());
            assert_eq!(send.ready_count(), 3);
            for index in 0..3 {
                assert_eq!(send.partition_mut(index), Err(Error::PartitionBusy { index }));
            }
            assert!(send.partition_mut(3).is_ok());

            sender.start_budget.set(usize::MAX);
            send.pready(3).unwrap();
            send.wait().unwrap();
            assert_eq!(send.state(), State::Inactive);
            send.free().unwrap();
        });
    }

    #[test]
    fn failed_receive_start_leaves_the_request_active() {
        let (zero, one) = eager_pair();
        let receiver = Instrumented::new(one);
        let mut data = [7i64; 4];
        let mut halo = [0i64; 4];

        scope(|scope| {
            let mut send =
                PartitionedRequest::send_init(scope, &zero, &mut data, 4, 1, 1, 0).unwrap();
            let mut recv =
                PartitionedRequest::recv_init(scope, &receiver, &mut halo, 4, 1, 0, 0).unwrap();

            receiver.start_budget.set(2);
            assert_eq!(recv.start(), Err(Error::Transport(TransportError::Poisoned)));
            assert!(recv.is_active());
            assert_eq!(recv.partition(0), Err(Error::PartitionBusy { index: 0 }));
            assert!(matches!(recv.buffer(), Err(Error::InvalidState { .. })));

            send.pready_range(0, 3).unwrap();
            send.wait().unwrap();
            recv.wait().unwrap();
            assert_eq!(recv.partition(1).unwrap(), &[7]);

            send.free().unwrap();
            recv.free().unwrap();
        });
    }

    #[test]
    fn requests_are_registered_until_released() {
        let (zero, one) = eager_pair();
        let mut data = [0u8; 4];
        let mut halo = [0u8; 4];

        scope(|scope| {
            let send = PartitionedRequest::send_init(scope, &zero, &mut data, 2, 2, 1, 0).unwrap();
            let recv = PartitionedRequest::recv_init(scope, &one, &mut halo, 2, 2, 0, 0).unwrap();
            assert_eq!(scope.requests(), 2);

            send.free().unwrap();
            assert_eq!(scope.requests(), 1);
            drop(recv);
            assert_eq!(scope.requests(), 0);
        });
    }

    #[test]
    fn failed_creation_does_not_register() {
        let (zero, _one) = eager_pair();
        let mut data = [0u8; 4];

        scope(|scope| {
            let result = PartitionedRequest::send_init(scope, &zero, &mut data, 2, 2, 9, 0);
            assert!(result.is_err());
            assert_eq!(scope.requests(), 0);
        });
    }
}
