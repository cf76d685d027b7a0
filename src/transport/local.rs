//! An in-process communication fabric
//!
//! `LocalUniverse` connects a fixed number of ranks living in the same process, typically one
//! thread per rank. Each rank obtains its endpoint, a `LocalGroup`, which implements `Transport`.
//!
//! Matching follows the usual two-sided rules: a started send and a started receive match when
//! source, destination and tag agree. Messages with the same envelope are matched in the order in
//! which they were started (non-overtaking). The data is copied by whichever side starts second,
//! under the fabric lock, so progress never depends on a background thread.
//!
//! Sends of at most `LocalConfig::eager_limit` bytes are buffered when they are started and
//! complete without waiting for the matching receive.
//!
//! # Examples
//!
//! ```
//! use mpi_partitioned::transport::local::LocalUniverse;
//! use mpi_partitioned::traits::*;
//!
//! let universe = LocalUniverse::new(2);
//! let groups = universe.groups();
//! assert_eq!(groups[1].rank(), 1);
//! assert_eq!(groups[1].size(), 2);
//! ```

use std::collections::{HashMap, VecDeque};
use std::fmt;
use std::ptr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Condvar, Mutex, MutexGuard};

use log::trace;

use super::{check_rank, Transport};
use crate::error::TransportError;
use crate::{Rank, Tag};

static NEXT_CHANNEL: AtomicU64 = AtomicU64::new(0);

/// Tunables of a `LocalUniverse`
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq)]
pub struct LocalConfig {
    eager_limit: usize,
}

impl LocalConfig {
    /// The default configuration: every send waits for its matching receive.
    pub fn new() -> Self {
        Self::default()
    }

    /// Buffer sends of at most `bytes` bytes when they are started.
    pub fn with_eager_limit(mut self, bytes: usize) -> Self {
        self.eager_limit = bytes;
        self
    }

    /// Largest send, in bytes, that completes without a matching receive
    pub fn eager_limit(&self) -> usize {
        self.eager_limit
    }
}

/// A set of ranks connected by an in-process fabric
#[derive(Clone)]
pub struct LocalUniverse {
    fabric: Arc<Fabric>,
}

impl LocalUniverse {
    /// Connect `size` ranks using the default configuration.
    pub fn new(size: Rank) -> Self {
        Self::with_config(size, LocalConfig::default())
    }

    /// Connect `size` ranks.
    pub fn with_config(size: Rank, config: LocalConfig) -> Self {
        LocalUniverse {
            fabric: Arc::new(Fabric {
                size: size.max(0),
                config,
                matching: Mutex::new(Matching::default()),
                progress: Condvar::new(),
            }),
        }
    }

    /// Number of ranks
    pub fn size(&self) -> Rank {
        self.fabric.size
    }

    /// The configuration of the fabric
    pub fn config(&self) -> LocalConfig {
        self.fabric.config
    }

    /// The endpoint of rank `rank`
    pub fn group(&self, rank: Rank) -> Result<LocalGroup, TransportError> {
        check_rank(rank, self.fabric.size)?;
        Ok(LocalGroup {
            rank,
            fabric: Arc::clone(&self.fabric),
        })
    }

    /// The endpoints of all ranks, in rank order
    pub fn groups(&self) -> Vec<LocalGroup> {
        (0..self.fabric.size)
            .map(|rank| LocalGroup {
                rank,
                fabric: Arc::clone(&self.fabric),
            })
            .collect()
    }
}

impl fmt::Debug for LocalUniverse {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LocalUniverse")
            .field("size", &self.fabric.size)
            .field("config", &self.fabric.config)
            .finish()
    }
}

/// The endpoint of one rank of a `LocalUniverse`
#[derive(Clone)]
pub struct LocalGroup {
    rank: Rank,
    fabric: Arc<Fabric>,
}

impl fmt::Debug for LocalGroup {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LocalGroup")
            .field("rank", &self.rank)
            .field("size", &self.fabric.size)
            .finish()
    }
}

/// Handle of a persistent channel of a `LocalGroup`
#[derive(Debug, PartialEq, Eq, Hash)]
pub struct LocalRequest {
    id: u64,
}

struct Fabric {
    size: Rank,
    config: LocalConfig,
    matching: Mutex<Matching>,
    progress: Condvar,
}

#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash)]
struct Envelope {
    source: Rank,
    destination: Rank,
    tag: Tag,
}

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
enum Direction {
    Send,
    Receive,
}

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
enum Phase {
    Inactive,
    Active,
    Complete,
}

enum Message {
    Rendezvous(u64),
    Eager(Vec<u8>),
}

struct Channel {
    direction: Direction,
    envelope: Envelope,
    // Only written through for `Direction::Receive`.
    buf: *mut u8,
    len: usize,
    phase: Phase,
    error: Option<TransportError>,
}

// SAFETY: the buffer behind `buf` is only accessed while the fabric lock is held, and the creator
// of the channel guarantees its validity until the channel is freed.
unsafe impl Send for Channel {}

impl Channel {
    /// Observe completion, turning a completed channel inactive.
    fn complete(&mut self) -> Result<bool, TransportError> {
        match self.phase {
            Phase::Active => Ok(false),
            Phase::Inactive => Ok(true),
            Phase::Complete => {
                self.phase = Phase::Inactive;
                match self.error.take() {
                    Some(err) => Err(err),
                    None => Ok(true),
                }
            }
        }
    }
}

#[derive(Default)]
struct Matching {
    channels: HashMap<u64, Channel>,
    // Started sends and started receives that have not been matched yet, per envelope.
    sends: HashMap<Envelope, VecDeque<Message>>,
    receives: HashMap<Envelope, VecDeque<u64>>,
}

impl Matching {
    fn channel(&mut self, id: u64) -> Result<&mut Channel, TransportError> {
        self.channels
            .get_mut(&id)
            .ok_or(TransportError::UnknownRequest)
    }

    fn pop_send(&mut self, envelope: &Envelope) -> Option<Message> {
        let queue = self.sends.get_mut(envelope)?;
        let message = queue.pop_front();
        if queue.is_empty() {
            self.sends.remove(envelope);
        }
        message
    }

    fn pop_receive(&mut self, envelope: &Envelope) -> Option<u64> {
        let queue = self.receives.get_mut(envelope)?;
        let id = queue.pop_front();
        if queue.is_empty() {
            self.receives.remove(envelope);
        }
        id
    }

    /// Copy `len` bytes from `src` into receive channel `receive` and complete it.
    ///
    /// # Safety
    ///
    /// `src` must be valid for reads of `len` bytes.
    unsafe fn fill(&mut self, receive: u64, src: *const u8, len: usize) {
        if let Some(channel) = self.channels.get_mut(&receive) {
            let copied = len.min(channel.len);
            ptr::copy(src, channel.buf, copied);
            if len > channel.len {
                channel.error = Some(TransportError::Truncated {
                    sent: len,
                    capacity: channel.len,
                });
            }
            channel.phase = Phase::Complete;
            trace!("delivered {} bytes for {:?}", copied, channel.envelope);
        }
    }

    fn deliver(&mut self, send: u64, receive: u64) {
        let (src, len) = match self.channels.get_mut(&send) {
            Some(channel) => {
                channel.phase = Phase::Complete;
                (channel.buf as *const u8, channel.len)
            }
            None => return,
        };
        // SAFETY: the send channel is registered, so its buffer is valid until it is freed, which
        // requires the fabric lock we are holding.
        unsafe { self.fill(receive, src, len) }
    }

    fn withdraw(&mut self, id: u64, channel: &Channel) {
        match channel.direction {
            Direction::Send => {
                if let Some(queue) = self.sends.get_mut(&channel.envelope) {
                    queue.retain(
                        |message| !matches!(message, Message::Rendezvous(other) if *other == id),
                    );
                    if queue.is_empty() {
                        self.sends.remove(&channel.envelope);
                    }
                }
            }
            Direction::Receive => {
                if let Some(queue) = self.receives.get_mut(&channel.envelope) {
                    queue.retain(|&other| other != id);
                    if queue.is_empty() {
                        self.receives.remove(&channel.envelope);
                    }
                }
            }
        }
    }
}

impl LocalGroup {
    fn lock(&self) -> Result<MutexGuard<'_, Matching>, TransportError> {
        self.fabric
            .matching
            .lock()
            .map_err(|_| TransportError::Poisoned)
    }

    fn register(
        &self,
        direction: Direction,
        envelope: Envelope,
        buf: *mut u8,
        len: usize,
    ) -> Result<LocalRequest, TransportError> {
        let id = NEXT_CHANNEL.fetch_add(1, Ordering::Relaxed);
        let mut matching = self.lock()?;
        matching.channels.insert(
            id,
            Channel {
                direction,
                envelope,
                buf,
                len,
                phase: Phase::Inactive,
                error: None,
            },
        );
        trace!("registered {:?} channel {} for {:?}", direction, id, envelope);
        Ok(LocalRequest { id })
    }
}

impl Transport for LocalGroup {
    type Request = LocalRequest;

    fn size(&self) -> Rank {
        self.fabric.size
    }

    fn rank(&self) -> Rank {
        self.rank
    }

    unsafe fn send_init(
        &self,
        buf: *const u8,
        len: usize,
        destination: Rank,
        tag: Tag,
    ) -> Result<LocalRequest, TransportError> {
        check_rank(destination, self.fabric.size)?;
        let envelope = Envelope {
            source: self.rank,
            destination,
            tag,
        };
        self.register(Direction::Send, envelope, buf as *mut u8, len)
    }

    unsafe fn recv_init(
        &self,
        buf: *mut u8,
        len: usize,
        source: Rank,
        tag: Tag,
    ) -> Result<LocalRequest, TransportError> {
        check_rank(source, self.fabric.size)?;
        let envelope = Envelope {
            source,
            destination: self.rank,
            tag,
        };
        self.register(Direction::Receive, envelope, buf, len)
    }

    fn start(&self, request: &mut LocalRequest) -> Result<(), TransportError> {
        let id = request.id;
        let eager_limit = self.fabric.config.eager_limit;
        let mut matching = self.lock()?;

        let channel = matching.channel(id)?;
        if channel.phase == Phase::Active {
            return Err(TransportError::AlreadyActive);
        }
        channel.phase = Phase::Active;
        channel.error = None;
        let (direction, envelope, buf, len) =
            (channel.direction, channel.envelope, channel.buf, channel.len);

        let delivered = match direction {
            Direction::Send => {
                if let Some(receive) = matching.pop_receive(&envelope) {
                    matching.deliver(id, receive);
                    true
                } else if len <= eager_limit {
                    // SAFETY: `buf` is valid for reads of `len` bytes per `send_init`.
                    let payload =
                        unsafe { std::slice::from_raw_parts(buf as *const u8, len) }.to_vec();
                    matching.channel(id)?.phase = Phase::Complete;
                    matching
                        .sends
                        .entry(envelope)
                        .or_default()
                        .push_back(Message::Eager(payload));
                    true
                } else {
                    matching
                        .sends
                        .entry(envelope)
                        .or_default()
                        .push_back(Message::Rendezvous(id));
                    false
                }
            }
            Direction::Receive => match matching.pop_send(&envelope) {
                Some(Message::Rendezvous(send)) => {
                    matching.deliver(send, id);
                    true
                }
                Some(Message::Eager(payload)) => {
                    // SAFETY: `payload` is a live allocation of `payload.len()` bytes.
                    unsafe { matching.fill(id, payload.as_ptr(), payload.len()) };
                    true
                }
                None => {
                    matching.receives.entry(envelope).or_default().push_back(id);
                    false
                }
            },
        };
        drop(matching);

        if delivered {
            self.fabric.progress.notify_all();
        }
        Ok(())
    }

    fn test(&self, request: &mut LocalRequest) -> Result<bool, TransportError> {
        self.lock()?.channel(request.id)?.complete()
    }

    fn wait(&self, request: &mut LocalRequest) -> Result<(), TransportError> {
        let mut matching = self.lock()?;
        loop {
            let channel = matching.channel(request.id)?;
            if channel.phase != Phase::Active {
                return channel.complete().map(|_| ());
            }
            matching = self
                .fabric
                .progress
                .wait(matching)
                .map_err(|_| TransportError::Poisoned)?;
        }
    }

    fn free(&self, request: LocalRequest) -> Result<(), TransportError> {
        let mut matching = self.lock()?;
        let channel = matching
            .channels
            .remove(&request.id)
            .ok_or(TransportError::UnknownRequest)?;
        if channel.phase == Phase::Active {
            matching.withdraw(request.id, &channel);
        }
        trace!("released channel {} for {:?}", request.id, channel.envelope);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::thread;

    fn pair(config: LocalConfig) -> (LocalGroup, LocalGroup) {
        let universe = LocalUniverse::with_config(2, config);
        let mut groups = universe.groups().into_iter();
        (groups.next().unwrap(), groups.next().unwrap())
    }

    #[test]
    fn rendezvous_completes_once_both_sides_started() {
        let (zero, one) = pair(LocalConfig::new());
        let data = [1u8, 2, 3, 4];
        let mut received = [0u8; 4];

        let mut send = unsafe { zero.send_init(data.as_ptr(), 4, 1, 7) }.unwrap();
        let mut recv = unsafe { one.recv_init(received.as_mut_ptr(), 4, 0, 7) }.unwrap();

        zero.start(&mut send).unwrap();
        assert!(!zero.test(&mut send).unwrap());

        one.start(&mut recv).unwrap();
        assert!(zero.test(&mut send).unwrap());
        assert!(one.test(&mut recv).unwrap());

        zero.free(send).unwrap();
        one.free(recv).unwrap();
        assert_eq!(received, data);
    }

    #[test]
    fn inactive_channels_test_complete() {
        let (zero, _one) = pair(LocalConfig::new());
        let data = [0u8; 2];
        let mut send = unsafe { zero.send_init(data.as_ptr(), 2, 1, 0) }.unwrap();
        assert!(zero.test(&mut send).unwrap());
        zero.wait(&mut send).unwrap();
        zero.free(send).unwrap();
    }

    #[test]
    fn eager_send_completes_without_receive() {
        let (zero, one) = pair(LocalConfig::new().with_eager_limit(16));
        let data = [9u8; 8];
        let mut received = [0u8; 8];

        let mut send = unsafe { zero.send_init(data.as_ptr(), 8, 1, 3) }.unwrap();
        zero.start(&mut send).unwrap();
        assert!(zero.test(&mut send).unwrap());

        let mut recv = unsafe { one.recv_init(received.as_mut_ptr(), 8, 0, 3) }.unwrap();
        one.start(&mut recv).unwrap();
        one.wait(&mut recv).unwrap();

        zero.free(send).unwrap();
        one.free(recv).unwrap();
        assert_eq!(received, data);
    }

    #[test]
    fn truncation_is_reported_on_receive() {
        let (zero, one) = pair(LocalConfig::new());
        let data = [5u8; 8];
        let mut received = [0u8; 4];

        let mut recv = unsafe { one.recv_init(received.as_mut_ptr(), 4, 0, 1) }.unwrap();
        let mut send = unsafe { zero.send_init(data.as_ptr(), 8, 1, 1) }.unwrap();
        one.start(&mut recv).unwrap();
        zero.start(&mut send).unwrap();

        assert_eq!(
            one.test(&mut recv),
            Err(TransportError::Truncated {
                sent: 8,
                capacity: 4
            })
        );
        assert!(zero.test(&mut send).unwrap());
        zero.free(send).unwrap();
        one.free(recv).unwrap();
        assert_eq!(received, [5u8; 4]);
    }

    #[test]
    fn same_envelope_matches_in_start_order() {
        let (zero, one) = pair(LocalConfig::new());
        let first = [1u8];
        let second = [2u8];
        let mut received = [0u8];

        let mut a = unsafe { zero.send_init(first.as_ptr(), 1, 1, 4) }.unwrap();
        let mut b = unsafe { zero.send_init(second.as_ptr(), 1, 1, 4) }.unwrap();
        zero.start(&mut a).unwrap();
        zero.start(&mut b).unwrap();

        let mut recv = unsafe { one.recv_init(received.as_mut_ptr(), 1, 0, 4) }.unwrap();
        one.start(&mut recv).unwrap();
        one.wait(&mut recv).unwrap();
        assert_eq!(received[0], 1);
        assert!(zero.test(&mut a).unwrap());
        assert!(!zero.test(&mut b).unwrap());

        one.start(&mut recv).unwrap();
        one.wait(&mut recv).unwrap();
        assert_eq!(received[0], 2);

        zero.free(a).unwrap();
        zero.free(b).unwrap();
        one.free(recv).unwrap();
    }

    #[test]
    fn restarting_an_active_channel_fails() {
        let (zero, _one) = pair(LocalConfig::new());
        let data = [0u8; 1];
        let mut send = unsafe { zero.send_init(data.as_ptr(), 1, 1, 0) }.unwrap();
        zero.start(&mut send).unwrap();
        assert_eq!(zero.start(&mut send), Err(TransportError::AlreadyActive));
        zero.free(send).unwrap();
    }

    #[test]
    fn freeing_an_active_send_withdraws_it() {
        let (zero, one) = pair(LocalConfig::new());
        let data = [7u8; 2];
        let mut received = [0u8; 2];

        let mut send = unsafe { zero.send_init(data.as_ptr(), 2, 1, 2) }.unwrap();
        zero.start(&mut send).unwrap();
        zero.free(send).unwrap();

        let mut recv = unsafe { one.recv_init(received.as_mut_ptr(), 2, 0, 2) }.unwrap();
        one.start(&mut recv).unwrap();
        assert!(!one.test(&mut recv).unwrap());
        one.free(recv).unwrap();
        assert_eq!(received, [0u8; 2]);
    }

    #[test]
    fn invalid_peers_are_rejected() {
        let (zero, _one) = pair(LocalConfig::new());
        let data = [0u8; 1];
        assert_eq!(
            unsafe { zero.send_init(data.as_ptr(), 1, 2, 0) }.unwrap_err(),
            TransportError::InvalidRank { rank: 2, size: 2 }
        );
        assert!(LocalUniverse::new(2).group(-1).is_err());
    }

    #[test]
    fn foreign_handles_are_unknown() {
        let (zero, _one) = pair(LocalConfig::new());
        let (other, _) = pair(LocalConfig::new());
        let data = [0u8; 1];
        let mut send = unsafe { zero.send_init(data.as_ptr(), 1, 1, 0) }.unwrap();
        assert_eq!(other.test(&mut send), Err(TransportError::UnknownRequest));
        zero.free(send).unwrap();
    }

    #[test]
    fn wait_blocks_until_the_peer_starts() {
        let (zero, one) = pair(LocalConfig::new());
        let data: Vec<u8> = (0..64).collect();
        let mut received = vec![0u8; 64];

        thread::scope(|s| {
            let data = &data;
            s.spawn(move || {
                let mut send = unsafe { zero.send_init(data.as_ptr(), 64, 1, 11) }.unwrap();
                zero.start(&mut send).unwrap();
                zero.wait(&mut send).unwrap();
                zero.free(send).unwrap();
            });

            let mut recv = unsafe { one.recv_init(received.as_mut_ptr(), 64, 0, 11) }.unwrap();
            one.start(&mut recv).unwrap();
            one.wait(&mut recv).unwrap();
            one.free(recv).unwrap();
        });

        assert_eq!(received, data);
    }
}
