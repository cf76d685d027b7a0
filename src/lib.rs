#![deny(missing_docs)]

//! Partitioned point-to-point communication for Rust
//!
//! Partitioned communication splits one message into several *partitions* which are produced,
//! transferred and observed independently. A producer marks every partition ready as soon as its
//! data is available, so that the transfer of the first pieces overlaps with the computation of
//! the remaining ones, while the consumer and the rest of the application still see one message
//! with one completion. This is the communication pattern of the halo exchange in structured
//! mesh codes, where each face of a subdomain is packed, sent and unpacked in pieces.
//!
//! The protocol is implemented on top of persistent two-sided point-to-point requests: every
//! partition is one persistent channel, created once and restarted for every round of
//! communication. The substrate is abstracted by the `Transport` trait:
//!
//! - `transport::local::LocalGroup` connects threads of the same process,
//! - `transport::mpi::MpiGroup` uses MPI persistent requests (feature `mpi`).
//!
//! # Usage
//!
//! ```
//! use std::thread;
//!
//! use mpi_partitioned::transport::local::LocalUniverse;
//! use mpi_partitioned::{scope, PartitionedRequest};
//!
//! let universe = LocalUniverse::new(2);
//! let groups = universe.groups();
//!
//! thread::scope(|s| {
//!     let sender = &groups[0];
//!     s.spawn(move || {
//!         let mut field = vec![0.0f64; 40];
//!         scope(|scope| {
//!             let mut request =
//!                 PartitionedRequest::send_init(scope, sender, &mut field, 4, 10, 1, 0).unwrap();
//!             for round in 0..3 {
//!                 for partition in 0..4 {
//!                     // Produce partition `partition`, then hand it to the transport.
//!                     request.partition_mut(partition).unwrap().fill(round as f64);
//!                     request.pready(partition).unwrap();
//!                 }
//!                 request.wait().unwrap();
//!             }
//!             request.free().unwrap();
//!         });
//!     });
//!
//!     let mut halo = vec![0.0f64; 40];
//!     scope(|scope| {
//!         let mut request =
//!             PartitionedRequest::recv_init(scope, &groups[1], &mut halo, 4, 10, 0, 0).unwrap();
//!         for round in 0..3 {
//!             request.start().unwrap();
//!             request.wait().unwrap();
//!             assert!(request.buffer().unwrap().iter().all(|&x| x == round as f64));
//!         }
//!         request.free().unwrap();
//!     });
//! });
//! ```
//!
//! Requests are registered with a [`scope`](scope/fn.scope.html), which keeps their buffers
//! borrowed until every request is released, even if a request is leaked.
//!
//! # Features
//!
//! - Partitioned send and receive requests over any `Transport`
//! - Readiness per partition, per range and per list of partitions
//! - Arrival of individual partitions
//! - Completion of single requests and of slices of requests (all, any, some) in blocking and
//!   non-blocking variants
//! - `mpi`: MPI persistent requests through the `mpi` crate
//! - `complex`: `Equivalence` for `num_complex::Complex32` and `Complex64`
//!
//! Not supported:
//!
//! - Cancellation of partitioned requests
//! - Negotiation of partition counts between sender and receiver
//! - Message status objects

use std::os::raw::c_int;

pub mod datatype;
pub mod error;
pub mod partitioned;
pub mod scope;
pub mod transport;

pub use crate::error::{Error, FreeError, Result, TransportError};
pub use crate::partitioned::{
    start_all, test_all, test_any, test_some, wait_all, wait_any, wait_some, Indices,
    PartitionedRequest, Role, State,
};
pub use crate::scope::{scope, LocalScope, StaticScope};

/// Re-exports all traits.
pub mod traits {
    pub use crate::datatype::traits::*;
    pub use crate::scope::Scope;
    pub use crate::transport::traits::*;
}

/// Identifies a process within a group.
pub type Rank = c_int;
/// Can be used to tag messages on the sender side and match on the receiver side.
pub type Tag = c_int;
