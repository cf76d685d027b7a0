//! MPI persistent requests as a partitioned-communication substrate
//!
//! `MpiGroup` turns any communicator of the `mpi` crate into a `Transport`. Partitions are
//! transferred as `MPI_UINT8_T` messages of `count * extent` bytes, created with
//! `MPI_Send_init()` and `MPI_Recv_init()`, started with `MPI_Start()`/`MPI_Startall()` and
//! completed with `MPI_Test()`/`MPI_Wait()`/`MPI_Waitall()`.
//!
//! # Examples
//!
//! See `demos/halo_exchange.rs`
//!
//! # Standard section(s)
//!
//! 3.9

use std::mem::MaybeUninit;
use std::os::raw::{c_int, c_void};

use conv::ConvUtil;
use mpi::datatype::Equivalence;
use mpi::ffi;
use mpi::ffi::{MPI_Request, MPI_Status};
use mpi::raw::AsRaw;
use mpi::topology::Communicator;

use super::{check_rank, Transport};
use crate::error::TransportError;
use crate::{Rank, Tag};

const MPI_SUCCESS: c_int = ffi::MPI_SUCCESS as c_int;

/// A communicator used as the group of partitioned requests
#[derive(Debug)]
pub struct MpiGroup<C> {
    comm: C,
}

impl<C: Communicator> MpiGroup<C> {
    /// Communicate through `comm`.
    pub fn new(comm: C) -> Self {
        MpiGroup { comm }
    }

    /// The wrapped communicator
    pub fn communicator(&self) -> &C {
        &self.comm
    }

    /// Recover the wrapped communicator
    pub fn into_inner(self) -> C {
        self.comm
    }
}

/// Handle of an MPI persistent request
#[derive(Debug)]
#[repr(transparent)]
pub struct MpiRequest(MPI_Request);

impl MpiRequest {
    /// The raw request handle
    pub fn as_raw(&self) -> MPI_Request {
        self.0
    }
}

fn check(function: &'static str, code: c_int) -> Result<(), TransportError> {
    if code == MPI_SUCCESS {
        Ok(())
    } else {
        Err(TransportError::Mpi { function, code })
    }
}

fn to_count(len: usize) -> Result<c_int, TransportError> {
    len.value_as::<c_int>()
        .map_err(|_| TransportError::CountOverflow(len))
}

impl<C: Communicator> Transport for MpiGroup<C> {
    type Request = MpiRequest;

    fn size(&self) -> Rank {
        self.comm.size()
    }

    fn rank(&self) -> Rank {
        self.comm.rank()
    }

    unsafe fn send_init(
        &self,
        buf: *const u8,
        len: usize,
        destination: Rank,
        tag: Tag,
    ) -> Result<MpiRequest, TransportError> {
        check_rank(destination, self.comm.size())?;
        let count = to_count(len)?;
        let mut request = MaybeUninit::<MPI_Request>::uninit();
        check(
            "MPI_Send_init",
            ffi::MPI_Send_init(
                buf as *const c_void as *mut c_void,
                count,
                u8::equivalent_datatype().as_raw(),
                destination,
                tag,
                self.comm.as_raw(),
                request.as_mut_ptr(),
            ),
        )?;
        Ok(MpiRequest(request.assume_init()))
    }

    unsafe fn recv_init(
        &self,
        buf: *mut u8,
        len: usize,
        source: Rank,
        tag: Tag,
    ) -> Result<MpiRequest, TransportError> {
        check_rank(source, self.comm.size())?;
        let count = to_count(len)?;
        let mut request = MaybeUninit::<MPI_Request>::uninit();
        check(
            "MPI_Recv_init",
            ffi::MPI_Recv_init(
                buf as *mut c_void,
                count,
                u8::equivalent_datatype().as_raw(),
                source,
                tag,
                self.comm.as_raw(),
                request.as_mut_ptr(),
            ),
        )?;
        Ok(MpiRequest(request.assume_init()))
    }

    fn start(&self, request: &mut MpiRequest) -> Result<(), TransportError> {
        check("MPI_Start", unsafe { ffi::MPI_Start(&mut request.0) })
    }

    fn start_all(&self, requests: &mut [MpiRequest]) -> Result<(), TransportError> {
        let count = to_count(requests.len())?;
        // `MpiRequest` is a plain wrapper, so the slice can be handed over as an array of
        // `MPI_Request`.
        let raw = requests.as_mut_ptr() as *mut MPI_Request;
        check("MPI_Startall", unsafe { ffi::MPI_Startall(count, raw) })
    }

    fn test(&self, request: &mut MpiRequest) -> Result<bool, TransportError> {
        let mut flag: c_int = 0;
        let mut status = MaybeUninit::<MPI_Status>::uninit();
        check("MPI_Test", unsafe {
            ffi::MPI_Test(&mut request.0, &mut flag, status.as_mut_ptr())
        })?;
        Ok(flag != 0)
    }

    fn wait(&self, request: &mut MpiRequest) -> Result<(), TransportError> {
        let mut status = MaybeUninit::<MPI_Status>::uninit();
        check("MPI_Wait", unsafe {
            ffi::MPI_Wait(&mut request.0, status.as_mut_ptr())
        })
    }

    fn wait_all(&self, requests: &mut [MpiRequest]) -> Result<(), TransportError> {
        let count = to_count(requests.len())?;
        let mut statuses: Vec<MaybeUninit<MPI_Status>> =
            (0..requests.len()).map(|_| MaybeUninit::uninit()).collect();
        let raw = requests.as_mut_ptr() as *mut MPI_Request;
        check("MPI_Waitall", unsafe {
            ffi::MPI_Waitall(count, raw, statuses.as_mut_ptr() as *mut MPI_Status)
        })
    }

    fn free(&self, mut request: MpiRequest) -> Result<(), TransportError> {
        // An active persistent request keeps using its buffer after `MPI_Request_free()`, so it
        // is completed first.
        self.wait(&mut request)?;
        check("MPI_Request_free", unsafe {
            ffi::MPI_Request_free(&mut request.0)
        })
    }
}
