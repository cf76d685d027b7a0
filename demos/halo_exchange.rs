#![deny(warnings)]
#![allow(clippy::float_cmp)]

//! Exchange the boundary faces of a 1D domain decomposition around a ring.
//!
//! Run with `mpiexec -n 2 target/debug/examples/halo_exchange` (any number of processes works).

use mpi::traits::*;
use mpi_partitioned::transport::mpi::MpiGroup;
use mpi_partitioned::{start_all, wait_all, PartitionedRequest};

const PARTITIONS: usize = 4;
const COUNT: usize = 256;
const ITERATIONS: usize = 10;

fn main() {
    let universe = mpi::initialize().unwrap();
    let world = universe.world();
    let rank = world.rank();
    let size = world.size();
    let right = (rank + 1) % size;
    let left = (rank - 1 + size) % size;

    let group = MpiGroup::new(world);
    let mut face = vec![0.0f64; PARTITIONS * COUNT];
    let mut ghost = vec![0.0f64; PARTITIONS * COUNT];

    mpi_partitioned::scope(|scope| {
        let mut send =
            PartitionedRequest::send_init(scope, &group, &mut face, PARTITIONS, COUNT, right, 0)
                .unwrap();
        let mut recv = vec![PartitionedRequest::recv_init(
            scope, &group, &mut ghost, PARTITIONS, COUNT, left, 0,
        )
        .unwrap()];

        for iteration in 0..ITERATIONS {
            start_all(&mut recv).unwrap();
            send.start().unwrap();

            // Pack the face in reverse order, partitions are independent.
            for partition in (0..PARTITIONS).rev() {
                let value = (iteration * 1000) as f64 + rank as f64;
                send.partition_mut(partition).unwrap().fill(value);
                send.pready(partition).unwrap();
            }

            wait_all(&mut recv).unwrap();
            send.wait().unwrap();

            let expected = (iteration * 1000) as f64 + left as f64;
            assert!(recv[0].buffer().unwrap().iter().all(|&x| x == expected));
        }

        send.free().unwrap();
        for request in recv {
            request.free().unwrap();
        }
    });

    println!(
        "Rank {} exchanged {} iterations of {} partitions with ranks {} and {}",
        rank, ITERATIONS, PARTITIONS, left, right
    );
}
