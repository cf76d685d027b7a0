#![deny(warnings)]
#![allow(clippy::float_cmp)]

use std::thread;

use mpi_partitioned::transport::local::{LocalConfig, LocalUniverse};
use mpi_partitioned::traits::*;
use mpi_partitioned::{scope, PartitionedRequest};

const PARTITIONS: usize = 8;
const COUNT: usize = 1024;
const ROUNDS: usize = 4;

fn produce(round: usize, partition: usize, out: &mut [f64]) {
    for (i, x) in out.iter_mut().enumerate() {
        *x = (round * PARTITIONS * COUNT + partition * COUNT + i) as f64;
    }
}

fn main() {
    let universe = LocalUniverse::with_config(2, LocalConfig::new().with_eager_limit(4096));
    let groups = universe.groups();

    thread::scope(|s| {
        let producer = &groups[0];
        s.spawn(move || {
            let mut field = vec![0.0f64; PARTITIONS * COUNT];
            scope(|scope| {
                let mut request = PartitionedRequest::send_init(
                    scope, producer, &mut field, PARTITIONS, COUNT, 1, 0,
                )
                .unwrap();
                for round in 0..ROUNDS {
                    request.start().unwrap();
                    // Hand over every partition as soon as it has been computed.
                    for partition in 0..PARTITIONS {
                        produce(round, partition, request.partition_mut(partition).unwrap());
                        request.pready(partition).unwrap();
                    }
                    request.wait().unwrap();
                }
                request.free().unwrap();
            });
        });

        let consumer = &groups[1];
        println!("Consumer is rank {} of {}", consumer.rank(), consumer.size());

        let mut halo = vec![0.0f64; PARTITIONS * COUNT];
        let mut expected = vec![0.0f64; COUNT];
        scope(|scope| {
            let mut request = PartitionedRequest::recv_init(
                scope, consumer, &mut halo, PARTITIONS, COUNT, 0, 0,
            )
            .unwrap();
            for round in 0..ROUNDS {
                request.start().unwrap();
                let mut consumed = [false; PARTITIONS];
                let mut order = Vec::with_capacity(PARTITIONS);
                while order.len() < PARTITIONS {
                    for partition in 0..PARTITIONS {
                        if !consumed[partition] && request.parrived(partition).unwrap() {
                            produce(round, partition, &mut expected);
                            assert_eq!(request.partition(partition).unwrap(), &expected[..]);
                            consumed[partition] = true;
                            order.push(partition);
                        }
                    }
                    thread::yield_now();
                }
                assert!(request.test().unwrap());
                println!("Round {} consumed partitions in order {:?}", round, order);
            }
            request.free().unwrap();
        });
    });
}
