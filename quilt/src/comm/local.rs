// Copyright 2026 the Quilt Authors
// SPDX-License-Identifier: Apache-2.0 OR MIT

//! An in-process fabric for tests and single-machine runs.
//!
//! Every pair of ranks gets a dedicated FIFO lane for collective traffic,
//! so positional matching of collective calls works without message tags;
//! tile messages travel on separate per-rank queues and are handed to a
//! delivery thread, mirroring a messaging layer that delivers inbound
//! messages on its own thread.

use std::sync::{Arc, Barrier};
use std::thread;

use crossbeam_channel::{unbounded, Receiver, Sender};
use quilt_common::Message;

use super::Fabric;

/// One rank's endpoint of an in-process fabric group.
pub struct LocalFabric {
    rank: usize,
    size: usize,
    /// Collective lanes to each destination rank.
    lanes_out: Vec<Sender<Vec<u8>>>,
    /// Collective lanes from each source rank.
    lanes_in: Vec<Receiver<Vec<u8>>>,
    /// Tile message queues of every rank.
    messages_out: Vec<Sender<Arc<Message>>>,
    barrier: Arc<Barrier>,
}

/// A constructed rank: its fabric endpoint plus the inbound tile-message
/// queue to drain with [`spawn_delivery`].
pub struct LocalRank {
    pub fabric: Arc<LocalFabric>,
    pub messages: Receiver<Arc<Message>>,
}

impl LocalFabric {
    /// Create a connected group of `size` ranks.
    pub fn group(size: usize) -> Vec<LocalRank> {
        assert!(size > 0, "a fabric group needs at least one rank");
        let barrier = Arc::new(Barrier::new(size));

        let mut lane_grid: Vec<Vec<Option<(Sender<Vec<u8>>, Receiver<Vec<u8>>)>>> = (0..size)
            .map(|_| (0..size).map(|_| Some(unbounded())).collect())
            .collect();
        let message_channels: Vec<(Sender<Arc<Message>>, Receiver<Arc<Message>>)> =
            (0..size).map(|_| unbounded()).collect();

        let mut lanes_out: Vec<Vec<Sender<Vec<u8>>>> = (0..size).map(|_| Vec::new()).collect();
        let mut lanes_in: Vec<Vec<Receiver<Vec<u8>>>> = (0..size).map(|_| Vec::new()).collect();
        for src in 0..size {
            for dst in 0..size {
                let (tx, rx) = lane_grid[src][dst].take().expect("lane taken twice");
                lanes_out[src].push(tx);
                lanes_in[dst].push(rx);
            }
        }

        let messages_out: Vec<Sender<Arc<Message>>> = message_channels
            .iter()
            .map(|(tx, _)| tx.clone())
            .collect();

        lanes_out
            .into_iter()
            .zip(lanes_in)
            .zip(message_channels)
            .enumerate()
            .map(|(rank, ((out, inbox), (_, messages)))| LocalRank {
                fabric: Arc::new(Self {
                    rank,
                    size,
                    lanes_out: out,
                    lanes_in: inbox,
                    messages_out: messages_out.clone(),
                    barrier: barrier.clone(),
                }),
                messages,
            })
            .collect()
    }
}

impl Fabric for LocalFabric {
    fn rank(&self) -> usize {
        self.rank
    }

    fn size(&self) -> usize {
        self.size
    }

    fn send_to(&self, rank: usize, message: Arc<Message>) {
        self.messages_out[rank]
            .send(message)
            .expect("tile message queue disconnected");
    }

    fn broadcast(&self, root: usize, buf: &mut [u8]) {
        if self.rank == root {
            for dst in 0..self.size {
                if dst != root {
                    self.lanes_out[dst]
                        .send(buf.to_vec())
                        .expect("collective lane disconnected");
                }
            }
        } else {
            let data = self.lanes_in[root]
                .recv()
                .expect("collective lane disconnected");
            assert_eq!(data.len(), buf.len(), "broadcast buffer size mismatch");
            buf.copy_from_slice(&data);
        }
    }

    fn gather_u64(&self, root: usize, value: u64) -> Option<Vec<u64>> {
        if self.rank != root {
            self.lanes_out[root]
                .send(value.to_le_bytes().to_vec())
                .expect("collective lane disconnected");
            return None;
        }
        Some(
            (0..self.size)
                .map(|src| {
                    if src == root {
                        value
                    } else {
                        let data = self.lanes_in[src]
                            .recv()
                            .expect("collective lane disconnected");
                        u64::from_le_bytes(data.as_slice().try_into().expect("gather word size"))
                    }
                })
                .collect(),
        )
    }

    fn gather_bytes(&self, root: usize, bytes: &[u8]) -> Option<Vec<Vec<u8>>> {
        if self.rank != root {
            self.lanes_out[root]
                .send(bytes.to_vec())
                .expect("collective lane disconnected");
            return None;
        }
        Some(
            (0..self.size)
                .map(|src| {
                    if src == root {
                        bytes.to_vec()
                    } else {
                        self.lanes_in[src]
                            .recv()
                            .expect("collective lane disconnected")
                    }
                })
                .collect(),
        )
    }

    fn barrier(&self) {
        self.barrier.wait();
    }
}

/// Drain a rank's inbound tile messages on a dedicated thread.
///
/// The thread exits when every sending endpoint of the group has been
/// dropped.
pub fn spawn_delivery<F>(messages: Receiver<Arc<Message>>, handler: F) -> thread::JoinHandle<()>
where
    F: Fn(Arc<Message>) + Send + 'static,
{
    thread::spawn(move || {
        for message in messages.iter() {
            handler(message);
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use quilt_common::wire;

    fn on_ranks<F>(size: usize, body: F)
    where
        F: Fn(usize, Arc<LocalFabric>) + Send + Sync + 'static,
    {
        let body = Arc::new(body);
        let handles: Vec<_> = LocalFabric::group(size)
            .into_iter()
            .enumerate()
            .map(|(rank, endpoint)| {
                let body = body.clone();
                thread::spawn(move || body(rank, endpoint.fabric))
            })
            .collect();
        for handle in handles {
            handle.join().expect("rank thread panicked");
        }
    }

    #[test]
    fn broadcast_reaches_every_rank() {
        on_ranks(3, |rank, fabric| {
            let mut buf = if rank == 0 { vec![7u8; 16] } else { vec![0u8; 16] };
            fabric.broadcast(0, &mut buf);
            assert_eq!(buf, vec![7u8; 16]);
        });
    }

    #[test]
    fn gathers_are_indexed_by_source() {
        on_ranks(3, |rank, fabric| {
            let words = fabric.gather_u64(0, rank as u64 * 10);
            let blobs = fabric.gather_bytes(0, &[rank as u8; 3]);
            if rank == 0 {
                assert_eq!(words.unwrap(), vec![0, 10, 20]);
                assert_eq!(
                    blobs.unwrap(),
                    vec![vec![0u8; 3], vec![1u8; 3], vec![2u8; 3]]
                );
            } else {
                assert!(words.is_none());
                assert!(blobs.is_none());
            }
            fabric.barrier();
        });
    }

    #[test]
    fn tile_messages_reach_the_delivery_thread() {
        let mut group = LocalFabric::group(2);
        let receiver_side = group.remove(1);
        let sender_side = group.remove(0);

        let (seen_tx, seen_rx) = unbounded();
        let delivery = spawn_delivery(receiver_side.messages, move |message| {
            seen_tx.send(message.command()).unwrap();
        });

        sender_side
            .fabric
            .send_to(1, Arc::new(wire::cancel_message()));
        assert_eq!(seen_rx.recv().unwrap(), wire::CANCEL_RENDERING);

        drop(sender_side);
        drop(receiver_side.fabric);
        delivery.join().unwrap();
    }
}
