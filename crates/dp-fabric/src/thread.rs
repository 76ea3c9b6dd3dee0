//! Co-launched bootstrap: every rank is an OS thread in one process, joined
//! by `crossbeam-channel`s instead of real process-to-process sockets.

use crate::{Fabric, FabricError};
use crossbeam_channel::{Receiver, Sender};
use std::sync::{Arc, Barrier};

/// One rank's endpoint set within a [`ThreadFabric`] group.
pub struct ThreadFabric {
    rank: u32,
    size: u32,
    barrier: Arc<Barrier>,
    // p2p[i] is this rank's inbox for messages sent by rank i.
    inboxes: Vec<Receiver<Vec<u8>>>,
    outboxes: Vec<Sender<Vec<u8>>>,
    bcast_tx: Sender<Vec<u8>>,
    bcast_rx: Receiver<Vec<u8>>,
}

impl ThreadFabric {
    /// Build a full group of `size` ranks, each with its own endpoint set.
    /// Rank 0 is the host by convention.
    pub fn group(size: u32) -> Vec<ThreadFabric> {
        assert!(size > 0, "a fabric group needs at least one rank");
        let barrier = Arc::new(Barrier::new(size as usize));

        // channels[src][dst] carries messages from src to dst.
        let mut channels: Vec<Vec<(Sender<Vec<u8>>, Receiver<Vec<u8>>)>> = (0..size)
            .map(|_| (0..size).map(|_| crossbeam_channel::unbounded()).collect())
            .collect();

        // One bounded broadcast channel per "round": root sends, everyone
        // (including root) receives its own message back through this same
        // channel so `broadcast_from_root` has one code path for all ranks.
        let (bcast_tx, bcast_rx) = crossbeam_channel::unbounded::<Vec<u8>>();

        let mut fabrics = Vec::with_capacity(size as usize);
        for dst in 0..size {
            let mut inboxes = Vec::with_capacity(size as usize);
            let mut outboxes = Vec::with_capacity(size as usize);
            for src in 0..size {
                let (tx, rx) = std::mem::replace(
                    &mut channels[src as usize][dst as usize],
                    crossbeam_channel::unbounded(),
                );
                inboxes.push(rx);
                outboxes.push(tx);
            }
            fabrics.push(ThreadFabric {
                rank: dst,
                size,
                barrier: barrier.clone(),
                inboxes,
                outboxes,
                bcast_tx: bcast_tx.clone(),
                bcast_rx: bcast_rx.clone(),
            });
        }
        fabrics
    }
}

impl Fabric for ThreadFabric {
    fn rank(&self) -> u32 {
        self.rank
    }

    fn size(&self) -> u32 {
        self.size
    }

    fn barrier(&self) -> Result<(), FabricError> {
        self.barrier.wait();
        Ok(())
    }

    fn broadcast_from_root(&self, data: Option<&[u8]>) -> Result<Vec<u8>, FabricError> {
        if self.rank == 0 {
            let payload = data.expect("root must supply broadcast data").to_vec();
            for _ in 0..self.size {
                self.bcast_tx
                    .send(payload.clone())
                    .map_err(|_| FabricError::Disconnect(0))?;
            }
        }
        self.bcast_rx.recv().map_err(|_| FabricError::Disconnect(0))
    }

    fn send_to(&self, dest: u32, data: &[u8]) -> Result<(), FabricError> {
        let outbox = self
            .outboxes
            .get(dest as usize)
            .ok_or(FabricError::RankOutOfRange(dest, self.size))?;
        outbox
            .send(data.to_vec())
            .map_err(|_| FabricError::Disconnect(dest))
    }

    fn recv_from(&self, src: u32) -> Result<Vec<u8>, FabricError> {
        let inbox = self
            .inboxes
            .get(src as usize)
            .ok_or(FabricError::RankOutOfRange(src, self.size))?;
        inbox.recv().map_err(|_| FabricError::Disconnect(src))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    #[test]
    fn barrier_releases_every_rank() {
        let group = ThreadFabric::group(4);
        let handles: Vec<_> = group
            .into_iter()
            .map(|f| std::thread::spawn(move || f.barrier().unwrap()))
            .collect();
        for h in handles {
            h.join().unwrap();
        }
    }

    #[test]
    fn broadcast_delivers_identical_bytes_to_every_rank() {
        let group = ThreadFabric::group(3);
        let mut iter = group.into_iter();
        let root = iter.next().unwrap();
        let workers: Vec<_> = iter.collect();

        let root_handle =
            std::thread::spawn(move || root.broadcast_from_root(Some(b"hello")).unwrap());
        let worker_handles: Vec<_> = workers
            .into_iter()
            .map(|w| std::thread::spawn(move || w.broadcast_from_root(None).unwrap()))
            .collect();

        assert_eq!(root_handle.join().unwrap(), b"hello");
        for h in worker_handles {
            assert_eq!(h.join().unwrap(), b"hello");
        }
    }

    #[test]
    fn point_to_point_round_trip() {
        let group = ThreadFabric::group(2);
        let mut iter = group.into_iter();
        let host = Arc::new(iter.next().unwrap()) as Arc<dyn Fabric>;
        let worker = Arc::new(iter.next().unwrap()) as Arc<dyn Fabric>;
        crate::contract_tests::exercise_point_to_point(host, worker);
    }

    #[test]
    fn send_to_unknown_rank_is_out_of_range() {
        let group = ThreadFabric::group(2);
        let host = &group[0];
        assert!(matches!(
            host.send_to(9, b"x"),
            Err(FabricError::RankOutOfRange(9, 2))
        ));
    }
}
