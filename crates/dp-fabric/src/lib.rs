//! C1: the group fabric. A process-group abstraction with exactly three
//! primitives — barrier, broadcast-from-root, and point-to-point send/recv —
//! implemented by two concrete transports behind one [`Fabric`] trait.

mod tcp;
mod thread;

pub use tcp::{LaunchSpec, TcpFabric};
pub use thread::ThreadFabric;

use thiserror::Error;

#[derive(Debug, Error)]
pub enum FabricError {
    #[error("peer at rank {0} disconnected")]
    Disconnect(u32),
    #[error("rank {0} is out of range for a group of size {1}")]
    RankOutOfRange(u32, u32),
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("launch command produced no port line on stdout")]
    NoPortLine,
    #[error("launch command's port line was not a valid port number: {0}")]
    BadPortLine(String),
}

/// One rank's view of the process group: barrier, broadcast and
/// point-to-point delivery. Implementors own whatever transport backs these
/// primitives; callers never see the transport.
pub trait Fabric: Send + Sync {
    /// This process's rank within the group. Rank 0 is always the host.
    fn rank(&self) -> u32;

    /// Total number of ranks in the group, including the host.
    fn size(&self) -> u32;

    /// Block until every rank in the group has called `barrier`.
    fn barrier(&self) -> Result<(), FabricError>;

    /// Root (rank 0) calls this with `Some(data)` to broadcast; every other
    /// rank calls it with `None` and receives the broadcast bytes back.
    fn broadcast_from_root(&self, data: Option<&[u8]>) -> Result<Vec<u8>, FabricError>;

    /// Send a byte buffer to a specific rank.
    fn send_to(&self, dest: u32, data: &[u8]) -> Result<(), FabricError>;

    /// Receive the next byte buffer sent to us from `src`.
    fn recv_from(&self, src: u32) -> Result<Vec<u8>, FabricError>;
}

#[cfg(test)]
mod contract_tests {
    use super::*;
    use std::sync::Arc;

    /// Exercises the three primitives identically against both fabrics —
    /// the test suite treats `Fabric` implementors as interchangeable.
    pub fn exercise_point_to_point(host: Arc<dyn Fabric>, worker: Arc<dyn Fabric>) {
        let host_rank = host.rank();
        let worker_rank = worker.rank();
        let sender = std::thread::spawn(move || {
            host.send_to(worker_rank, b"ping").unwrap();
            let reply = host.recv_from(worker_rank).unwrap();
            assert_eq!(reply, b"pong");
        });
        worker.barrier().ok();
        let msg = worker.recv_from(host_rank).unwrap();
        assert_eq!(msg, b"ping");
        worker.send_to(host_rank, b"pong").unwrap();
        sender.join().unwrap();
    }
}
