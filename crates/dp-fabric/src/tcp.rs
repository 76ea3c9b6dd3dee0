//! Listen/connect/launch bootstrap: ranks are separate OS processes talking
//! over `std::net::TcpStream`. Traffic is demultiplexed by a one-byte frame
//! kind so barrier, broadcast and point-to-point messages can share one
//! socket per peer without stepping on each other.

use crate::{Fabric, FabricError};
use crossbeam_channel::{Receiver, Sender};
use std::io::{self, Read, Write};
use std::net::{TcpListener, TcpStream};
use std::process::{Command, Stdio};
use std::thread;

const KIND_BARRIER: u8 = 0;
const KIND_BROADCAST: u8 = 1;
const KIND_P2P: u8 = 2;

enum Frame {
    Barrier,
    Broadcast(Vec<u8>),
    P2p(Vec<u8>),
}

fn write_frame(stream: &mut TcpStream, frame: &Frame) -> io::Result<()> {
    match frame {
        Frame::Barrier => stream.write_all(&[KIND_BARRIER]),
        Frame::Broadcast(bytes) => write_payload(stream, KIND_BROADCAST, bytes),
        Frame::P2p(bytes) => write_payload(stream, KIND_P2P, bytes),
    }
}

fn write_payload(stream: &mut TcpStream, kind: u8, bytes: &[u8]) -> io::Result<()> {
    stream.write_all(&[kind])?;
    stream.write_all(&(bytes.len() as u64).to_le_bytes())?;
    stream.write_all(bytes)
}

fn read_frame(stream: &mut TcpStream) -> io::Result<Frame> {
    let mut kind = [0u8; 1];
    stream.read_exact(&mut kind)?;
    match kind[0] {
        KIND_BARRIER => Ok(Frame::Barrier),
        KIND_BROADCAST | KIND_P2P => {
            let mut len_buf = [0u8; 8];
            stream.read_exact(&mut len_buf)?;
            let len = u64::from_le_bytes(len_buf) as usize;
            let mut payload = vec![0u8; len];
            stream.read_exact(&mut payload)?;
            if kind[0] == KIND_BROADCAST {
                Ok(Frame::Broadcast(payload))
            } else {
                Ok(Frame::P2p(payload))
            }
        }
        other => Err(io::Error::new(
            io::ErrorKind::InvalidData,
            format!("unknown fabric frame kind {other}"),
        )),
    }
}

/// The live background-thread pair for one peer connection: a writer thread
/// draining an outbox, and a reader thread demultiplexing incoming frames
/// into per-kind channels.
struct PeerLink {
    outbox: Sender<Frame>,
    barrier_rx: Receiver<()>,
    broadcast_rx: Receiver<Vec<u8>>,
    p2p_rx: Receiver<Vec<u8>>,
}

impl PeerLink {
    fn spawn(peer_rank: u32, mut stream: TcpStream) -> io::Result<Self> {
        let mut writer_stream = stream.try_clone()?;
        let (outbox_tx, outbox_rx) = crossbeam_channel::unbounded::<Frame>();
        thread::Builder::new()
            .name(format!("dp-fabric-writer-{peer_rank}"))
            .spawn(move || {
                for frame in outbox_rx {
                    if write_frame(&mut writer_stream, &frame).is_err() {
                        break;
                    }
                }
            })
            .expect("spawning fabric writer thread");

        let (barrier_tx, barrier_rx) = crossbeam_channel::unbounded::<()>();
        let (broadcast_tx, broadcast_rx) = crossbeam_channel::unbounded::<Vec<u8>>();
        let (p2p_tx, p2p_rx) = crossbeam_channel::unbounded::<Vec<u8>>();
        thread::Builder::new()
            .name(format!("dp-fabric-reader-{peer_rank}"))
            .spawn(move || loop {
                match read_frame(&mut stream) {
                    Ok(Frame::Barrier) => {
                        if barrier_tx.send(()).is_err() {
                            break;
                        }
                    }
                    Ok(Frame::Broadcast(bytes)) => {
                        if broadcast_tx.send(bytes).is_err() {
                            break;
                        }
                    }
                    Ok(Frame::P2p(bytes)) => {
                        if p2p_tx.send(bytes).is_err() {
                            break;
                        }
                    }
                    Err(_) => break,
                }
            })
            .expect("spawning fabric reader thread");

        Ok(PeerLink {
            outbox: outbox_tx,
            barrier_rx,
            broadcast_rx,
            p2p_rx,
        })
    }
}

/// A launch-mode bootstrap command: the host spawns it and expects exactly
/// one line of stdout naming the port the worker side is listening on.
pub struct LaunchSpec {
    pub command: String,
    pub args: Vec<String>,
}

/// TCP-backed fabric. The host (rank 0) holds one [`PeerLink`] per worker;
/// each worker holds exactly one, to the host. Workers never talk directly
/// to one another — every hop goes through the host, matching the star
/// topology a real offload group uses for its control channel.
pub struct TcpFabric {
    rank: u32,
    size: u32,
    // Indexed by peer rank; `peers[rank]` is never populated for `self.rank`.
    peers: Vec<Option<PeerLink>>,
}

impl TcpFabric {
    /// Host side of listen mode: bind `bind_addr`, accept `n_workers`
    /// connections, and learn each worker's rank from a 4-byte handshake it
    /// sends immediately after connecting.
    pub fn listen(bind_addr: &str, n_workers: u32) -> io::Result<TcpFabric> {
        let listener = TcpListener::bind(bind_addr)?;
        let size = n_workers + 1;
        let mut peers: Vec<Option<PeerLink>> = (0..size).map(|_| None).collect();
        for _ in 0..n_workers {
            let (mut stream, _) = listener.accept()?;
            let mut rank_buf = [0u8; 4];
            stream.read_exact(&mut rank_buf)?;
            let worker_rank = u32::from_le_bytes(rank_buf);
            tracing::info!(target: "fabric", worker_rank, "worker connected");
            peers[worker_rank as usize] = Some(PeerLink::spawn(worker_rank, stream)?);
        }
        Ok(TcpFabric {
            rank: 0,
            size,
            peers,
        })
    }

    /// Worker side of listen/connect mode: dial the host at `host_addr`,
    /// announce `rank`, and hold the resulting link as peer 0.
    pub fn connect(host_addr: &str, rank: u32, size: u32) -> io::Result<TcpFabric> {
        let mut stream = TcpStream::connect(host_addr)?;
        stream.write_all(&rank.to_le_bytes())?;
        let mut peers: Vec<Option<PeerLink>> = (0..size).map(|_| None).collect();
        peers[0] = Some(PeerLink::spawn(0, stream)?);
        Ok(TcpFabric { rank, size, peers })
    }

    /// Host side of launch mode: spawn `spec`, parse the port it prints on
    /// its first line of stdout, then connect to it as a client. Supports a
    /// single launched worker process; chaining into a larger worker group
    /// is the launched process's own responsibility.
    pub fn launch(spec: &LaunchSpec) -> Result<TcpFabric, FabricError> {
        let mut child = Command::new(&spec.command)
            .args(&spec.args)
            .stdout(Stdio::piped())
            .spawn()?;
        let stdout = child.stdout.take().expect("piped stdout");
        let mut reader = io::BufReader::new(stdout);
        let mut line = String::new();
        let n = std::io::BufRead::read_line(&mut reader, &mut line)?;
        if n == 0 || line.trim().is_empty() {
            return Err(FabricError::NoPortLine);
        }
        let port: u16 = line
            .trim()
            .parse()
            .map_err(|_| FabricError::BadPortLine(line.clone()))?;
        let addr = format!("127.0.0.1:{port}");
        let mut stream = TcpStream::connect(addr)?;
        stream.write_all(&0u32.to_le_bytes())?;
        let peer = PeerLink::spawn(1, stream)?;
        Ok(TcpFabric {
            rank: 0,
            size: 2,
            peers: vec![None, Some(peer)],
        })
    }

    fn peer(&self, rank: u32) -> Result<&PeerLink, FabricError> {
        self.peers
            .get(rank as usize)
            .and_then(|p| p.as_ref())
            .ok_or(FabricError::RankOutOfRange(rank, self.size))
    }
}

impl Fabric for TcpFabric {
    fn rank(&self) -> u32 {
        self.rank
    }

    fn size(&self) -> u32 {
        self.size
    }

    fn barrier(&self) -> Result<(), FabricError> {
        if self.rank == 0 {
            for rank in 1..self.size {
                self.peer(rank)?
                    .outbox
                    .send(Frame::Barrier)
                    .map_err(|_| FabricError::Disconnect(rank))?;
            }
            for rank in 1..self.size {
                self.peer(rank)?
                    .barrier_rx
                    .recv()
                    .map_err(|_| FabricError::Disconnect(rank))?;
            }
            for rank in 1..self.size {
                self.peer(rank)?
                    .outbox
                    .send(Frame::Barrier)
                    .map_err(|_| FabricError::Disconnect(rank))?;
            }
        } else {
            let host = self.peer(0)?;
            host.outbox
                .send(Frame::Barrier)
                .map_err(|_| FabricError::Disconnect(0))?;
            host.barrier_rx.recv().map_err(|_| FabricError::Disconnect(0))?;
        }
        Ok(())
    }

    fn broadcast_from_root(&self, data: Option<&[u8]>) -> Result<Vec<u8>, FabricError> {
        if self.rank == 0 {
            let payload = data.expect("root must supply broadcast data").to_vec();
            for rank in 1..self.size {
                self.peer(rank)?
                    .outbox
                    .send(Frame::Broadcast(payload.clone()))
                    .map_err(|_| FabricError::Disconnect(rank))?;
            }
            Ok(payload)
        } else {
            self.peer(0)?
                .broadcast_rx
                .recv()
                .map_err(|_| FabricError::Disconnect(0))
        }
    }

    fn send_to(&self, dest: u32, data: &[u8]) -> Result<(), FabricError> {
        self.peer(dest)?
            .outbox
            .send(Frame::P2p(data.to_vec()))
            .map_err(|_| FabricError::Disconnect(dest))
    }

    fn recv_from(&self, src: u32) -> Result<Vec<u8>, FabricError> {
        self.peer(src)?
            .p2p_rx
            .recv()
            .map_err(|_| FabricError::Disconnect(src))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    #[test]
    fn listen_connect_point_to_point_round_trip() {
        let listener_thread = thread::spawn(|| TcpFabric::listen("127.0.0.1:38471", 1).unwrap());
        thread::sleep(std::time::Duration::from_millis(50));
        let worker = TcpFabric::connect("127.0.0.1:38471", 1, 2).unwrap();
        let host = listener_thread.join().unwrap();

        let host: Arc<dyn Fabric> = Arc::new(host);
        let worker: Arc<dyn Fabric> = Arc::new(worker);
        crate::contract_tests::exercise_point_to_point(host, worker);
    }

    #[test]
    fn broadcast_reaches_worker() {
        let listener_thread = thread::spawn(|| TcpFabric::listen("127.0.0.1:38472", 1).unwrap());
        thread::sleep(std::time::Duration::from_millis(50));
        let worker = TcpFabric::connect("127.0.0.1:38472", 1, 2).unwrap();
        let host = listener_thread.join().unwrap();

        let worker_handle =
            thread::spawn(move || worker.broadcast_from_root(None).unwrap());
        let sent = host.broadcast_from_root(Some(b"tile-data")).unwrap();
        assert_eq!(sent, b"tile-data");
        assert_eq!(worker_handle.join().unwrap(), b"tile-data");
    }

    #[test]
    fn unknown_rank_is_out_of_range() {
        let listener_thread = thread::spawn(|| TcpFabric::listen("127.0.0.1:38473", 1).unwrap());
        thread::sleep(std::time::Duration::from_millis(50));
        let _worker = TcpFabric::connect("127.0.0.1:38473", 1, 2).unwrap();
        let host = listener_thread.join().unwrap();
        assert!(matches!(
            host.send_to(5, b"x"),
            Err(FabricError::RankOutOfRange(5, 2))
        ));
    }
}
