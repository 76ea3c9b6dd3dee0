//! C4: the host-side command buffer and its flush policy — inline vs.
//! sidechannel payloads, automatic flush triggers, and the flush protocol
//! itself (a `u64` byte-count header broadcast ahead of the batched bytes).

use dp_codec::{Command, Encoder, WireEncode};
use dp_fabric::{Fabric, FabricError};
use std::sync::atomic::{AtomicU64, Ordering};
use thiserror::Error;

/// Payload size at or below which a shared-data buffer is serialized inline
/// into the command stream rather than sent as a separate broadcast.
pub const DEFAULT_INLINE_THRESHOLD: usize = 4 * 1024 * 1024;
/// Buffer size that forces an automatic flush.
pub const DEFAULT_AUTO_FLUSH_BYTES: usize = 512 * 1024 * 1024;
/// Batched command count that forces an automatic flush.
pub const DEFAULT_AUTO_FLUSH_COMMANDS: usize = 8192;

#[derive(Debug, Error)]
pub enum BufferError {
    #[error(transparent)]
    Fabric(#[from] FabricError),
}

const KIND_SIDECHANNEL: u8 = 0;
const KIND_FLUSH_HEADER: u8 = 1;

/// What an incoming root broadcast turned out to be. A worker cannot tell
/// sidechannel payloads and flush headers apart from size alone, so every
/// root broadcast carries a one-byte discriminator ahead of its content.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BroadcastFrame {
    Sidechannel(Vec<u8>),
    FlushHeader(u64),
}

impl BroadcastFrame {
    pub fn decode(bytes: &[u8]) -> Option<BroadcastFrame> {
        match bytes.first() {
            Some(&KIND_SIDECHANNEL) => Some(BroadcastFrame::Sidechannel(bytes[1..].to_vec())),
            Some(&KIND_FLUSH_HEADER) if bytes.len() >= 9 => {
                let mut len_buf = [0u8; 8];
                len_buf.copy_from_slice(&bytes[1..9]);
                Some(BroadcastFrame::FlushHeader(u64::from_le_bytes(len_buf)))
            }
            _ => None,
        }
    }
}

fn encode_sidechannel(payload: &[u8]) -> Vec<u8> {
    let mut out = Vec::with_capacity(payload.len() + 1);
    out.push(KIND_SIDECHANNEL);
    out.extend_from_slice(payload);
    out
}

fn encode_flush_header(total_len: u64) -> [u8; 9] {
    let mut out = [0u8; 9];
    out[0] = KIND_FLUSH_HEADER;
    out[1..].copy_from_slice(&total_len.to_le_bytes());
    out
}

/// Tunable knobs for [`CommandBuffer`]; defaults match the documented
/// defaults (4 MiB inline threshold, 512 MiB / 8192-command auto-flush).
#[derive(Debug, Clone, Copy)]
pub struct BufferPolicy {
    pub inline_threshold: usize,
    pub auto_flush_bytes: usize,
    pub auto_flush_commands: usize,
}

impl Default for BufferPolicy {
    fn default() -> Self {
        Self {
            inline_threshold: DEFAULT_INLINE_THRESHOLD,
            auto_flush_bytes: DEFAULT_AUTO_FLUSH_BYTES,
            auto_flush_commands: DEFAULT_AUTO_FLUSH_COMMANDS,
        }
    }
}

/// Tracks whether the buffer currently holds a shared-data reference that a
/// "copy shared data" command must not race past (§4.4's shared-data
/// hazard).
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
struct SharedDataHazard {
    pending: bool,
}

/// The host's batching buffer for one outgoing command stream.
pub struct CommandBuffer<F: Fabric> {
    fabric: F,
    policy: BufferPolicy,
    bytes: Vec<u8>,
    command_count: usize,
    hazard: SharedDataHazard,
    flushes: AtomicU64,
}

impl<F: Fabric> CommandBuffer<F> {
    pub fn new(fabric: F) -> Self {
        Self::with_policy(fabric, BufferPolicy::default())
    }

    pub fn with_policy(fabric: F, policy: BufferPolicy) -> Self {
        Self {
            fabric,
            policy,
            bytes: Vec::new(),
            command_count: 0,
            hazard: SharedDataHazard::default(),
            flushes: AtomicU64::new(0),
        }
    }

    pub fn fabric(&self) -> &F {
        &self.fabric
    }

    pub fn pending_bytes(&self) -> usize {
        self.bytes.len()
    }

    pub fn pending_commands(&self) -> usize {
        self.command_count
    }

    pub fn flush_count(&self) -> u64 {
        self.flushes.load(Ordering::Relaxed)
    }

    /// Send a large payload as its own sidechannel broadcast, ahead of the
    /// command that will reference it. Callers use this when a payload
    /// exceeds [`BufferPolicy::inline_threshold`].
    pub fn send_sidechannel(&mut self, payload: &[u8]) -> Result<(), BufferError> {
        let framed = encode_sidechannel(payload);
        self.fabric.broadcast_from_root(Some(&framed))?;
        self.hazard.pending = true;
        Ok(())
    }

    /// Record a "copy shared data" enqueue, flushing first if a prior
    /// shared-data reference is still outstanding in the buffer so that
    /// workers observe the two operations in program order.
    pub fn enqueue_copy_shared_data(&mut self, command: Command) -> Result<(), BufferError> {
        if self.hazard.pending {
            self.flush()?;
        }
        self.enqueue(command)
    }

    /// Batch one command, serializing its payload inline if it is ≤ the
    /// inline threshold, or treating it as referencing data already sent via
    /// [`Self::send_sidechannel`]. Auto-flushes per §4.4's triggers.
    pub fn enqueue(&mut self, command: Command) -> Result<(), BufferError> {
        let flushing = command.flushing();
        let mut enc = Encoder::new();
        command.encode_record(&mut enc);
        self.bytes.extend_from_slice(enc.as_bytes());
        self.command_count += 1;
        if matches!(command, Command::NewData { .. }) {
            self.hazard.pending = false;
        }

        if flushing
            || self.bytes.len() > self.policy.auto_flush_bytes
            || self.command_count > self.policy.auto_flush_commands
        {
            self.flush()?;
        }
        Ok(())
    }

    /// Release of an object whose state the host must observe forces a
    /// flush even though `Release` itself is not in the `flushing()` list.
    pub fn enqueue_observed_release(&mut self, command: Command) -> Result<(), BufferError> {
        self.enqueue(command)?;
        self.flush()
    }

    /// Broadcast `u64 total-payload-bytes` then the concatenated buffer,
    /// then clear it. A no-op when nothing is batched.
    pub fn flush(&mut self) -> Result<(), BufferError> {
        if self.bytes.is_empty() {
            return Ok(());
        }
        let header = encode_flush_header(self.bytes.len() as u64);
        self.fabric.broadcast_from_root(Some(&header))?;
        self.fabric.broadcast_from_root(Some(&self.bytes))?;
        tracing::debug!(
            target: "buffer",
            bytes = self.bytes.len(),
            commands = self.command_count,
            "flush"
        );
        self.bytes.clear();
        self.command_count = 0;
        self.hazard.pending = false;
        self.flushes.fetch_add(1, Ordering::Relaxed);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use dp_codec::ObjectKind;
    use dp_fabric::ThreadFabric;
    use dp_handle::Handle;
    use std::thread;

    fn receive_flush(worker: &impl Fabric) -> Vec<u8> {
        let header = worker.broadcast_from_root(None).unwrap();
        let total = match BroadcastFrame::decode(&header) {
            Some(BroadcastFrame::FlushHeader(len)) => len,
            other => panic!("expected a flush header, got {other:?}"),
        };
        let bytes = worker.broadcast_from_root(None).unwrap();
        assert_eq!(bytes.len() as u64, total);
        bytes
    }

    #[test]
    fn flushing_command_triggers_immediate_flush() {
        let mut group = ThreadFabric::group(2);
        let worker = group.pop().unwrap();
        let host = group.pop().unwrap();

        let worker_thread = thread::spawn(move || receive_flush(&worker));

        let mut buf = CommandBuffer::new(host);
        buf.enqueue(Command::Shutdown).unwrap();
        assert_eq!(buf.pending_commands(), 0);
        assert_eq!(buf.flush_count(), 1);

        let received = worker_thread.join().unwrap();
        let mut dec = dp_codec::Decoder::new(&received);
        assert_eq!(Command::decode_record(&mut dec).unwrap(), Command::Shutdown);
    }

    #[test]
    fn non_flushing_commands_batch_until_explicit_flush() {
        let mut group = ThreadFabric::group(2);
        let worker = group.pop().unwrap();
        let host = group.pop().unwrap();
        let handle = Handle::new(0, 1);

        let worker_thread = thread::spawn(move || receive_flush(&worker));

        let mut buf = CommandBuffer::new(host);
        buf.enqueue(Command::NewObject {
            kind: ObjectKind::Material,
            handle,
        })
        .unwrap();
        buf.enqueue(Command::Commit { handle }).unwrap();
        assert_eq!(buf.pending_commands(), 2);
        buf.flush().unwrap();
        assert_eq!(buf.pending_commands(), 0);

        let received = worker_thread.join().unwrap();
        let mut dec = dp_codec::Decoder::new(&received);
        assert_eq!(
            Command::decode_record(&mut dec).unwrap(),
            Command::NewObject {
                kind: ObjectKind::Material,
                handle
            }
        );
        assert_eq!(
            Command::decode_record(&mut dec).unwrap(),
            Command::Commit { handle }
        );
    }

    #[test]
    fn auto_flush_on_command_count_threshold() {
        let mut group = ThreadFabric::group(2);
        let worker = group.pop().unwrap();
        let host = group.pop().unwrap();
        let handle = Handle::new(0, 1);

        let worker_thread = thread::spawn(move || receive_flush(&worker));

        let policy = BufferPolicy {
            auto_flush_commands: 2,
            ..BufferPolicy::default()
        };
        let mut buf = CommandBuffer::with_policy(host, policy);
        buf.enqueue(Command::Retain { handle }).unwrap();
        assert_eq!(buf.flush_count(), 0);
        buf.enqueue(Command::Retain { handle }).unwrap();
        buf.enqueue(Command::Retain { handle }).unwrap();
        assert_eq!(buf.flush_count(), 1);

        worker_thread.join().unwrap();
    }

    #[test]
    fn observed_release_forces_flush() {
        let mut group = ThreadFabric::group(2);
        let worker = group.pop().unwrap();
        let host = group.pop().unwrap();
        let handle = Handle::new(0, 1);

        let worker_thread = thread::spawn(move || receive_flush(&worker));

        let mut buf = CommandBuffer::new(host);
        buf.enqueue_observed_release(Command::Release { handle })
            .unwrap();
        assert_eq!(buf.flush_count(), 1);

        worker_thread.join().unwrap();
    }

    /// Grounds scenario S6: a large payload goes out as its own sidechannel
    /// broadcast before the flush that references it, and the worker can
    /// tell the two kinds of broadcast apart from the framing byte alone.
    #[test]
    fn sidechannel_precedes_its_referencing_flush() {
        let mut group = ThreadFabric::group(2);
        let worker = group.pop().unwrap();
        let host = group.pop().unwrap();
        let handle = Handle::new(0, 1);
        let payload = vec![0xABu8; 64];
        let payload_for_worker = payload.clone();

        let worker_thread = thread::spawn(move || {
            let sidechannel = worker.broadcast_from_root(None).unwrap();
            assert_eq!(
                BroadcastFrame::decode(&sidechannel),
                Some(BroadcastFrame::Sidechannel(payload_for_worker))
            );
            receive_flush(&worker)
        });

        let mut buf = CommandBuffer::new(host);
        buf.send_sidechannel(&payload).unwrap();
        buf.enqueue(Command::Retain { handle }).unwrap();
        buf.flush().unwrap();

        let received = worker_thread.join().unwrap();
        let mut dec = dp_codec::Decoder::new(&received);
        assert_eq!(
            Command::decode_record(&mut dec).unwrap(),
            Command::Retain { handle }
        );
    }
}
