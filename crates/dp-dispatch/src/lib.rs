//! C5: the worker dispatcher. Each worker rank runs one [`Dispatcher`] loop
//! reading C4's broadcast stream, decoding C3 command records, and routing
//! each to one of three handler classes (§4.5):
//!
//! - **local-only**: every rank applies it to its own registry/framebuffer
//!   state and no reply is sent (`NewObject`, `SetParam`, `Commit`, ...);
//! - **replies-required**: the owning rank (here, worker rank 0 — fabric
//!   rank 1 — doubles as the "master" for aggregate answers) sends a
//!   [`Reply`] back to the host over the point-to-point channel;
//! - **collective**: every rank participates (`RenderFrame`), tiling the
//!   frame across ranks via C7 and compositing into C6's framebuffer.
//!
//! Tile forwarding and the dynamic balancer's request/response chatter ride
//! the same point-to-point channel, disambiguated by [`peer_wire`].

mod peer_wire;
mod reply;
mod tile_renderer;

pub use reply::Reply;
pub use tile_renderer::{SyntheticTileRenderer, TileRenderer};

use dp_balancer::{Coordinator, StaticRoundRobin, StealResponse};
use dp_buffer::BroadcastFrame;
use dp_codec::{Command, CodecError, DataPayload, Decoder, FrameEvent, ObjectKind, ParamValue};
use dp_fabric::{Fabric, FabricError};
use dp_framebuffer::{FrameBuffer, FrameBufferError, TileOutcome};
use dp_handle::Handle;
use dp_registry::{Registry, RegistryError};
use peer_wire::PeerMessage;
use std::collections::HashMap;
use std::sync::mpsc;
use std::sync::{Arc, Mutex, RwLock};
use std::thread;
use std::time::Instant;
use thiserror::Error;

/// The host always occupies fabric rank 0.
pub const HOST_RANK: u32 = 0;
/// By convention the first worker (fabric rank 1, worker rank 0) doubles as
/// the master: it hosts the dynamic balancer's `Coordinator` and is the one
/// rank that answers replies-required queries. The host's reply-receiving
/// code (`dp-host`) needs this same constant to know which rank to
/// `recv_from` after a replies-required command.
pub const MASTER_FABRIC_RANK: u32 = 1;

/// Module names this build recognizes; anything else logged and ignored
/// (`LoadModule` is modeled as a local no-op registry, not a real loader).
const KNOWN_MODULES: &[&str] = &["cpu", "ispc"];

#[derive(Debug, Error)]
pub enum DispatchError {
    #[error(transparent)]
    Fabric(#[from] FabricError),
    #[error(transparent)]
    Codec(#[from] CodecError),
    #[error(transparent)]
    Registry(#[from] RegistryError),
    #[error(transparent)]
    FrameBuffer(#[from] FrameBufferError),
    #[error("received a broadcast frame that decoded to neither a sidechannel payload nor a flush header")]
    MalformedFrame,
    #[error("NewData referenced the sidechannel but none was pending")]
    MissingSidechannel,
    #[error("handle {0} is not a known framebuffer on this rank")]
    UnknownFrameBuffer(Handle),
}

/// Tunables that would be set from `dp-host`'s config layer (§7's
/// `dynamic_load_balancer` / `samples_per_pixel` knobs).
#[derive(Debug, Clone, Copy)]
pub struct DispatchConfig {
    pub dynamic_load_balancer: bool,
    pub samples_per_pixel: u32,
}

impl Default for DispatchConfig {
    fn default() -> Self {
        Self {
            dynamic_load_balancer: false,
            samples_per_pixel: 1,
        }
    }
}

/// One worker rank's dispatch loop and all the state it accumulates across
/// commands: the handle registry, the framebuffers it has created, and
/// (when the dynamic balancer is selected) the coordinator.
pub struct Dispatcher<F: Fabric> {
    fabric: Arc<F>,
    registry: Registry,
    renderer: Arc<dyn TileRenderer>,
    config: DispatchConfig,
    runtime: tokio::runtime::Handle,

    framebuffers: RwLock<HashMap<Handle, Arc<FrameBuffer>>>,
    current_framebuffer: Mutex<Option<Arc<FrameBuffer>>>,
    pending_sidechannel: Mutex<Option<Vec<u8>>>,

    coordinator: Mutex<Option<Coordinator>>,
    balance_reply_tx: mpsc::Sender<StealResponse>,
    balance_reply_rx: Mutex<mpsc::Receiver<StealResponse>>,

    /// Landing spot for `PeerMessage::TileExport` deliveries during the
    /// post-barrier reduction gather in `render_frame`; only the master
    /// rank ever reads from it.
    export_tx: mpsc::Sender<Vec<(u32, u32, Vec<f32>, f32)>>,
    export_rx: Mutex<mpsc::Receiver<Vec<(u32, u32, Vec<f32>, f32)>>>,
}

impl<F: Fabric + 'static> Dispatcher<F> {
    pub fn new(
        fabric: Arc<F>,
        renderer: Arc<dyn TileRenderer>,
        config: DispatchConfig,
        runtime: tokio::runtime::Handle,
    ) -> Arc<Self> {
        let (balance_reply_tx, balance_reply_rx) = mpsc::channel();
        let (export_tx, export_rx) = mpsc::channel();
        Arc::new(Self {
            fabric,
            registry: Registry::new(),
            renderer,
            config,
            runtime,
            framebuffers: RwLock::new(HashMap::new()),
            current_framebuffer: Mutex::new(None),
            pending_sidechannel: Mutex::new(None),
            coordinator: Mutex::new(None),
            balance_reply_tx,
            balance_reply_rx: Mutex::new(balance_reply_rx),
            export_tx,
            export_rx: Mutex::new(export_rx),
        })
    }

    pub fn registry(&self) -> &Registry {
        &self.registry
    }

    fn worker_rank(&self) -> u32 {
        self.fabric.rank() - 1
    }

    fn worker_count(&self) -> u32 {
        self.fabric.size() - 1
    }

    fn is_master(&self) -> bool {
        self.fabric.rank() == MASTER_FABRIC_RANK
    }

    /// One background thread per sibling worker, demultiplexing forwarded
    /// tiles and balancer request/response traffic off the point-to-point
    /// channel. Not joined: the `Fabric` trait has no non-blocking or
    /// timeout recv, so these threads simply die with the process at
    /// shutdown, same as the transport's own reader threads.
    fn spawn_peer_threads(self: &Arc<Self>) {
        for peer in 1..self.fabric.size() {
            if peer == self.fabric.rank() {
                continue;
            }
            let dispatcher = Arc::clone(self);
            thread::spawn(move || loop {
                match dispatcher.fabric.recv_from(peer) {
                    Ok(bytes) => dispatcher.handle_peer_message(peer, &bytes),
                    Err(_) => break,
                }
            });
        }
    }

    fn handle_peer_message(&self, from: u32, bytes: &[u8]) {
        match PeerMessage::decode(bytes) {
            Some(PeerMessage::Tile(sample)) => {
                if let Some(fb) = self.current_framebuffer.lock().unwrap().clone() {
                    if let Err(err) = fb.set_tile(sample) {
                        tracing::warn!(target: "dispatch", %err, from, "forwarded tile rejected");
                    }
                }
            }
            Some(PeerMessage::BalanceRequest) => {
                if self.is_master() {
                    let mut coordinator = self.coordinator.lock().unwrap();
                    if let Some(coord) = coordinator.as_mut() {
                        let requester = from - 1;
                        let response = coord.request(requester);
                        let _ = self
                            .fabric
                            .send_to(from, &PeerMessage::BalanceResponse(response).encode());
                    }
                }
            }
            Some(PeerMessage::BalanceResponse(response)) => {
                let _ = self.balance_reply_tx.send(response);
            }
            Some(PeerMessage::TileExport(tiles)) => {
                let _ = self.export_tx.send(tiles);
            }
            None => tracing::warn!(target: "dispatch", from, "malformed peer message"),
        }
    }

    /// Run the dispatch loop to completion. Returns once `Shutdown` is
    /// processed, or on the first fatal fabric/protocol error.
    pub fn run(self: &Arc<Self>) -> Result<(), DispatchError> {
        self.spawn_peer_threads();
        loop {
            let frame = self.fabric.broadcast_from_root(None)?;
            match BroadcastFrame::decode(&frame).ok_or(DispatchError::MalformedFrame)? {
                BroadcastFrame::Sidechannel(bytes) => {
                    *self.pending_sidechannel.lock().unwrap() = Some(bytes);
                }
                BroadcastFrame::FlushHeader(len) => {
                    let payload = self.fabric.broadcast_from_root(None)?;
                    debug_assert_eq!(payload.len() as u64, len);
                    let mut dec = Decoder::new(&payload);
                    while !dec.is_empty() {
                        let cmd = Command::decode_record(&mut dec)?;
                        let is_shutdown = matches!(cmd, Command::Shutdown);
                        match self.handle_command(cmd) {
                            Ok(Some(reply)) => {
                                self.fabric.send_to(HOST_RANK, &reply.encode())?;
                            }
                            Ok(None) => {}
                            Err(err) => {
                                tracing::error!(target: "dispatch", %err, "command handler failed");
                            }
                        }
                        if is_shutdown {
                            return Ok(());
                        }
                    }
                }
            }
        }
    }

    fn take_sidechannel(&self) -> Result<Vec<u8>, DispatchError> {
        self.pending_sidechannel
            .lock()
            .unwrap()
            .take()
            .ok_or(DispatchError::MissingSidechannel)
    }

    fn framebuffer(&self, handle: Handle) -> Result<Arc<FrameBuffer>, DispatchError> {
        self.framebuffers
            .read()
            .unwrap()
            .get(&handle)
            .cloned()
            .ok_or(DispatchError::UnknownFrameBuffer(handle))
    }

    /// Wraps a reply so only the master rank actually sends it; every other
    /// rank's replies-required handler runs (for registry-consistency's
    /// sake) but produces nothing to transmit.
    fn master_reply(&self, reply: Reply) -> Option<Reply> {
        if self.is_master() { Some(reply) } else { None }
    }

    fn handle_command(&self, cmd: Command) -> Result<Option<Reply>, DispatchError> {
        match cmd {
            Command::NewObject { kind, handle } => {
                self.registry.assign(handle, kind)?;
                Ok(None)
            }
            Command::NewData {
                handle,
                spec,
                shared,
                payload,
            } => {
                let bytes = match payload {
                    DataPayload::Inline(bytes) => bytes,
                    DataPayload::Sidechannel => self.take_sidechannel()?,
                };
                self.registry.assign_data(handle, spec, shared, bytes)?;
                Ok(None)
            }
            Command::SetParam {
                handle,
                name,
                value,
            } => {
                self.registry.set_param(handle, name, value)?;
                Ok(None)
            }
            Command::RemoveParam { handle, name } => {
                self.registry.remove_param(handle, &name)?;
                Ok(None)
            }
            Command::Commit { handle } => {
                self.registry.commit(handle)?;
                Ok(None)
            }
            Command::Retain { handle } => {
                self.registry.retain(handle)?;
                Ok(None)
            }
            Command::Release { handle } => {
                self.registry.release(handle)?;
                Ok(None)
            }
            Command::CopyData {
                dst,
                dst_offset,
                src,
            } => {
                self.registry.copy_data(dst, dst_offset, src)?;
                Ok(None)
            }
            Command::NewFrameBuffer {
                handle,
                width,
                height,
                tile_size,
                mode,
                channels,
            } => {
                self.registry.assign(handle, ObjectKind::FrameBuffer)?;
                let fb = Arc::new(FrameBuffer::new(
                    width,
                    height,
                    tile_size,
                    mode,
                    channels,
                    self.worker_count(),
                    self.worker_rank(),
                ));
                self.framebuffers.write().unwrap().insert(handle, fb);
                Ok(None)
            }
            Command::RenderFrame {
                framebuffer, future, ..
            } => {
                self.render_frame(framebuffer, future)?;
                Ok(None)
            }
            Command::IsReady { future, event } => {
                let ready = self.registry.with_object(future, ObjectKind::Future, |o| {
                    o.future().expect("Future object always carries FutureState").is_ready(event)
                })?;
                Ok(self.master_reply(Reply::Ready(ready)))
            }
            Command::Wait { future, event } => {
                // RenderFrame already ran to completion synchronously by the
                // time a Wait for it is processed in program order, so this
                // never actually spins; it stays correct if that changes.
                loop {
                    let ready = self.registry.with_object(future, ObjectKind::Future, |o| {
                        o.future().expect("Future object always carries FutureState").is_ready(event)
                    })?;
                    if ready {
                        break;
                    }
                    thread::yield_now();
                }
                Ok(self.master_reply(Reply::Ready(true)))
            }
            Command::Cancel { future } => {
                self.registry.with_object(future, ObjectKind::Future, |o| {
                    o.future().expect("Future object always carries FutureState").request_cancel()
                })?;
                if let Some(fb) = self.current_framebuffer.lock().unwrap().as_ref() {
                    fb.cancel();
                }
                Ok(None)
            }
            Command::GetProgress { future } => {
                let progress = self.registry.with_object(future, ObjectKind::Future, |o| {
                    o.future().expect("Future object always carries FutureState").progress()
                })?;
                Ok(self.master_reply(Reply::Progress(progress)))
            }
            Command::GetTaskDuration { future } => {
                let nanos = self.registry.with_object(future, ObjectKind::Future, |o| {
                    o.future().expect("Future object always carries FutureState").duration()
                })?;
                Ok(self.master_reply(Reply::Duration(nanos)))
            }
            Command::Pick { .. } => Ok(self.master_reply(Reply::Pick {
                hit: false,
                position: [0.0; 3],
            })),
            Command::GetBounds { .. } => Ok(self.master_reply(Reply::Bounds {
                lo: [0.0; 3],
                hi: [0.0; 3],
            })),
            Command::MapFrameBuffer { handle, .. } => {
                let fb = self.framebuffer(handle)?;
                Ok(self.master_reply(Reply::MappedPixels(fb.master_buffer().unwrap_or_default())))
            }
            Command::UnmapFrameBuffer { .. } => Ok(None),
            Command::GetVariance { handle } => {
                let fb = self.framebuffer(handle)?;
                Ok(self.master_reply(Reply::Variance(fb.aggregate_variance())))
            }
            Command::ResetAccumulation { handle } => {
                let fb = self.framebuffer(handle)?;
                fb.reset_accumulation();
                Ok(None)
            }
            Command::LoadModule { name } => {
                if !KNOWN_MODULES.contains(&name.as_str()) {
                    tracing::warn!(target: "dispatch", module = %name, "unrecognized module name");
                }
                Ok(None)
            }
            Command::Shutdown => Ok(None),
        }
    }

    /// The collective handler: every rank tiles and renders the frame,
    /// forwarding each finished tile to its owner, waits for its own owned
    /// tiles to land, then after the barrier ships those tiles to the
    /// master rank so the reduction in [`Self::gather_tiles`] can fold them
    /// into the master's view of the frame.
    fn render_frame(&self, framebuffer: Handle, future: Handle) -> Result<(), DispatchError> {
        let fb = self.framebuffer(framebuffer)?;
        *self.current_framebuffer.lock().unwrap() = Some(Arc::clone(&fb));

        let error_threshold = self
            .registry
            .with_object(framebuffer, ObjectKind::FrameBuffer, |o| {
                match o.params.get("varianceThreshold") {
                    Some(ParamValue::Float(v)) => *v,
                    _ => 0.0,
                }
            })?;

        let accum_id = fb.start_frame(error_threshold, 1);
        let generation = accum_id as u32;
        let started = Instant::now();

        let render_result = if self.config.dynamic_load_balancer {
            self.render_frame_dynamic(&fb, future, generation, error_threshold)
        } else {
            self.render_frame_static(&fb, future, generation, error_threshold)
        };

        fb.wait_until_finished();
        fb.end_frame(error_threshold);
        self.fabric.barrier()?;
        self.gather_tiles(&fb)?;

        let elapsed_nanos = u64::try_from(started.elapsed().as_nanos()).unwrap_or(u64::MAX);
        self.registry.with_object(future, ObjectKind::Future, |o| {
            let state = o.future().expect("Future object always carries FutureState");
            state.set_duration(elapsed_nanos);
            state.set_progress(1.0);
            state.mark_ready(FrameEvent::WorldRendered);
            state.mark_ready(FrameEvent::FrameFinished);
        })?;

        *self.current_framebuffer.lock().unwrap() = None;
        render_result
    }

    /// The reduction gather §4.6 promises: after every rank's `end_frame`
    /// has folded its *own* owned tiles into its local view of the master
    /// buffer, the non-master ranks ship their owned tiles to the master
    /// over C1 so `map`/`get_variance` answers reflect the whole frame
    /// instead of just the master's own tile share.
    fn gather_tiles(&self, fb: &Arc<FrameBuffer>) -> Result<(), DispatchError> {
        if self.worker_rank() == 0 {
            for _ in 1..self.worker_count() {
                let tiles = self
                    .export_rx
                    .lock()
                    .unwrap()
                    .recv()
                    .expect("every other worker rank sends exactly one export per frame");
                for (tile_x, tile_y, pixels, error) in tiles {
                    fb.ingest_remote_tile(tile_x, tile_y, &pixels, error);
                }
            }
        } else {
            let tiles = fb.export_owned_tiles();
            self.fabric
                .send_to(MASTER_FABRIC_RANK, &PeerMessage::TileExport(tiles).encode())?;
        }
        Ok(())
    }

    fn render_frame_static(
        &self,
        fb: &Arc<FrameBuffer>,
        future: Handle,
        generation: u32,
        error_threshold: f32,
    ) -> Result<(), DispatchError> {
        let mut assignment =
            StaticRoundRobin::new(self.worker_rank(), self.worker_count(), fb.tiles_x(), fb.tiles_y());
        while let Some((tile_x, tile_y)) = assignment.next_tile(fb, error_threshold) {
            if fb.is_cancelled() {
                break;
            }
            self.render_and_deliver(fb, tile_x, tile_y, generation)?;
            self.report_progress(future, fb)?;
        }
        Ok(())
    }

    fn render_frame_dynamic(
        &self,
        fb: &Arc<FrameBuffer>,
        future: Handle,
        generation: u32,
        error_threshold: f32,
    ) -> Result<(), DispatchError> {
        if self.is_master() {
            let coordinator = Coordinator::seed(
                fb,
                self.worker_count(),
                fb.tiles_x(),
                fb.tiles_y(),
                error_threshold,
            );
            *self.coordinator.lock().unwrap() = Some(coordinator);
        }
        self.fabric.barrier()?;
        loop {
            if fb.is_cancelled() {
                break;
            }
            match self.request_tile() {
                StealResponse::Tile(tile_x, tile_y) => {
                    self.render_and_deliver(fb, tile_x, tile_y, generation)?;
                    self.report_progress(future, fb)?;
                }
                StealResponse::Exhausted => break,
            }
        }
        Ok(())
    }

    /// Ask the coordinator for the next tile: a local call if this rank
    /// hosts it, otherwise a point-to-point request/response round trip.
    fn request_tile(&self) -> StealResponse {
        if self.is_master() {
            let mut coordinator = self.coordinator.lock().unwrap();
            coordinator
                .as_mut()
                .expect("coordinator seeded before any rank requests")
                .request(self.worker_rank())
        } else {
            let _ = self
                .fabric
                .send_to(MASTER_FABRIC_RANK, &PeerMessage::BalanceRequest.encode());
            self.balance_reply_rx
                .lock()
                .unwrap()
                .recv()
                .expect("coordinator rank stays alive for the duration of the frame")
        }
    }

    fn render_and_deliver(
        &self,
        fb: &Arc<FrameBuffer>,
        tile_x: u32,
        tile_y: u32,
        generation: u32,
    ) -> Result<(), DispatchError> {
        let renderer = Arc::clone(&self.renderer);
        let tile_size = fb.tile_size();
        let sample = self.runtime.block_on(async move {
            tokio::task::spawn_blocking(move || {
                renderer.render_tile(tile_x, tile_y, tile_size, generation)
            })
            .await
            .expect("tile render task panicked")
        });
        match fb.set_tile(sample.clone())? {
            TileOutcome::Accumulated => {}
            TileOutcome::Forward { owner } => {
                let fabric_owner = owner + 1;
                self.fabric
                    .send_to(fabric_owner, &PeerMessage::Tile(sample).encode())?;
            }
        }
        Ok(())
    }

    fn report_progress(&self, future: Handle, fb: &FrameBuffer) -> Result<(), DispatchError> {
        let progress = fb.progress();
        self.registry.with_object(future, ObjectKind::Future, |o| {
            o.future()
                .expect("Future object always carries FutureState")
                .set_progress(progress)
        })?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use dp_buffer::CommandBuffer;
    use dp_codec::{CompositeMode, FbChannels};
    use dp_fabric::ThreadFabric;

    fn spawn_dispatcher(
        fabric: Arc<ThreadFabric>,
        config: DispatchConfig,
    ) -> Arc<Dispatcher<ThreadFabric>> {
        let rt = tokio::runtime::Builder::new_current_thread()
            .build()
            .unwrap();
        // Leaked: the test runtime only needs to outlive this one dispatcher
        // call, and a `tokio::runtime::Handle` can't outlive its `Runtime`.
        let handle = Box::leak(Box::new(rt)).handle().clone();
        Dispatcher::new(fabric, Arc::new(SyntheticTileRenderer), config, handle)
    }

    /// A two-rank group (one host stand-in driving commands through a real
    /// `CommandBuffer`, one worker running the dispatch loop) exercising
    /// object lifecycle and a static-strategy render with no network
    /// transport involved.
    #[test]
    fn single_worker_processes_object_lifecycle_and_renders_a_frame() {
        let group = ThreadFabric::group(2);
        let mut ranks = group.into_iter();
        let host = ranks.next().unwrap();
        let worker = Arc::new(ranks.next().unwrap());
        let dispatcher = spawn_dispatcher(Arc::clone(&worker), DispatchConfig::default());

        let worker_thread = thread::spawn(move || dispatcher.run());

        let fb_handle = Handle::new(0, 1);
        let future_handle = Handle::new(0, 2);
        let mut buf = CommandBuffer::new(host);
        buf.enqueue(Command::NewFrameBuffer {
            handle: fb_handle,
            width: 32,
            height: 32,
            tile_size: 32,
            mode: CompositeMode::WriteOnce,
            channels: FbChannels::COLOR,
        })
        .unwrap();
        buf.enqueue(Command::NewObject {
            kind: ObjectKind::Future,
            handle: future_handle,
        })
        .unwrap();
        buf.enqueue(Command::RenderFrame {
            framebuffer: fb_handle,
            renderer: Handle::new(0, 3),
            camera: Handle::new(0, 4),
            world: Handle::new(0, 5),
            future: future_handle,
        })
        .unwrap();
        buf.enqueue(Command::Shutdown).unwrap();

        worker_thread.join().unwrap().unwrap();
    }

    /// Two workers, a 2x2 tile grid split across them: regression coverage
    /// for the cross-rank reduction. Every tile's value is distinguishable
    /// by coordinate (`SyntheticTileRenderer`), so asserting every tile in
    /// the mapped buffer carries its own expected value — not just the
    /// tiles the master rank happens to own — catches both the
    /// `wait_until_finished` deadlock and a missing gather at once.
    #[test]
    fn two_workers_reduce_every_tile_into_the_master_buffer() {
        let group = ThreadFabric::group(3);
        let mut ranks = group.into_iter();
        let host = ranks.next().unwrap();
        let w0 = Arc::new(ranks.next().unwrap());
        let w1 = Arc::new(ranks.next().unwrap());
        let d0 = spawn_dispatcher(Arc::clone(&w0), DispatchConfig::default());
        let d1 = spawn_dispatcher(Arc::clone(&w1), DispatchConfig::default());
        let t0 = thread::spawn(move || d0.run());
        let t1 = thread::spawn(move || d1.run());

        let fb_handle = Handle::new(0, 1);
        let future_handle = Handle::new(0, 2);
        let mut buf = CommandBuffer::new(host);
        buf.enqueue(Command::NewFrameBuffer {
            handle: fb_handle,
            width: 128,
            height: 128,
            tile_size: 64,
            mode: CompositeMode::WriteOnce,
            channels: FbChannels::COLOR,
        })
        .unwrap();
        buf.enqueue(Command::NewObject {
            kind: ObjectKind::Future,
            handle: future_handle,
        })
        .unwrap();
        buf.enqueue(Command::RenderFrame {
            framebuffer: fb_handle,
            renderer: Handle::new(0, 3),
            camera: Handle::new(0, 4),
            world: Handle::new(0, 5),
            future: future_handle,
        })
        .unwrap();

        buf.enqueue(Command::Wait {
            future: future_handle,
            event: FrameEvent::FrameFinished,
        })
        .unwrap();
        let reply = Reply::decode(&buf.fabric().recv_from(MASTER_FABRIC_RANK).unwrap()).unwrap();
        assert_eq!(reply, Reply::Ready(true));

        buf.enqueue(Command::MapFrameBuffer {
            handle: fb_handle,
            channel: dp_codec::FbChannel::Color,
        })
        .unwrap();
        let reply = Reply::decode(&buf.fabric().recv_from(MASTER_FABRIC_RANK).unwrap()).unwrap();
        let pixels = match reply {
            Reply::MappedPixels(pixels) => pixels,
            other => panic!("expected MappedPixels, got {other:?}"),
        };
        assert_eq!(pixels.len(), 128 * 128);

        for tile_y in 0..2u32 {
            for tile_x in 0..2u32 {
                let expected = ((tile_x * 31 + tile_y * 17) % 97) as f32 / 97.0;
                let origin_x = (tile_x * 64) as usize;
                let origin_y = (tile_y * 64) as usize;
                assert_eq!(
                    pixels[origin_y * 128 + origin_x],
                    expected,
                    "tile ({tile_x}, {tile_y}) missing from the reduced master buffer"
                );
            }
        }

        buf.enqueue(Command::Shutdown).unwrap();
        t0.join().unwrap().unwrap();
        t1.join().unwrap().unwrap();
    }

    /// Same scenario, but with the dynamic work-stealing balancer selected
    /// instead of static round robin.
    #[test]
    fn dynamic_balancer_drives_the_same_render_to_completion() {
        let group = ThreadFabric::group(2);
        let mut ranks = group.into_iter();
        let host = ranks.next().unwrap();
        let worker = Arc::new(ranks.next().unwrap());
        let config = DispatchConfig {
            dynamic_load_balancer: true,
            ..DispatchConfig::default()
        };
        let dispatcher = spawn_dispatcher(Arc::clone(&worker), config);

        let worker_thread = thread::spawn(move || dispatcher.run());

        let fb_handle = Handle::new(0, 1);
        let future_handle = Handle::new(0, 2);
        let mut buf = CommandBuffer::new(host);
        buf.enqueue(Command::NewFrameBuffer {
            handle: fb_handle,
            width: 64,
            height: 64,
            tile_size: 32,
            mode: CompositeMode::WriteOnce,
            channels: FbChannels::COLOR,
        })
        .unwrap();
        buf.enqueue(Command::NewObject {
            kind: ObjectKind::Future,
            handle: future_handle,
        })
        .unwrap();
        buf.enqueue(Command::RenderFrame {
            framebuffer: fb_handle,
            renderer: Handle::new(0, 3),
            camera: Handle::new(0, 4),
            world: Handle::new(0, 5),
            future: future_handle,
        })
        .unwrap();
        buf.enqueue(Command::Shutdown).unwrap();

        worker_thread.join().unwrap().unwrap();
    }
}
