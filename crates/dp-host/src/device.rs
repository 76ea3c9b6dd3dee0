//! The host API (§6): one [`Device`] per process-group connection, driving
//! C4's command buffer while keeping a local mirror of C2's registry so the
//! host can validate handles, type-check parameters and decide destruction
//! order without a network round trip — the same way a worker's dispatcher
//! validates the commands it receives, just one rank earlier.

use crate::error::OffloadError;
use dp_buffer::{BufferPolicy, CommandBuffer};
use dp_codec::{
    Command, CompositeMode, DataArraySpec, DataPayload, FbChannel, FbChannels, FrameEvent,
    ObjectKind, ParamValue,
};
use dp_dispatch::{Reply, HOST_RANK, MASTER_FABRIC_RANK};
use dp_fabric::Fabric;
use dp_handle::{Handle, HandleAllocator};
use dp_registry::Registry;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Mutex;
use std::time::Duration;

/// Module names this build recognizes. Mirrors `dp-dispatch`'s own list;
/// kept in lockstep by hand since a worker logs-and-ignores an unknown name
/// while the host rejects it outright (§6's `load_module` is the one call
/// where host and worker policy deliberately differ).
const KNOWN_MODULES: &[&str] = &["cpu", "ispc"];

pub type StatusCallback = Box<dyn Fn(&str) + Send + Sync>;
pub type ErrorCallback = Box<dyn Fn(&OffloadError) + Send + Sync>;

/// Result of a [`Device::pick`] call.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct PickResult {
    pub hit: bool,
    pub position: [f32; 3],
}

/// Result of a [`Device::get_bounds`] call.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Bounds {
    pub lo: [f32; 3],
    pub hi: [f32; 3],
}

/// One process-group connection, generic over the transport so the same
/// code drives an in-process [`dp_fabric::ThreadFabric`] (tests, `dp-demo`)
/// or a [`dp_fabric::TcpFabric`] (listen/connect/launch mode) identically.
pub struct Device<F: Fabric> {
    registry: Registry,
    handles: Mutex<HandleAllocator>,
    buf: Mutex<CommandBuffer<F>>,
    policy: BufferPolicy,
    status_callback: Mutex<Option<StatusCallback>>,
    error_callback: Mutex<Option<ErrorCallback>>,
    disconnected: AtomicBool,
}

impl<F: Fabric> Device<F> {
    /// Construct a device over an already-bootstrapped fabric (rank 0).
    /// Runs §7's "feature detection" startup check, which is fatal at init
    /// if it fails.
    pub fn init(fabric: F, policy: BufferPolicy) -> Result<Self, OffloadError> {
        detect_cpu_features()?;
        Ok(Self {
            registry: Registry::new(),
            handles: Mutex::new(HandleAllocator::new(HOST_RANK as u16)),
            buf: Mutex::new(CommandBuffer::with_policy(fabric, policy)),
            policy,
            status_callback: Mutex::new(None),
            error_callback: Mutex::new(None),
            disconnected: AtomicBool::new(false),
        })
    }

    pub fn new(fabric: F) -> Result<Self, OffloadError> {
        Self::init(fabric, BufferPolicy::default())
    }

    /// Registered at construction time and independent of one another, per
    /// §7's propagation policy.
    pub fn set_status_callback(&self, callback: impl Fn(&str) + Send + Sync + 'static) {
        *self.status_callback.lock().unwrap() = Some(Box::new(callback));
    }

    pub fn set_error_callback(&self, callback: impl Fn(&OffloadError) + Send + Sync + 'static) {
        *self.error_callback.lock().unwrap() = Some(Box::new(callback));
    }

    fn emit_status(&self, message: &str) {
        if let Some(callback) = self.status_callback.lock().unwrap().as_ref() {
            callback(message);
        }
    }

    /// Routes an error to the registered callback and, for the fatal kinds
    /// (§7: `ProtocolError`, `Disconnect`), latches the connection closed so
    /// every subsequent call fails fast with `Disconnect` (scenario S4).
    fn note_error(&self, err: OffloadError) -> OffloadError {
        if matches!(err, OffloadError::Disconnect | OffloadError::ProtocolError(_)) {
            self.disconnected.store(true, Ordering::SeqCst);
        }
        if let Some(callback) = self.error_callback.lock().unwrap().as_ref() {
            callback(&err);
        }
        err
    }

    fn check_connected(&self) -> Result<(), OffloadError> {
        if self.disconnected.load(Ordering::SeqCst) {
            Err(OffloadError::Disconnect)
        } else {
            Ok(())
        }
    }

    fn next_handle(&self) -> Handle {
        self.handles.lock().unwrap().allocate()
    }

    fn enqueue(&self, buf: &mut CommandBuffer<F>, command: Command) -> Result<(), OffloadError> {
        buf.enqueue(command).map_err(|e| self.note_error(e.into()))
    }

    fn flush(&self, buf: &mut CommandBuffer<F>) -> Result<(), OffloadError> {
        buf.flush().map_err(|e| self.note_error(e.into()))
    }

    /// Wait for the replies-required rank's answer to the query just
    /// enqueued. Must be called immediately after enqueuing a command for
    /// which [`Command::expects_reply`] is true — that command's own
    /// `flushing()` flag guarantees it has already gone out on the wire.
    fn recv_reply(&self, buf: &CommandBuffer<F>) -> Result<Reply, OffloadError> {
        let bytes = buf
            .fabric()
            .recv_from(MASTER_FABRIC_RANK)
            .map_err(|e| self.note_error(OffloadError::from(e)))?;
        Reply::decode(&bytes)
            .ok_or_else(|| self.note_error(OffloadError::ProtocolError("malformed reply record".into())))
    }

    // -- initialization -----------------------------------------------

    pub fn load_module(&self, name: &str) -> Result<(), OffloadError> {
        self.check_connected()?;
        if !KNOWN_MODULES.contains(&name) {
            return Err(OffloadError::InvalidArgument(format!(
                "unrecognized module name {name:?}"
            )));
        }
        let mut buf = self.buf.lock().unwrap();
        self.enqueue(
            &mut buf,
            Command::LoadModule {
                name: name.to_string(),
            },
        )
    }

    pub fn shutdown(&self) -> Result<(), OffloadError> {
        self.check_connected()?;
        let mut buf = self.buf.lock().unwrap();
        self.enqueue(&mut buf, Command::Shutdown)?;
        self.emit_status("shutdown");
        Ok(())
    }

    // -- object construction -------------------------------------------

    /// Generic constructor backing every `new_<kind>` convenience method.
    /// Rejects `ObjectKind::Data` and `ObjectKind::FrameBuffer`, which have
    /// their own entry points (`new_data`/`new_shared_data`,
    /// `new_framebuffer`) because they carry extra arguments a bare
    /// `NewObject` cannot.
    pub fn new_object(&self, kind: ObjectKind) -> Result<Handle, OffloadError> {
        self.check_connected()?;
        if matches!(kind, ObjectKind::Data | ObjectKind::FrameBuffer | ObjectKind::Future) {
            return Err(OffloadError::InvalidArgument(format!(
                "{kind:?} objects must be created through their dedicated entry point"
            )));
        }
        let handle = self.next_handle();
        self.registry.assign(handle, kind)?;
        let mut buf = self.buf.lock().unwrap();
        self.enqueue(&mut buf, Command::NewObject { kind, handle })?;
        Ok(handle)
    }

    pub fn new_renderer(&self) -> Result<Handle, OffloadError> {
        self.new_object(ObjectKind::Renderer)
    }
    pub fn new_camera(&self) -> Result<Handle, OffloadError> {
        self.new_object(ObjectKind::Camera)
    }
    pub fn new_world(&self) -> Result<Handle, OffloadError> {
        self.new_object(ObjectKind::World)
    }
    pub fn new_geometry(&self) -> Result<Handle, OffloadError> {
        self.new_object(ObjectKind::Geometry)
    }
    pub fn new_volume(&self) -> Result<Handle, OffloadError> {
        self.new_object(ObjectKind::Volume)
    }
    pub fn new_texture(&self) -> Result<Handle, OffloadError> {
        self.new_object(ObjectKind::Texture)
    }
    pub fn new_material(&self) -> Result<Handle, OffloadError> {
        self.new_object(ObjectKind::Material)
    }
    pub fn new_transfer_function(&self) -> Result<Handle, OffloadError> {
        self.new_object(ObjectKind::TransferFunction)
    }
    pub fn new_light(&self) -> Result<Handle, OffloadError> {
        self.new_object(ObjectKind::Light)
    }
    pub fn new_image_op(&self) -> Result<Handle, OffloadError> {
        self.new_object(ObjectKind::ImageOp)
    }
    pub fn new_instance(&self) -> Result<Handle, OffloadError> {
        self.new_object(ObjectKind::Instance)
    }
    pub fn new_group(&self) -> Result<Handle, OffloadError> {
        self.new_object(ObjectKind::Group)
    }
    pub fn new_model(&self) -> Result<Handle, OffloadError> {
        self.new_object(ObjectKind::Model)
    }

    // -- parameters and lifetime ----------------------------------------

    pub fn set_param(&self, handle: Handle, name: &str, value: ParamValue) -> Result<(), OffloadError> {
        self.check_connected()?;
        self.registry.set_param(handle, name.to_string(), value.clone())?;
        let mut buf = self.buf.lock().unwrap();
        self.enqueue(
            &mut buf,
            Command::SetParam {
                handle,
                name: name.to_string(),
                value,
            },
        )
    }

    pub fn remove_param(&self, handle: Handle, name: &str) -> Result<(), OffloadError> {
        self.check_connected()?;
        self.registry.remove_param(handle, name)?;
        let mut buf = self.buf.lock().unwrap();
        self.enqueue(
            &mut buf,
            Command::RemoveParam {
                handle,
                name: name.to_string(),
            },
        )
    }

    pub fn commit(&self, handle: Handle) -> Result<(), OffloadError> {
        self.check_connected()?;
        self.registry.commit(handle)?;
        let mut buf = self.buf.lock().unwrap();
        self.enqueue(&mut buf, Command::Commit { handle })
    }

    pub fn retain(&self, handle: Handle) -> Result<(), OffloadError> {
        self.check_connected()?;
        self.registry.retain(handle)?;
        let mut buf = self.buf.lock().unwrap();
        self.enqueue(&mut buf, Command::Retain { handle })
    }

    /// Releases the host's own reference. Forces a flush (`Release` is not
    /// itself in `Command::flushing()`'s list) so the host's local
    /// destruction decision — based on its own registry mirror — stays
    /// consistent with what every worker just observed, per scenario S5.
    pub fn release(&self, handle: Handle) -> Result<bool, OffloadError> {
        self.check_connected()?;
        let destroyed = self.registry.release(handle)?;
        let mut buf = self.buf.lock().unwrap();
        buf.enqueue_observed_release(Command::Release { handle })
            .map_err(|e| self.note_error(e.into()))?;
        Ok(destroyed)
    }

    // -- data -------------------------------------------------------------

    /// Creates a data array, routing `bytes` inline or through C4's
    /// sidechannel depending on `spec.byte_len()` against the configured
    /// inline threshold (scenario S6 for the large-payload path).
    pub fn new_data(
        &self,
        spec: DataArraySpec,
        shared: bool,
        bytes: Vec<u8>,
    ) -> Result<Handle, OffloadError> {
        self.check_connected()?;
        let expected = spec.byte_len();
        if bytes.len() as u64 != expected {
            return Err(OffloadError::InvalidArgument(format!(
                "data array byte length {} does not match the spec's {expected}",
                bytes.len()
            )));
        }
        let handle = self.next_handle();
        self.registry
            .assign_data(handle, spec, shared, bytes.clone())?;

        let mut buf = self.buf.lock().unwrap();
        let payload = if expected as usize > self.policy.inline_threshold {
            buf.send_sidechannel(&bytes)
                .map_err(|e| self.note_error(e.into()))?;
            DataPayload::Sidechannel
        } else {
            DataPayload::Inline(bytes)
        };
        self.enqueue(
            &mut buf,
            Command::NewData {
                handle,
                spec,
                shared,
                payload,
            },
        )?;
        Ok(handle)
    }

    pub fn new_shared_data(&self, spec: DataArraySpec, bytes: Vec<u8>) -> Result<Handle, OffloadError> {
        self.new_data(spec, true, bytes)
    }

    pub fn copy_data(&self, dst: Handle, dst_offset: [u32; 3], src: Handle) -> Result<(), OffloadError> {
        self.check_connected()?;
        self.registry.copy_data(dst, dst_offset, src)?;
        let mut buf = self.buf.lock().unwrap();
        buf.enqueue_copy_shared_data(Command::CopyData {
            dst,
            dst_offset,
            src,
        })
        .map_err(|e| self.note_error(e.into()))
    }

    // -- framebuffer -------------------------------------------------------

    pub fn new_framebuffer(
        &self,
        width: u32,
        height: u32,
        tile_size: u32,
        mode: CompositeMode,
        channels: FbChannels,
    ) -> Result<Handle, OffloadError> {
        self.check_connected()?;
        let handle = self.next_handle();
        self.registry.assign(handle, ObjectKind::FrameBuffer)?;
        let mut buf = self.buf.lock().unwrap();
        self.enqueue(
            &mut buf,
            Command::NewFrameBuffer {
                handle,
                width,
                height,
                tile_size,
                mode,
                channels,
            },
        )?;
        Ok(handle)
    }

    pub fn map(&self, framebuffer: Handle, channel: FbChannel) -> Result<Vec<f32>, OffloadError> {
        self.check_connected()?;
        self.registry
            .with_object(framebuffer, ObjectKind::FrameBuffer, |_| ())?;
        let mut buf = self.buf.lock().unwrap();
        self.enqueue(
            &mut buf,
            Command::MapFrameBuffer {
                handle: framebuffer,
                channel,
            },
        )?;
        match self.recv_reply(&buf)? {
            Reply::MappedPixels(pixels) => Ok(pixels),
            other => Err(self.note_error(OffloadError::ProtocolError(format!(
                "expected a MappedPixels reply, got {other:?}"
            )))),
        }
    }

    pub fn unmap(&self, framebuffer: Handle) -> Result<(), OffloadError> {
        self.check_connected()?;
        self.registry
            .with_object(framebuffer, ObjectKind::FrameBuffer, |_| ())?;
        let mut buf = self.buf.lock().unwrap();
        self.enqueue(&mut buf, Command::UnmapFrameBuffer { handle: framebuffer })
    }

    pub fn get_variance(&self, framebuffer: Handle) -> Result<f32, OffloadError> {
        self.check_connected()?;
        self.registry
            .with_object(framebuffer, ObjectKind::FrameBuffer, |_| ())?;
        let mut buf = self.buf.lock().unwrap();
        self.enqueue(&mut buf, Command::GetVariance { handle: framebuffer })?;
        match self.recv_reply(&buf)? {
            Reply::Variance(variance) => Ok(variance),
            other => Err(self.note_error(OffloadError::ProtocolError(format!(
                "expected a Variance reply, got {other:?}"
            )))),
        }
    }

    pub fn reset_accumulation(&self, framebuffer: Handle) -> Result<(), OffloadError> {
        self.check_connected()?;
        self.registry
            .with_object(framebuffer, ObjectKind::FrameBuffer, |_| ())?;
        let mut buf = self.buf.lock().unwrap();
        self.enqueue(&mut buf, Command::ResetAccumulation { handle: framebuffer })
    }

    // -- rendering ----------------------------------------------------------

    /// Starts a render, returning the handle of the future that tracks it.
    /// Requires `framebuffer`, `renderer`, `camera` and `world` to all have
    /// been committed — an uncommitted object used in rendering is exactly
    /// §7's `StateError` condition.
    pub fn render_frame(
        &self,
        framebuffer: Handle,
        renderer: Handle,
        camera: Handle,
        world: Handle,
    ) -> Result<Handle, OffloadError> {
        self.check_connected()?;
        self.registry.require_committed(framebuffer)?;
        self.registry.require_committed(renderer)?;
        self.registry.require_committed(camera)?;
        self.registry.require_committed(world)?;

        let future = self.next_handle();
        self.registry.assign(future, ObjectKind::Future)?;
        let mut buf = self.buf.lock().unwrap();
        self.enqueue(
            &mut buf,
            Command::NewObject {
                kind: ObjectKind::Future,
                handle: future,
            },
        )?;
        self.enqueue(
            &mut buf,
            Command::RenderFrame {
                framebuffer,
                renderer,
                camera,
                world,
                future,
            },
        )?;
        Ok(future)
    }

    pub fn is_ready(&self, future: Handle, event: FrameEvent) -> Result<bool, OffloadError> {
        self.check_connected()?;
        self.registry
            .with_object(future, ObjectKind::Future, |_| ())?;
        let mut buf = self.buf.lock().unwrap();
        self.enqueue(&mut buf, Command::IsReady { future, event })?;
        match self.recv_reply(&buf)? {
            Reply::Ready(ready) => Ok(ready),
            other => Err(self.note_error(OffloadError::ProtocolError(format!(
                "expected a Ready reply, got {other:?}"
            )))),
        }
    }

    /// Blocks the worker side until `event` is ready; on the host this is
    /// just another replies-required round trip.
    pub fn wait(&self, future: Handle, event: FrameEvent) -> Result<(), OffloadError> {
        self.check_connected()?;
        self.registry
            .with_object(future, ObjectKind::Future, |_| ())?;
        let mut buf = self.buf.lock().unwrap();
        self.enqueue(&mut buf, Command::Wait { future, event })?;
        match self.recv_reply(&buf)? {
            Reply::Ready(_) => Ok(()),
            other => Err(self.note_error(OffloadError::ProtocolError(format!(
                "expected a Ready reply, got {other:?}"
            )))),
        }
    }

    /// Requests cancellation of an in-flight render. Forces an immediate
    /// flush since `Cancel` is not in `Command::flushing()`'s list and
    /// scenario S3 bounds how soon a worker must observe it.
    pub fn cancel(&self, future: Handle) -> Result<(), OffloadError> {
        self.check_connected()?;
        self.registry
            .with_object(future, ObjectKind::Future, |_| ())?;
        let mut buf = self.buf.lock().unwrap();
        self.enqueue(&mut buf, Command::Cancel { future })?;
        self.flush(&mut buf)
    }

    pub fn get_progress(&self, future: Handle) -> Result<f32, OffloadError> {
        self.check_connected()?;
        self.registry
            .with_object(future, ObjectKind::Future, |_| ())?;
        let mut buf = self.buf.lock().unwrap();
        self.enqueue(&mut buf, Command::GetProgress { future })?;
        match self.recv_reply(&buf)? {
            Reply::Progress(fraction) => Ok(fraction),
            other => Err(self.note_error(OffloadError::ProtocolError(format!(
                "expected a Progress reply, got {other:?}"
            )))),
        }
    }

    pub fn get_task_duration(&self, future: Handle) -> Result<Duration, OffloadError> {
        self.check_connected()?;
        self.registry
            .with_object(future, ObjectKind::Future, |_| ())?;
        let mut buf = self.buf.lock().unwrap();
        self.enqueue(&mut buf, Command::GetTaskDuration { future })?;
        match self.recv_reply(&buf)? {
            Reply::Duration(nanos) => Ok(Duration::from_nanos(nanos)),
            other => Err(self.note_error(OffloadError::ProtocolError(format!(
                "expected a Duration reply, got {other:?}"
            )))),
        }
    }

    pub fn pick(
        &self,
        renderer: Handle,
        camera: Handle,
        world: Handle,
        screen: [f32; 2],
    ) -> Result<PickResult, OffloadError> {
        self.check_connected()?;
        let mut buf = self.buf.lock().unwrap();
        self.enqueue(
            &mut buf,
            Command::Pick {
                renderer,
                camera,
                world,
                screen,
            },
        )?;
        match self.recv_reply(&buf)? {
            Reply::Pick { hit, position } => Ok(PickResult { hit, position }),
            other => Err(self.note_error(OffloadError::ProtocolError(format!(
                "expected a Pick reply, got {other:?}"
            )))),
        }
    }

    pub fn get_bounds(&self, handle: Handle) -> Result<Bounds, OffloadError> {
        self.check_connected()?;
        let mut buf = self.buf.lock().unwrap();
        self.enqueue(&mut buf, Command::GetBounds { handle })?;
        match self.recv_reply(&buf)? {
            Reply::Bounds { lo, hi } => Ok(Bounds { lo, hi }),
            other => Err(self.note_error(OffloadError::ProtocolError(format!(
                "expected a Bounds reply, got {other:?}"
            )))),
        }
    }
}

/// Stand-in for real SIMD-capability detection (§7's `UnsupportedCpu`,
/// "fatal at init"). Every target this workspace currently builds for has
/// the baseline floating-point path the dispatcher's tile renderer needs,
/// so this always succeeds; a real ISA check would replace the body.
fn detect_cpu_features() -> Result<(), OffloadError> {
    Ok(())
}
