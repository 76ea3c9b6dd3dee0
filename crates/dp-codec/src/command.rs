//! The closed command-tag list (§4.3) and the `Command` payload enum each
//! tag's fixed argument list decodes into.

use crate::types::{DataArraySpec, DataType, ObjectKind, ParamValue};
use crate::wire::{CodecError, Decoder, Encoder, WireEncode};
use dp_handle::Handle;

bitflags::bitflags! {
    /// Which framebuffer channels a tile/framebuffer carries.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    pub struct FbChannels: u8 {
        const COLOR    = 0b0000_0001;
        const ALPHA    = 0b0000_0010;
        const DEPTH    = 0b0000_0100;
        const NORMAL   = 0b0000_1000;
        const ALBEDO   = 0b0001_0000;
        const VARIANCE = 0b0010_0000;
    }
}

impl WireEncode for FbChannels {
    fn encode(&self, enc: &mut Encoder) {
        enc.put_u8(self.bits());
    }
    fn decode(dec: &mut Decoder) -> Result<Self, CodecError> {
        Ok(Self::from_bits_truncate(dec.get_u8()?))
    }
}

/// C6 tile composition strategy, fixed at framebuffer creation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CompositeMode {
    WriteOnce,
    ZComposite,
    AlphaBlend,
}

impl WireEncode for CompositeMode {
    fn encode(&self, enc: &mut Encoder) {
        let tag = match self {
            CompositeMode::WriteOnce => 0u8,
            CompositeMode::ZComposite => 1,
            CompositeMode::AlphaBlend => 2,
        };
        enc.put_u8(tag);
    }
    fn decode(dec: &mut Decoder) -> Result<Self, CodecError> {
        Ok(match dec.get_u8()? {
            0 => CompositeMode::WriteOnce,
            1 => CompositeMode::ZComposite,
            2 => CompositeMode::AlphaBlend,
            other => return Err(CodecError::InvalidDiscriminant(other as u32, "CompositeMode")),
        })
    }
}

/// Completion events for a [`crate::Command::RenderFrame`]'s future, forming
/// the total order `NoneFinished < WorldRendered < FrameFinished`. `isReady`
/// is monotone with respect to this order: once an event is ready, every
/// lesser event stays ready too.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
#[repr(u8)]
pub enum FrameEvent {
    NoneFinished = 0,
    WorldRendered = 1,
    FrameFinished = 2,
}

impl WireEncode for FrameEvent {
    fn encode(&self, enc: &mut Encoder) {
        enc.put_u8(*self as u8);
    }
    fn decode(dec: &mut Decoder) -> Result<Self, CodecError> {
        Ok(match dec.get_u8()? {
            0 => FrameEvent::NoneFinished,
            1 => FrameEvent::WorldRendered,
            2 => FrameEvent::FrameFinished,
            other => return Err(CodecError::InvalidDiscriminant(other as u32, "FrameEvent")),
        })
    }
}

/// Where a data array's bytes travel relative to the command that creates it.
/// `Sidechannel` means the bytes were (or will be) broadcast separately by
/// C4 immediately before this record; see §4.4's large-payload rule.
#[derive(Debug, Clone, PartialEq)]
pub enum DataPayload {
    Inline(Vec<u8>),
    Sidechannel,
}

impl WireEncode for DataPayload {
    fn encode(&self, enc: &mut Encoder) {
        match self {
            DataPayload::Inline(bytes) => {
                enc.put_u8(0);
                enc.put_byte_vec(bytes);
            }
            DataPayload::Sidechannel => enc.put_u8(1),
        }
    }
    fn decode(dec: &mut Decoder) -> Result<Self, CodecError> {
        Ok(match dec.get_u8()? {
            0 => DataPayload::Inline(dec.get_byte_vec()?),
            1 => DataPayload::Sidechannel,
            other => return Err(CodecError::InvalidDiscriminant(other as u32, "DataPayload")),
        })
    }
}

/// Which channel [`Command::MapFrameBuffer`] requests.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FbChannel {
    Color,
    Alpha,
    Depth,
    Normal,
    Albedo,
    Variance,
}

impl WireEncode for FbChannel {
    fn encode(&self, enc: &mut Encoder) {
        let tag = match self {
            FbChannel::Color => 0u8,
            FbChannel::Alpha => 1,
            FbChannel::Depth => 2,
            FbChannel::Normal => 3,
            FbChannel::Albedo => 4,
            FbChannel::Variance => 5,
        };
        enc.put_u8(tag);
    }
    fn decode(dec: &mut Decoder) -> Result<Self, CodecError> {
        Ok(match dec.get_u8()? {
            0 => FbChannel::Color,
            1 => FbChannel::Alpha,
            2 => FbChannel::Depth,
            3 => FbChannel::Normal,
            4 => FbChannel::Albedo,
            5 => FbChannel::Variance,
            other => return Err(CodecError::InvalidDiscriminant(other as u32, "FbChannel")),
        })
    }
}

/// A decoded command: tag plus its fixed argument list. One `Command` is the
/// payload of one wire record `(u16 tag, u32 len, payload)`.
#[derive(Debug, Clone, PartialEq)]
pub enum Command {
    NewObject {
        kind: ObjectKind,
        handle: Handle,
    },
    NewData {
        handle: Handle,
        spec: DataArraySpec,
        shared: bool,
        payload: DataPayload,
    },
    SetParam {
        handle: Handle,
        name: String,
        value: ParamValue,
    },
    RemoveParam {
        handle: Handle,
        name: String,
    },
    Commit {
        handle: Handle,
    },
    Retain {
        handle: Handle,
    },
    Release {
        handle: Handle,
    },
    CopyData {
        dst: Handle,
        dst_offset: [u32; 3],
        src: Handle,
    },
    NewFrameBuffer {
        handle: Handle,
        width: u32,
        height: u32,
        tile_size: u32,
        mode: CompositeMode,
        channels: FbChannels,
    },
    RenderFrame {
        framebuffer: Handle,
        renderer: Handle,
        camera: Handle,
        world: Handle,
        future: Handle,
    },
    IsReady {
        future: Handle,
        event: FrameEvent,
    },
    Wait {
        future: Handle,
        event: FrameEvent,
    },
    Cancel {
        future: Handle,
    },
    GetProgress {
        future: Handle,
    },
    GetTaskDuration {
        future: Handle,
    },
    Pick {
        renderer: Handle,
        camera: Handle,
        world: Handle,
        screen: [f32; 2],
    },
    GetBounds {
        handle: Handle,
    },
    MapFrameBuffer {
        handle: Handle,
        channel: FbChannel,
    },
    UnmapFrameBuffer {
        handle: Handle,
    },
    GetVariance {
        handle: Handle,
    },
    ResetAccumulation {
        handle: Handle,
    },
    LoadModule {
        name: String,
    },
    Shutdown,
}

impl Command {
    fn tag(&self) -> u16 {
        match self {
            Command::NewObject { .. } => 0,
            Command::NewData { .. } => 1,
            Command::SetParam { .. } => 2,
            Command::RemoveParam { .. } => 3,
            Command::Commit { .. } => 4,
            Command::Retain { .. } => 5,
            Command::Release { .. } => 6,
            Command::CopyData { .. } => 7,
            Command::NewFrameBuffer { .. } => 8,
            Command::RenderFrame { .. } => 9,
            Command::IsReady { .. } => 10,
            Command::Wait { .. } => 11,
            Command::Cancel { .. } => 12,
            Command::GetProgress { .. } => 13,
            Command::GetTaskDuration { .. } => 14,
            Command::Pick { .. } => 15,
            Command::GetBounds { .. } => 16,
            Command::MapFrameBuffer { .. } => 17,
            Command::UnmapFrameBuffer { .. } => 18,
            Command::GetVariance { .. } => 19,
            Command::ResetAccumulation { .. } => 20,
            Command::LoadModule { .. } => 21,
            Command::Shutdown => 22,
        }
    }

    /// §4.4's automatic-flush predicate: create-framebuffer, render-frame,
    /// any query that expects a reply, or shutdown.
    pub fn flushing(&self) -> bool {
        matches!(
            self,
            Command::NewFrameBuffer { .. }
                | Command::RenderFrame { .. }
                | Command::IsReady { .. }
                | Command::Wait { .. }
                | Command::GetProgress { .. }
                | Command::GetTaskDuration { .. }
                | Command::Pick { .. }
                | Command::GetBounds { .. }
                | Command::MapFrameBuffer { .. }
                | Command::GetVariance { .. }
                | Command::Shutdown
        )
    }

    /// Whether the rank that owns the answer must send a reply back to the
    /// host over the point-to-point channel (§4.5 "replies-required" class).
    pub fn expects_reply(&self) -> bool {
        matches!(
            self,
            Command::MapFrameBuffer { .. }
                | Command::GetVariance { .. }
                | Command::Pick { .. }
                | Command::GetBounds { .. }
                | Command::IsReady { .. }
                | Command::Wait { .. }
                | Command::GetProgress { .. }
                | Command::GetTaskDuration { .. }
        )
    }

    /// Whether every worker must participate (rendering a frame), as opposed
    /// to local-only handling or a single owning rank replying.
    pub fn collective(&self) -> bool {
        matches!(self, Command::RenderFrame { .. })
    }

    /// Encode the full wire record: `u16 tag`, `u32 payload-length`, payload.
    pub fn encode_record(&self, enc: &mut Encoder) {
        let mut payload = Encoder::new();
        self.encode_payload(&mut payload);
        let bytes = payload.into_bytes();
        enc.put_u16(self.tag());
        enc.put_u32(bytes.len() as u32);
        enc.put_bytes_raw(&bytes);
    }

    fn encode_payload(&self, enc: &mut Encoder) {
        match self {
            Command::NewObject { kind, handle } => {
                kind.encode(enc);
                handle.encode(enc);
            }
            Command::NewData {
                handle,
                spec,
                shared,
                payload,
            } => {
                handle.encode(enc);
                spec.encode(enc);
                shared.encode(enc);
                payload.encode(enc);
            }
            Command::SetParam {
                handle,
                name,
                value,
            } => {
                handle.encode(enc);
                name.encode(enc);
                value.encode(enc);
            }
            Command::RemoveParam { handle, name } => {
                handle.encode(enc);
                name.encode(enc);
            }
            Command::Commit { handle }
            | Command::Retain { handle }
            | Command::Release { handle }
            | Command::GetBounds { handle }
            | Command::UnmapFrameBuffer { handle }
            | Command::GetVariance { handle }
            | Command::ResetAccumulation { handle } => handle.encode(enc),
            Command::CopyData {
                dst,
                dst_offset,
                src,
            } => {
                dst.encode(enc);
                dst_offset.encode(enc);
                src.encode(enc);
            }
            Command::NewFrameBuffer {
                handle,
                width,
                height,
                tile_size,
                mode,
                channels,
            } => {
                handle.encode(enc);
                enc.put_u32(*width);
                enc.put_u32(*height);
                enc.put_u32(*tile_size);
                mode.encode(enc);
                channels.encode(enc);
            }
            Command::RenderFrame {
                framebuffer,
                renderer,
                camera,
                world,
                future,
            } => {
                framebuffer.encode(enc);
                renderer.encode(enc);
                camera.encode(enc);
                world.encode(enc);
                future.encode(enc);
            }
            Command::IsReady { future, event } | Command::Wait { future, event } => {
                future.encode(enc);
                event.encode(enc);
            }
            Command::Cancel { future }
            | Command::GetProgress { future }
            | Command::GetTaskDuration { future } => future.encode(enc),
            Command::Pick {
                renderer,
                camera,
                world,
                screen,
            } => {
                renderer.encode(enc);
                camera.encode(enc);
                world.encode(enc);
                screen.encode(enc);
            }
            Command::MapFrameBuffer { handle, channel } => {
                handle.encode(enc);
                channel.encode(enc);
            }
            Command::LoadModule { name } => name.encode(enc),
            Command::Shutdown => {}
        }
    }

    /// Decode one `(tag, length, payload)` record. `ProtocolError` on an
    /// unrecognized tag or a payload shorter than its declared length.
    pub fn decode_record(dec: &mut Decoder) -> Result<Self, CodecError> {
        let tag = dec.get_u16()?;
        let len = dec.get_u32()? as usize;
        let record_bytes = dec.take(len)?;
        let mut tmp = Decoder::new(record_bytes);
        let cmd = Self::decode_payload(tag, &mut tmp)?;
        if !tmp.is_empty() {
            return Err(CodecError::Truncated {
                wanted: 0,
                available: tmp.remaining(),
            });
        }
        Ok(cmd)
    }

    fn decode_payload(tag: u16, dec: &mut Decoder) -> Result<Self, CodecError> {
        Ok(match tag {
            0 => Command::NewObject {
                kind: ObjectKind::decode(dec)?,
                handle: Handle::decode(dec)?,
            },
            1 => Command::NewData {
                handle: Handle::decode(dec)?,
                spec: DataArraySpec::decode(dec)?,
                shared: bool::decode(dec)?,
                payload: DataPayload::decode(dec)?,
            },
            2 => Command::SetParam {
                handle: Handle::decode(dec)?,
                name: String::decode(dec)?,
                value: ParamValue::decode(dec)?,
            },
            3 => Command::RemoveParam {
                handle: Handle::decode(dec)?,
                name: String::decode(dec)?,
            },
            4 => Command::Commit {
                handle: Handle::decode(dec)?,
            },
            5 => Command::Retain {
                handle: Handle::decode(dec)?,
            },
            6 => Command::Release {
                handle: Handle::decode(dec)?,
            },
            7 => Command::CopyData {
                dst: Handle::decode(dec)?,
                dst_offset: <[u32; 3]>::decode(dec)?,
                src: Handle::decode(dec)?,
            },
            8 => Command::NewFrameBuffer {
                handle: Handle::decode(dec)?,
                width: dec.get_u32()?,
                height: dec.get_u32()?,
                tile_size: dec.get_u32()?,
                mode: CompositeMode::decode(dec)?,
                channels: FbChannels::decode(dec)?,
            },
            9 => Command::RenderFrame {
                framebuffer: Handle::decode(dec)?,
                renderer: Handle::decode(dec)?,
                camera: Handle::decode(dec)?,
                world: Handle::decode(dec)?,
                future: Handle::decode(dec)?,
            },
            10 => Command::IsReady {
                future: Handle::decode(dec)?,
                event: FrameEvent::decode(dec)?,
            },
            11 => Command::Wait {
                future: Handle::decode(dec)?,
                event: FrameEvent::decode(dec)?,
            },
            12 => Command::Cancel {
                future: Handle::decode(dec)?,
            },
            13 => Command::GetProgress {
                future: Handle::decode(dec)?,
            },
            14 => Command::GetTaskDuration {
                future: Handle::decode(dec)?,
            },
            15 => Command::Pick {
                renderer: Handle::decode(dec)?,
                camera: Handle::decode(dec)?,
                world: Handle::decode(dec)?,
                screen: <[f32; 2]>::decode(dec)?,
            },
            16 => Command::GetBounds {
                handle: Handle::decode(dec)?,
            },
            17 => Command::MapFrameBuffer {
                handle: Handle::decode(dec)?,
                channel: FbChannel::decode(dec)?,
            },
            18 => Command::UnmapFrameBuffer {
                handle: Handle::decode(dec)?,
            },
            19 => Command::GetVariance {
                handle: Handle::decode(dec)?,
            },
            20 => Command::ResetAccumulation {
                handle: Handle::decode(dec)?,
            },
            21 => Command::LoadModule {
                name: String::decode(dec)?,
            },
            22 => Command::Shutdown,
            other => return Err(CodecError::UnknownTag { tag: other }),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use dp_handle::NULL_HANDLE;

    #[test]
    fn every_command_round_trips() {
        let cmds = vec![
            Command::NewObject {
                kind: ObjectKind::World,
                handle: Handle::new(0, 1),
            },
            Command::NewData {
                handle: Handle::new(0, 9),
                spec: DataArraySpec {
                    element_type: DataType::Float,
                    extents: (4, 4, 1),
                    byte_strides: (0, 0, 0),
                },
                shared: true,
                payload: DataPayload::Sidechannel,
            },
            Command::SetParam {
                handle: Handle::new(0, 1),
                name: "material".to_string(),
                value: ParamValue::Object(ObjectKind::Material, Handle::new(0, 2)),
            },
            Command::CopyData {
                dst: Handle::new(0, 9),
                dst_offset: [0, 0, 0],
                src: Handle::new(0, 10),
            },
            Command::NewFrameBuffer {
                handle: Handle::new(0, 5),
                width: 128,
                height: 128,
                tile_size: 64,
                mode: CompositeMode::ZComposite,
                channels: FbChannels::COLOR | FbChannels::DEPTH,
            },
            Command::RenderFrame {
                framebuffer: Handle::new(0, 5),
                renderer: Handle::new(0, 1),
                camera: Handle::new(0, 2),
                world: Handle::new(0, 3),
                future: Handle::new(0, 6),
            },
            Command::Pick {
                renderer: Handle::new(0, 1),
                camera: Handle::new(0, 2),
                world: Handle::new(0, 3),
                screen: [0.5, 0.5],
            },
            Command::MapFrameBuffer {
                handle: Handle::new(0, 5),
                channel: FbChannel::Variance,
            },
            Command::LoadModule {
                name: "ispc".to_string(),
            },
            Command::Shutdown,
        ];

        for cmd in cmds {
            let mut enc = Encoder::new();
            cmd.encode_record(&mut enc);
            let bytes = enc.into_bytes();
            let mut dec = Decoder::new(&bytes);
            let decoded = Command::decode_record(&mut dec).unwrap();
            assert_eq!(decoded, cmd);
            assert!(dec.is_empty());
        }
    }

    #[test]
    fn unknown_tag_is_protocol_error() {
        let mut enc = Encoder::new();
        enc.put_u16(0xFFFF);
        enc.put_u32(0);
        let bytes = enc.into_bytes();
        let mut dec = Decoder::new(&bytes);
        assert_eq!(
            Command::decode_record(&mut dec),
            Err(CodecError::UnknownTag { tag: 0xFFFF })
        );
    }

    #[test]
    fn flushing_predicate_matches_spec_list() {
        assert!(
            Command::RenderFrame {
                framebuffer: NULL_HANDLE,
                renderer: NULL_HANDLE,
                camera: NULL_HANDLE,
                world: NULL_HANDLE,
                future: NULL_HANDLE,
            }
            .flushing()
        );
        assert!(Command::Shutdown.flushing());
        assert!(
            !Command::Commit {
                handle: NULL_HANDLE
            }
            .flushing()
        );
    }
}
