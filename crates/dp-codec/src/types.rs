//! The §3 data model's wire types: object kinds, the `DataType` tag, the
//! `Parameter` tagged union, and the data-array header.

use crate::wire::{CodecError, Decoder, Encoder, WireEncode};
use dp_handle::Handle;

/// Every addressable entity kind a managed object can be. Carried both as the
/// discriminant inside [`DataType::Object`] and as the tag stored on each
/// managed object in the registry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u16)]
pub enum ObjectKind {
    Renderer = 0,
    Camera = 1,
    World = 2,
    Geometry = 3,
    Volume = 4,
    FrameBuffer = 5,
    Future = 6,
    Data = 7,
    Texture = 8,
    Material = 9,
    TransferFunction = 10,
    Light = 11,
    ImageOp = 12,
    Instance = 13,
    Group = 14,
    Model = 15,
}

impl ObjectKind {
    pub const ALL: [ObjectKind; 16] = [
        ObjectKind::Renderer,
        ObjectKind::Camera,
        ObjectKind::World,
        ObjectKind::Geometry,
        ObjectKind::Volume,
        ObjectKind::FrameBuffer,
        ObjectKind::Future,
        ObjectKind::Data,
        ObjectKind::Texture,
        ObjectKind::Material,
        ObjectKind::TransferFunction,
        ObjectKind::Light,
        ObjectKind::ImageOp,
        ObjectKind::Instance,
        ObjectKind::Group,
        ObjectKind::Model,
    ];

    fn from_u16(v: u16) -> Result<Self, CodecError> {
        Self::ALL
            .into_iter()
            .find(|k| *k as u16 == v)
            .ok_or(CodecError::InvalidDiscriminant(v as u32, "ObjectKind"))
    }
}

impl WireEncode for ObjectKind {
    fn encode(&self, enc: &mut Encoder) {
        enc.put_u16(*self as u16);
    }
    fn decode(dec: &mut Decoder) -> Result<Self, CodecError> {
        Self::from_u16(dec.get_u16()?)
    }
}

/// Element type of a [`DataArraySpec`] / tag of a [`ParamValue`]. A worker
/// checks this against the type it expected on receipt and fails with
/// `TypeMismatch` on disagreement.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum DataType {
    Void,
    Bool,
    Char,
    UChar,
    Short,
    UShort,
    Int,
    UInt,
    Int64,
    UInt64,
    Float,
    Double,
    Vec2f,
    Vec3f,
    Vec4f,
    Vec2i,
    Vec3i,
    Vec4i,
    Box1f,
    Box2f,
    Box3f,
    Box1i,
    Box2i,
    Box3i,
    LinearMatrix3f,
    AffineSpace3f,
    String,
    Object(ObjectKind),
}

impl DataType {
    /// Tightly-packed element size in bytes, used to infer zero strides.
    /// `Object` elements hold a `Handle` (8 bytes); `Void`/`String` have no
    /// fixed element size and are never used as a data-array element type.
    pub fn packed_size(self) -> Option<usize> {
        use DataType::*;
        Some(match self {
            Void | String => return None,
            Bool | Char | UChar => 1,
            Short | UShort => 2,
            Int | UInt | Float => 4,
            Int64 | UInt64 | Double => 8,
            Vec2f | Vec2i => 8,
            Vec3f | Vec3i => 12,
            Vec4f | Vec4i => 16,
            Box1f | Box1i => 8,
            Box2f | Box2i => 16,
            Box3f | Box3i => 24,
            LinearMatrix3f => 36,
            AffineSpace3f => 48,
            Object(_) => 8,
        })
    }

    fn tag(self) -> u16 {
        use DataType::*;
        match self {
            Void => 0,
            Bool => 1,
            Char => 2,
            UChar => 3,
            Short => 4,
            UShort => 5,
            Int => 6,
            UInt => 7,
            Int64 => 8,
            UInt64 => 9,
            Float => 10,
            Double => 11,
            Vec2f => 12,
            Vec3f => 13,
            Vec4f => 14,
            Vec2i => 15,
            Vec3i => 16,
            Vec4i => 17,
            Box1f => 18,
            Box2f => 19,
            Box3f => 20,
            Box1i => 21,
            Box2i => 22,
            Box3i => 23,
            LinearMatrix3f => 24,
            AffineSpace3f => 25,
            String => 26,
            Object(_) => 27,
        }
    }
}

impl WireEncode for DataType {
    fn encode(&self, enc: &mut Encoder) {
        enc.put_u16(self.tag());
        if let DataType::Object(kind) = self {
            kind.encode(enc);
        }
    }
    fn decode(dec: &mut Decoder) -> Result<Self, CodecError> {
        use DataType::*;
        let tag = dec.get_u16()?;
        Ok(match tag {
            0 => Void,
            1 => Bool,
            2 => Char,
            3 => UChar,
            4 => Short,
            5 => UShort,
            6 => Int,
            7 => UInt,
            8 => Int64,
            9 => UInt64,
            10 => Float,
            11 => Double,
            12 => Vec2f,
            13 => Vec3f,
            14 => Vec4f,
            15 => Vec2i,
            16 => Vec3i,
            17 => Vec4i,
            18 => Box1f,
            19 => Box2f,
            20 => Box3f,
            21 => Box1i,
            22 => Box2i,
            23 => Box3i,
            24 => LinearMatrix3f,
            25 => AffineSpace3f,
            26 => String,
            27 => Object(ObjectKind::decode(dec)?),
            other => return Err(CodecError::InvalidDiscriminant(other as u32, "DataType")),
        })
    }
}

/// Linear part followed by translation, matching §4.3's affine encoding rule.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct AffineSpace3f {
    pub linear: [[f32; 3]; 3],
    pub translation: [f32; 3],
}

impl WireEncode for AffineSpace3f {
    fn encode(&self, enc: &mut Encoder) {
        for row in &self.linear {
            row.encode(enc);
        }
        self.translation.encode(enc);
    }
    fn decode(dec: &mut Decoder) -> Result<Self, CodecError> {
        let mut linear = [[0.0f32; 3]; 3];
        for row in &mut linear {
            *row = <[f32; 3]>::decode(dec)?;
        }
        let translation = <[f32; 3]>::decode(dec)?;
        Ok(Self {
            linear,
            translation,
        })
    }
}

/// Tagged-union parameter payload. The discriminant doubles as the
/// [`DataType`] a receiving worker checks the assignment against.
#[derive(Debug, Clone, PartialEq)]
pub enum ParamValue {
    Bool(bool),
    Char(i8),
    UChar(u8),
    Short(i16),
    UShort(u16),
    Int(i32),
    UInt(u32),
    Int64(i64),
    UInt64(u64),
    Float(f32),
    Double(f64),
    Vec2f([f32; 2]),
    Vec3f([f32; 3]),
    Vec4f([f32; 4]),
    Vec2i([i32; 2]),
    Vec3i([i32; 3]),
    Vec4i([i32; 4]),
    Box1f { lo: f32, hi: f32 },
    Box2f { lo: [f32; 2], hi: [f32; 2] },
    Box3f { lo: [f32; 3], hi: [f32; 3] },
    Box1i { lo: i32, hi: i32 },
    Box2i { lo: [i32; 2], hi: [i32; 2] },
    Box3i { lo: [i32; 3], hi: [i32; 3] },
    LinearMatrix3f([[f32; 3]; 3]),
    AffineSpace3f(AffineSpace3f),
    String(String),
    Object(ObjectKind, Handle),
}

impl ParamValue {
    pub fn data_type(&self) -> DataType {
        use ParamValue::*;
        match self {
            Bool(_) => DataType::Bool,
            Char(_) => DataType::Char,
            UChar(_) => DataType::UChar,
            Short(_) => DataType::Short,
            UShort(_) => DataType::UShort,
            Int(_) => DataType::Int,
            UInt(_) => DataType::UInt,
            Int64(_) => DataType::Int64,
            UInt64(_) => DataType::UInt64,
            Float(_) => DataType::Float,
            Double(_) => DataType::Double,
            Vec2f(_) => DataType::Vec2f,
            Vec3f(_) => DataType::Vec3f,
            Vec4f(_) => DataType::Vec4f,
            Vec2i(_) => DataType::Vec2i,
            Vec3i(_) => DataType::Vec3i,
            Vec4i(_) => DataType::Vec4i,
            Box1f { .. } => DataType::Box1f,
            Box2f { .. } => DataType::Box2f,
            Box3f { .. } => DataType::Box3f,
            Box1i { .. } => DataType::Box1i,
            Box2i { .. } => DataType::Box2i,
            Box3i { .. } => DataType::Box3i,
            LinearMatrix3f(_) => DataType::LinearMatrix3f,
            AffineSpace3f(_) => DataType::AffineSpace3f,
            String(_) => DataType::String,
            Object(kind, _) => DataType::Object(*kind),
        }
    }

    /// The handle this parameter references, if it names another managed
    /// object (used by the registry to adjust refcounts on assignment).
    pub fn referenced_handle(&self) -> Option<Handle> {
        match self {
            ParamValue::Object(_, h) => Some(*h),
            _ => None,
        }
    }
}

impl WireEncode for ParamValue {
    fn encode(&self, enc: &mut Encoder) {
        self.data_type().encode(enc);
        use ParamValue::*;
        match self {
            Bool(v) => v.encode(enc),
            Char(v) => v.encode(enc),
            UChar(v) => v.encode(enc),
            Short(v) => v.encode(enc),
            UShort(v) => v.encode(enc),
            Int(v) => v.encode(enc),
            UInt(v) => v.encode(enc),
            Int64(v) => v.encode(enc),
            UInt64(v) => v.encode(enc),
            Float(v) => v.encode(enc),
            Double(v) => v.encode(enc),
            Vec2f(v) => v.encode(enc),
            Vec3f(v) => v.encode(enc),
            Vec4f(v) => v.encode(enc),
            Vec2i(v) => v.encode(enc),
            Vec3i(v) => v.encode(enc),
            Vec4i(v) => v.encode(enc),
            Box1f { lo, hi } => {
                lo.encode(enc);
                hi.encode(enc);
            }
            Box2f { lo, hi } => {
                lo.encode(enc);
                hi.encode(enc);
            }
            Box3f { lo, hi } => {
                lo.encode(enc);
                hi.encode(enc);
            }
            Box1i { lo, hi } => {
                lo.encode(enc);
                hi.encode(enc);
            }
            Box2i { lo, hi } => {
                lo.encode(enc);
                hi.encode(enc);
            }
            Box3i { lo, hi } => {
                lo.encode(enc);
                hi.encode(enc);
            }
            LinearMatrix3f(m) => {
                for row in m {
                    row.encode(enc);
                }
            }
            AffineSpace3f(a) => a.encode(enc),
            String(s) => s.encode(enc),
            Object(_, h) => h.encode(enc),
        }
    }

    fn decode(dec: &mut Decoder) -> Result<Self, CodecError> {
        let data_type = DataType::decode(dec)?;
        Ok(match data_type {
            DataType::Void => {
                return Err(CodecError::InvalidDiscriminant(0, "ParamValue"));
            }
            DataType::Bool => ParamValue::Bool(bool::decode(dec)?),
            DataType::Char => ParamValue::Char(i8::decode(dec)?),
            DataType::UChar => ParamValue::UChar(u8::decode(dec)?),
            DataType::Short => ParamValue::Short(i16::decode(dec)?),
            DataType::UShort => ParamValue::UShort(u16::decode(dec)?),
            DataType::Int => ParamValue::Int(i32::decode(dec)?),
            DataType::UInt => ParamValue::UInt(u32::decode(dec)?),
            DataType::Int64 => ParamValue::Int64(i64::decode(dec)?),
            DataType::UInt64 => ParamValue::UInt64(u64::decode(dec)?),
            DataType::Float => ParamValue::Float(f32::decode(dec)?),
            DataType::Double => ParamValue::Double(f64::decode(dec)?),
            DataType::Vec2f => ParamValue::Vec2f(<[f32; 2]>::decode(dec)?),
            DataType::Vec3f => ParamValue::Vec3f(<[f32; 3]>::decode(dec)?),
            DataType::Vec4f => ParamValue::Vec4f(<[f32; 4]>::decode(dec)?),
            DataType::Vec2i => ParamValue::Vec2i(<[i32; 2]>::decode(dec)?),
            DataType::Vec3i => ParamValue::Vec3i(<[i32; 3]>::decode(dec)?),
            DataType::Vec4i => ParamValue::Vec4i(<[i32; 4]>::decode(dec)?),
            DataType::Box1f => ParamValue::Box1f {
                lo: f32::decode(dec)?,
                hi: f32::decode(dec)?,
            },
            DataType::Box2f => ParamValue::Box2f {
                lo: <[f32; 2]>::decode(dec)?,
                hi: <[f32; 2]>::decode(dec)?,
            },
            DataType::Box3f => ParamValue::Box3f {
                lo: <[f32; 3]>::decode(dec)?,
                hi: <[f32; 3]>::decode(dec)?,
            },
            DataType::Box1i => ParamValue::Box1i {
                lo: i32::decode(dec)?,
                hi: i32::decode(dec)?,
            },
            DataType::Box2i => ParamValue::Box2i {
                lo: <[i32; 2]>::decode(dec)?,
                hi: <[i32; 2]>::decode(dec)?,
            },
            DataType::Box3i => ParamValue::Box3i {
                lo: <[i32; 3]>::decode(dec)?,
                hi: <[i32; 3]>::decode(dec)?,
            },
            DataType::LinearMatrix3f => {
                let mut m = [[0.0f32; 3]; 3];
                for row in &mut m {
                    *row = <[f32; 3]>::decode(dec)?;
                }
                ParamValue::LinearMatrix3f(m)
            }
            DataType::AffineSpace3f => ParamValue::AffineSpace3f(AffineSpace3f::decode(dec)?),
            DataType::String => ParamValue::String(String::decode(dec)?),
            DataType::Object(kind) => ParamValue::Object(kind, Handle::decode(dec)?),
        })
    }
}

/// Fixed-size extents/strides header for a data array (§3 "Data array").
/// A stride of zero on an axis means "tightly packed, inferred from element
/// size and lower axes"; [`DataArraySpec::is_compact`] derives compactness,
/// it is never stored as explicit state.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct DataArraySpec {
    pub element_type: DataType,
    pub extents: (u32, u32, u32),
    pub byte_strides: (u32, u32, u32),
}

impl DataArraySpec {
    /// Strides with zero axes resolved against the tightly-packed layout.
    pub fn resolved_strides(&self) -> (u32, u32, u32) {
        let elem = self.element_type.packed_size().unwrap_or(1) as u32;
        let sx = if self.byte_strides.0 == 0 {
            elem
        } else {
            self.byte_strides.0
        };
        let sy = if self.byte_strides.1 == 0 {
            sx * self.extents.0
        } else {
            self.byte_strides.1
        };
        let sz = if self.byte_strides.2 == 0 {
            sy * self.extents.1
        } else {
            self.byte_strides.2
        };
        (sx, sy, sz)
    }

    /// True iff every axis stride equals the tightly-packed stride it would
    /// have resolved to had it been left at zero. Derived, never stored.
    pub fn is_compact(&self) -> bool {
        let elem = self.element_type.packed_size().unwrap_or(1) as u32;
        let packed_sx = elem;
        let packed_sy = packed_sx * self.extents.0;
        let packed_sz = packed_sy * self.extents.1;
        let (sx, sy, sz) = self.resolved_strides();
        (sx, sy, sz) == (packed_sx, packed_sy, packed_sz)
    }

    pub fn element_count(&self) -> u64 {
        self.extents.0 as u64 * self.extents.1.max(1) as u64 * self.extents.2.max(1) as u64
    }

    /// Total byte length implied by extents and resolved strides along the
    /// slowest-varying axis, used to size inline vs. sidechannel payloads.
    pub fn byte_len(&self) -> u64 {
        let (_, _, sz) = self.resolved_strides();
        sz as u64 * self.extents.2.max(1) as u64
    }
}

impl WireEncode for DataArraySpec {
    fn encode(&self, enc: &mut Encoder) {
        self.element_type.encode(enc);
        enc.put_u32(self.extents.0);
        enc.put_u32(self.extents.1);
        enc.put_u32(self.extents.2);
        enc.put_u32(self.byte_strides.0);
        enc.put_u32(self.byte_strides.1);
        enc.put_u32(self.byte_strides.2);
    }
    fn decode(dec: &mut Decoder) -> Result<Self, CodecError> {
        let element_type = DataType::decode(dec)?;
        let extents = (dec.get_u32()?, dec.get_u32()?, dec.get_u32()?);
        let byte_strides = (dec.get_u32()?, dec.get_u32()?, dec.get_u32()?);
        Ok(Self {
            element_type,
            extents,
            byte_strides,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn param_value_round_trips_every_kind() {
        let samples = vec![
            ParamValue::Bool(true),
            ParamValue::Int(-5),
            ParamValue::UInt64(9_000_000_000),
            ParamValue::Vec3f([1.0, 2.0, 3.0]),
            ParamValue::Box3f {
                lo: [0.0, 0.0, 0.0],
                hi: [1.0, 1.0, 1.0],
            },
            ParamValue::AffineSpace3f(AffineSpace3f {
                linear: [[1.0, 0.0, 0.0], [0.0, 1.0, 0.0], [0.0, 0.0, 1.0]],
                translation: [0.0, 0.0, 0.0],
            }),
            ParamValue::String("diffuse".to_string()),
            ParamValue::Object(ObjectKind::Material, Handle::new(0, 3)),
        ];
        for value in samples {
            let mut enc = Encoder::new();
            value.encode(&mut enc);
            let bytes = enc.into_bytes();
            let mut dec = Decoder::new(&bytes);
            assert_eq!(ParamValue::decode(&mut dec).unwrap(), value);
            assert!(dec.is_empty());
        }
    }

    #[test]
    fn zero_stride_means_tightly_packed() {
        let spec = DataArraySpec {
            element_type: DataType::Float,
            extents: (4, 4, 1),
            byte_strides: (0, 0, 0),
        };
        assert!(spec.is_compact());
        assert_eq!(spec.resolved_strides(), (4, 16, 64));
        assert_eq!(spec.byte_len(), 64);
    }

    #[test]
    fn explicit_matching_strides_are_still_compact() {
        let spec = DataArraySpec {
            element_type: DataType::Float,
            extents: (4, 4, 1),
            byte_strides: (4, 16, 64),
        };
        assert!(spec.is_compact());
    }

    #[test]
    fn padded_strides_are_not_compact() {
        let spec = DataArraySpec {
            element_type: DataType::Float,
            extents: (4, 4, 1),
            byte_strides: (4, 32, 128),
        };
        assert!(!spec.is_compact());
    }

    #[test]
    fn object_kind_round_trips() {
        for kind in ObjectKind::ALL {
            let mut enc = Encoder::new();
            kind.encode(&mut enc);
            let bytes = enc.into_bytes();
            let mut dec = Decoder::new(&bytes);
            assert_eq!(ObjectKind::decode(&mut dec).unwrap(), kind);
        }
    }
}
