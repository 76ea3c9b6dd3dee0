//! C3: the deterministic little-endian binary codec for the command stream,
//! plus the wire representations of the §3 data model (`DataType`,
//! `ParamValue`, `DataArraySpec`) that commands carry as arguments.

mod command;
mod types;
mod wire;

pub use command::{Command, CompositeMode, DataPayload, FbChannel, FbChannels, FrameEvent};
pub use types::{AffineSpace3f, DataArraySpec, DataType, ObjectKind, ParamValue};
pub use wire::{CodecError, Decoder, Encoder, WireEncode};

#[cfg(test)]
mod proptests {
    use super::*;
    use dp_handle::Handle;
    use proptest::prelude::*;

    fn arb_param_value() -> impl Strategy<Value = ParamValue> {
        prop_oneof![
            any::<bool>().prop_map(ParamValue::Bool),
            any::<i32>().prop_map(ParamValue::Int),
            any::<u64>().prop_map(ParamValue::UInt64),
            any::<f32>().prop_map(ParamValue::Float),
            any::<f64>().prop_map(ParamValue::Double),
            any::<[f32; 3]>().prop_map(ParamValue::Vec3f),
            "[a-z]{1,16}".prop_map(ParamValue::String),
            (any::<u16>(), any::<u32>())
                .prop_map(|(rank, counter)| ParamValue::Object(
                    ObjectKind::Material,
                    Handle::new(rank, counter)
                )),
        ]
    }

    proptest! {
        #[test]
        fn param_value_round_trip(value in arb_param_value()) {
            let mut enc = Encoder::new();
            value.encode(&mut enc);
            let bytes = enc.into_bytes();
            let mut dec = Decoder::new(&bytes);
            let decoded = ParamValue::decode(&mut dec).unwrap();
            prop_assert_eq!(decoded, value);
            prop_assert!(dec.is_empty());
        }

        #[test]
        fn commit_release_retain_round_trip(rank in any::<u16>(), counter in any::<u32>()) {
            let handle = Handle::new(rank, counter);
            for cmd in [
                Command::Commit { handle },
                Command::Retain { handle },
                Command::Release { handle },
            ] {
                let mut enc = Encoder::new();
                cmd.encode_record(&mut enc);
                let bytes = enc.into_bytes();
                let mut dec = Decoder::new(&bytes);
                prop_assert_eq!(Command::decode_record(&mut dec).unwrap(), cmd);
            }
        }
    }
}
