//! Wire format for the "replies-required" handler class: the rank that owns
//! the result sends it back to the host over the point-to-point channel.
//! Not part of the command codec proper (§4.3 only specifies commands
//! flowing host-to-worker); this is the return leg.

use dp_codec::{Decoder, Encoder};

#[derive(Debug, Clone, PartialEq)]
pub enum Reply {
    Ready(bool),
    Progress(f32),
    Duration(u64),
    Variance(f32),
    Bounds { lo: [f32; 3], hi: [f32; 3] },
    Pick { hit: bool, position: [f32; 3] },
    MappedPixels(Vec<f32>),
}

const TAG_READY: u8 = 0;
const TAG_PROGRESS: u8 = 1;
const TAG_DURATION: u8 = 2;
const TAG_VARIANCE: u8 = 3;
const TAG_BOUNDS: u8 = 4;
const TAG_PICK: u8 = 5;
const TAG_MAPPED_PIXELS: u8 = 6;

impl Reply {
    pub fn encode(&self) -> Vec<u8> {
        let mut enc = Encoder::new();
        match self {
            Reply::Ready(ready) => {
                enc.put_u8(TAG_READY);
                enc.put_bool(*ready);
            }
            Reply::Progress(fraction) => {
                enc.put_u8(TAG_PROGRESS);
                enc.put_f32(*fraction);
            }
            Reply::Duration(nanos) => {
                enc.put_u8(TAG_DURATION);
                enc.put_u64(*nanos);
            }
            Reply::Variance(variance) => {
                enc.put_u8(TAG_VARIANCE);
                enc.put_f32(*variance);
            }
            Reply::Bounds { lo, hi } => {
                enc.put_u8(TAG_BOUNDS);
                for v in lo {
                    enc.put_f32(*v);
                }
                for v in hi {
                    enc.put_f32(*v);
                }
            }
            Reply::Pick { hit, position } => {
                enc.put_u8(TAG_PICK);
                enc.put_bool(*hit);
                for v in position {
                    enc.put_f32(*v);
                }
            }
            Reply::MappedPixels(pixels) => {
                enc.put_u8(TAG_MAPPED_PIXELS);
                enc.put_u64(pixels.len() as u64);
                for p in pixels {
                    enc.put_f32(*p);
                }
            }
        }
        enc.into_bytes()
    }

    pub fn decode(bytes: &[u8]) -> Option<Reply> {
        let mut dec = Decoder::new(bytes);
        let tag = dec.get_u8().ok()?;
        match tag {
            TAG_READY => Some(Reply::Ready(dec.get_bool().ok()?)),
            TAG_PROGRESS => Some(Reply::Progress(dec.get_f32().ok()?)),
            TAG_DURATION => Some(Reply::Duration(dec.get_u64().ok()?)),
            TAG_VARIANCE => Some(Reply::Variance(dec.get_f32().ok()?)),
            TAG_BOUNDS => {
                let mut lo = [0.0; 3];
                let mut hi = [0.0; 3];
                for v in lo.iter_mut() {
                    *v = dec.get_f32().ok()?;
                }
                for v in hi.iter_mut() {
                    *v = dec.get_f32().ok()?;
                }
                Some(Reply::Bounds { lo, hi })
            }
            TAG_PICK => {
                let hit = dec.get_bool().ok()?;
                let mut position = [0.0; 3];
                for v in position.iter_mut() {
                    *v = dec.get_f32().ok()?;
                }
                Some(Reply::Pick { hit, position })
            }
            TAG_MAPPED_PIXELS => {
                let len = dec.get_u64().ok()? as usize;
                let mut pixels = Vec::with_capacity(len);
                for _ in 0..len {
                    pixels.push(dec.get_f32().ok()?);
                }
                Some(Reply::MappedPixels(pixels))
            }
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn every_reply_kind_round_trips() {
        let samples = vec![
            Reply::Ready(true),
            Reply::Progress(0.25),
            Reply::Duration(42),
            Reply::Variance(1.5),
            Reply::Bounds {
                lo: [0.0, 0.0, 0.0],
                hi: [1.0, 1.0, 1.0],
            },
            Reply::Pick {
                hit: true,
                position: [1.0, 2.0, 3.0],
            },
            Reply::MappedPixels(vec![0.1, 0.2, 0.3]),
        ];
        for reply in samples {
            let bytes = reply.encode();
            assert_eq!(Reply::decode(&bytes), Some(reply));
        }
    }
}
