//! Worker-to-worker chatter carried over C1's point-to-point channel: tile
//! forwards (§4.6) and dynamic-balancer request/response (§4.7). Neither is
//! part of the host→worker command codec (§4.3 only specifies that
//! direction), so this is a small wire format of its own, disambiguated by a
//! leading tag byte since both kinds of message share one recv channel per
//! peer.

use dp_balancer::StealResponse;
use dp_codec::{Decoder, Encoder};
use dp_framebuffer::TileSample;

const TAG_TILE: u8 = 0;
const TAG_BALANCE_REQUEST: u8 = 1;
const TAG_BALANCE_RESPONSE_TILE: u8 = 2;
const TAG_BALANCE_RESPONSE_EXHAUSTED: u8 = 3;
const TAG_TILE_EXPORT: u8 = 4;

#[derive(Debug, Clone, PartialEq)]
pub enum PeerMessage {
    Tile(TileSample),
    BalanceRequest,
    BalanceResponse(StealResponse),
    /// A non-master rank's owned tiles, shipped to the master rank during
    /// `end_frame`'s cross-rank reduction: `(tile_x, tile_y, pixels, error)`.
    TileExport(Vec<(u32, u32, Vec<f32>, f32)>),
}

impl PeerMessage {
    pub fn encode(&self) -> Vec<u8> {
        let mut enc = Encoder::new();
        match self {
            PeerMessage::Tile(sample) => {
                enc.put_u8(TAG_TILE);
                enc.put_u32(sample.tile_x);
                enc.put_u32(sample.tile_y);
                enc.put_u32(sample.generation);
                enc.put_vec(&sample.pixels, |e, v| e.put_f32(*v));
                match &sample.depth {
                    Some(depth) => {
                        enc.put_bool(true);
                        enc.put_vec(depth, |e, v| e.put_f32(*v));
                    }
                    None => enc.put_bool(false),
                }
            }
            PeerMessage::BalanceRequest => enc.put_u8(TAG_BALANCE_REQUEST),
            PeerMessage::BalanceResponse(StealResponse::Tile(x, y)) => {
                enc.put_u8(TAG_BALANCE_RESPONSE_TILE);
                enc.put_u32(*x);
                enc.put_u32(*y);
            }
            PeerMessage::BalanceResponse(StealResponse::Exhausted) => {
                enc.put_u8(TAG_BALANCE_RESPONSE_EXHAUSTED);
            }
            PeerMessage::TileExport(tiles) => {
                enc.put_u8(TAG_TILE_EXPORT);
                enc.put_vec(tiles, |e, (tx, ty, pixels, error)| {
                    e.put_u32(*tx);
                    e.put_u32(*ty);
                    e.put_vec(pixels, |e, v| e.put_f32(*v));
                    e.put_f32(*error);
                });
            }
        }
        enc.into_bytes()
    }

    pub fn decode(bytes: &[u8]) -> Option<PeerMessage> {
        let mut dec = Decoder::new(bytes);
        match dec.get_u8().ok()? {
            TAG_TILE => {
                let tile_x = dec.get_u32().ok()?;
                let tile_y = dec.get_u32().ok()?;
                let generation = dec.get_u32().ok()?;
                let pixels = dec.get_vec(|d| d.get_f32()).ok()?;
                let has_depth = dec.get_bool().ok()?;
                let depth = if has_depth {
                    Some(dec.get_vec(|d| d.get_f32()).ok()?)
                } else {
                    None
                };
                Some(PeerMessage::Tile(TileSample {
                    tile_x,
                    tile_y,
                    pixels,
                    depth,
                    generation,
                }))
            }
            TAG_BALANCE_REQUEST => Some(PeerMessage::BalanceRequest),
            TAG_BALANCE_RESPONSE_TILE => {
                let x = dec.get_u32().ok()?;
                let y = dec.get_u32().ok()?;
                Some(PeerMessage::BalanceResponse(StealResponse::Tile(x, y)))
            }
            TAG_BALANCE_RESPONSE_EXHAUSTED => {
                Some(PeerMessage::BalanceResponse(StealResponse::Exhausted))
            }
            TAG_TILE_EXPORT => {
                let tiles = dec
                    .get_vec(|d| {
                        let tx = d.get_u32()?;
                        let ty = d.get_u32()?;
                        let pixels = d.get_vec(|d| d.get_f32())?;
                        let error = d.get_f32()?;
                        Ok((tx, ty, pixels, error))
                    })
                    .ok()?;
                Some(PeerMessage::TileExport(tiles))
            }
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn tile_message_round_trips() {
        let msg = PeerMessage::Tile(TileSample {
            tile_x: 3,
            tile_y: 4,
            pixels: vec![0.1, 0.2, 0.3],
            depth: Some(vec![1.0, 2.0, 3.0]),
            generation: 7,
        });
        let bytes = msg.encode();
        assert_eq!(PeerMessage::decode(&bytes), Some(msg));
    }

    #[test]
    fn tile_export_round_trips() {
        let msg = PeerMessage::TileExport(vec![
            (0, 0, vec![0.1, 0.2], 0.05),
            (2, 1, vec![], f32::INFINITY),
        ]);
        let bytes = msg.encode();
        assert_eq!(PeerMessage::decode(&bytes), Some(msg));
    }

    #[test]
    fn balance_messages_round_trip() {
        for msg in [
            PeerMessage::BalanceRequest,
            PeerMessage::BalanceResponse(StealResponse::Tile(1, 2)),
            PeerMessage::BalanceResponse(StealResponse::Exhausted),
        ] {
            let bytes = msg.encode();
            assert_eq!(PeerMessage::decode(&bytes), Some(msg));
        }
    }
}
