//! Static round-robin: each rank owns `{ i : i mod N == r }` and walks it in
//! order, skipping tiles already converged.

use dp_framebuffer::FrameBuffer;

pub struct StaticRoundRobin {
    rank: u32,
    world_size: u32,
    tiles_x: u32,
    total_tiles: u32,
    next_index: u32,
}

impl StaticRoundRobin {
    pub fn new(rank: u32, world_size: u32, tiles_x: u32, tiles_y: u32) -> Self {
        Self {
            rank,
            world_size,
            tiles_x,
            total_tiles: tiles_x * tiles_y,
            next_index: rank,
        }
    }

    /// Reset the cursor back to this rank's first tile id; called at the
    /// start of every frame.
    pub fn reset(&mut self) {
        self.next_index = self.rank;
    }

    /// Next tile this rank should render, or `None` once its whole set has
    /// been walked. Tiles whose error is already at or below the threshold
    /// are skipped.
    pub fn next_tile(&mut self, fb: &FrameBuffer, error_threshold: f32) -> Option<(u32, u32)> {
        while self.next_index < self.total_tiles {
            let idx = self.next_index;
            self.next_index += self.world_size;
            let tile_x = idx % self.tiles_x;
            let tile_y = idx / self.tiles_x;
            if fb.tile_error(tile_x, tile_y) <= error_threshold {
                continue;
            }
            return Some((tile_x, tile_y));
        }
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use dp_codec::{CompositeMode, FbChannels};

    #[test]
    fn assignment_is_deterministic_and_disjoint_across_ranks() {
        let fb = FrameBuffer::new(128, 128, 32, CompositeMode::WriteOnce, FbChannels::COLOR, 4, 0);
        let mut seen = std::collections::HashSet::new();
        for rank in 0..4u32 {
            let mut rr = StaticRoundRobin::new(rank, 4, 4, 4);
            while let Some(tile) = rr.next_tile(&fb, 0.0) {
                assert!(seen.insert(tile), "tile {tile:?} assigned to more than one rank");
            }
        }
        assert_eq!(seen.len(), 16);
    }

    #[test]
    fn converged_tiles_are_skipped() {
        let fb = FrameBuffer::new(32, 32, 32, CompositeMode::WriteOnce, FbChannels::COLOR, 1, 0);
        fb.start_frame(0.5, 1);
        fb.set_tile(dp_framebuffer::TileSample {
            tile_x: 0,
            tile_y: 0,
            pixels: vec![0.0; 1024],
            depth: None,
            generation: 0,
        })
        .unwrap();
        fb.wait_until_finished();
        let mut rr = StaticRoundRobin::new(0, 1, 1, 1);
        assert_eq!(rr.next_tile(&fb, 0.5), None);
    }
}
