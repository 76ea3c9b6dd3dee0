//! Dynamic work-stealing: a coordinator seeds a preferred queue per worker
//! (affinity to the tile's owner, then descending tile error) and serves
//! "request tile" messages from whichever queue the pop should come from.

use dp_framebuffer::FrameBuffer;
use std::collections::{HashMap, HashSet, VecDeque};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StealResponse {
    Tile(u32, u32),
    Exhausted,
}

/// Runs on whichever rank hosts the frame's coordination duties (by
/// convention, rank 0). Not `Send`-restricted in any way; callers decide who
/// owns it.
pub struct Coordinator {
    preferred: HashMap<u32, VecDeque<(u32, u32)>>,
    exhausted: HashSet<u32>,
    world_size: u32,
    /// Tiles eligible for one extra sample beyond their normal assignment,
    /// because their error from a prior frame is already known and still
    /// above threshold (§4.7's "known reduction" replication condition).
    /// Maps tile id to the number of additional deliveries still allowed.
    replicate_remaining: HashMap<(u32, u32), u32>,
}

impl Coordinator {
    /// Seed every rank's preferred queue with the tiles it owns, each rank's
    /// queue sorted by descending current tile error so the costliest tiles
    /// go out first. `error_threshold` also seeds the replication pool: a
    /// tile with a finite (already-rendered) error still above threshold is
    /// confident enough to reduce variance that a second sample is worth
    /// the redundant work, so it may be handed out once more after its
    /// normal assignment is exhausted.
    pub fn seed(
        fb: &FrameBuffer,
        world_size: u32,
        tiles_x: u32,
        tiles_y: u32,
        error_threshold: f32,
    ) -> Self {
        let mut preferred: HashMap<u32, VecDeque<(u32, u32)>> =
            (0..world_size).map(|r| (r, VecDeque::new())).collect();
        let mut by_rank: HashMap<u32, Vec<(u32, u32)>> = HashMap::new();
        let mut replicate_remaining = HashMap::new();
        for ty in 0..tiles_y {
            for tx in 0..tiles_x {
                let owner = fb.owner_of(tx, ty);
                by_rank.entry(owner).or_default().push((tx, ty));
                let error = fb.tile_error(tx, ty);
                if error.is_finite() && error > error_threshold {
                    replicate_remaining.insert((tx, ty), 1);
                }
            }
        }
        for (rank, mut tiles) in by_rank {
            tiles.sort_by(|a, b| {
                fb.tile_error(b.0, b.1)
                    .partial_cmp(&fb.tile_error(a.0, a.1))
                    .unwrap_or(std::cmp::Ordering::Equal)
            });
            preferred.insert(rank, tiles.into_iter().collect());
        }
        Self {
            preferred,
            exhausted: HashSet::new(),
            world_size,
            replicate_remaining,
        }
    }

    /// Serve one "request tile" message from `worker`: its own preferred
    /// queue first, then whichever rank's queue is currently longest, then
    /// one pass over the replication pool for a tile already delivered
    /// elsewhere but worth a second sample, then `Exhausted`.
    ///
    /// Replicated tiles are handed out to more than one worker by design,
    /// so `dp-framebuffer::FrameBuffer::set_tile` must accept concurrent
    /// deliveries for the same tile id — it does, since per-tile
    /// accumulation state is guarded by the framebuffer's own lock, not a
    /// single-writer assumption.
    pub fn request(&mut self, worker: u32) -> StealResponse {
        if let Some(queue) = self.preferred.get_mut(&worker) {
            if let Some(tile) = queue.pop_front() {
                return StealResponse::Tile(tile.0, tile.1);
            }
        }
        let longest = self
            .preferred
            .iter()
            .filter(|(_, q)| !q.is_empty())
            .max_by_key(|(_, q)| q.len())
            .map(|(rank, _)| *rank);
        if let Some(rank) = longest {
            if let Some(tile) = self.preferred.get_mut(&rank).and_then(|q| q.pop_front()) {
                return StealResponse::Tile(tile.0, tile.1);
            }
        }
        if let Some((&tile, remaining)) = self
            .replicate_remaining
            .iter_mut()
            .find(|(_, remaining)| **remaining > 0)
        {
            *remaining -= 1;
            return StealResponse::Tile(tile.0, tile.1);
        }
        self.exhausted.insert(worker);
        StealResponse::Exhausted
    }

    pub fn all_exhausted(&self) -> bool {
        self.exhausted.len() as u32 == self.world_size
    }
}
