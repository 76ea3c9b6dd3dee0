//! C6: the tiled framebuffer. Deterministic tile ownership, three
//! composition modes, a per-frame completion latch and a progress counter.
//!
//! This crate is fabric-agnostic: [`FrameBuffer::set_tile`] tells the caller
//! whether a tile belongs to this rank or must be forwarded, but never
//! touches a transport itself. `dp-dispatch` owns the point-to-point hop and
//! calls back into `set_tile` once a forwarded tile lands on its owner.

use dp_codec::{CompositeMode, FbChannels};
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};
use std::sync::{Condvar, Mutex, RwLock};
use thiserror::Error;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum FrameBufferError {
    #[error("tile ({0}, {1}) is outside the {2}x{3} tile grid")]
    TileOutOfRange(u32, u32, u32, u32),
}

/// One rank's report for a single tile, as produced by the tile renderer.
#[derive(Debug, Clone)]
pub struct TileSample {
    pub tile_x: u32,
    pub tile_y: u32,
    pub pixels: Vec<f32>,
    pub depth: Option<Vec<f32>>,
    pub generation: u32,
}

/// What the caller must do with a tile passed to [`FrameBuffer::set_tile`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TileOutcome {
    /// The tile was accumulated locally; nothing further to do.
    Accumulated,
    /// This rank does not own the tile; forward `sample` to `owner` over the
    /// point-to-point channel, which should call `set_tile` again there.
    Forward { owner: u32 },
}

/// Deterministic owner assignment for a tile, agreed by every rank without
/// coordination: a multiplicative hash of the tile coordinate reduced mod
/// the worker count.
pub fn tile_owner(tile_x: u32, tile_y: u32, world_size: u32) -> u32 {
    debug_assert!(world_size > 0);
    let key = (tile_x as u64) << 32 | tile_y as u64;
    let hashed = key.wrapping_mul(0x9E3779B97F4A7C15);
    (hashed % world_size as u64) as u32
}

#[derive(Debug, Default)]
struct TileState {
    sum: Vec<f64>,
    sum_sq: Vec<f64>,
    sample_count: u32,
    error: f32,
    pixels: Vec<f32>,
    depth: Vec<f32>,
    pending: Vec<TileSample>,
    received_this_frame: u32,
    complete_this_frame: bool,
    accum_id: u64,
}

impl TileState {
    fn accumulate_statistics(&mut self, pixels: &[f32]) {
        if self.sum.len() != pixels.len() {
            self.sum = vec![0.0; pixels.len()];
            self.sum_sq = vec![0.0; pixels.len()];
        }
        for (i, &p) in pixels.iter().enumerate() {
            self.sum[i] += p as f64;
            self.sum_sq[i] += (p as f64) * (p as f64);
        }
        self.sample_count += 1;
        self.error = self.variance_estimate();
    }

    fn variance_estimate(&self) -> f32 {
        if self.sample_count == 0 || self.sum.is_empty() {
            return f32::INFINITY;
        }
        let n = self.sample_count as f64;
        let mut total = 0.0f64;
        for (sum, sum_sq) in self.sum.iter().zip(self.sum_sq.iter()) {
            let mean = sum / n;
            let var = (sum_sq / n - mean * mean).max(0.0);
            total += var;
        }
        (total / self.sum.len().max(1) as f64) as f32
    }
}

fn add_progress(counter: &AtomicU32, delta: f32) {
    let mut current = counter.load(Ordering::Relaxed);
    loop {
        let next = (f32::from_bits(current) + delta).to_bits();
        match counter.compare_exchange_weak(current, next, Ordering::AcqRel, Ordering::Relaxed) {
            Ok(_) => break,
            Err(observed) => current = observed,
        }
    }
}

/// Per-frame error-state machine (§4.7). `FrameBuffer` itself only tracks
/// `Idle`/`Active`/`Cancelled`; `Armed`/`Draining`/`Done` are the balancer's
/// concern and are exposed here only as the completion latch.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FrameState {
    Idle,
    Active,
    Cancelled,
}

pub struct FrameBuffer {
    width: u32,
    height: u32,
    tile_size: u32,
    mode: CompositeMode,
    channels: FbChannels,
    world_size: u32,
    rank: u32,
    tiles_x: u32,
    tiles_y: u32,
    total_tiles: u64,
    /// How many of the `tiles_x * tiles_y` grid this rank owns. The
    /// completion latch only ever sees deliveries for owned tiles (a
    /// non-owner's `set_tile` returns `Forward` before touching
    /// `accumulate_locally`), so this — not `total_tiles` — is what
    /// `wait_until_finished` must wait for.
    owned_tiles: u64,

    tiles: RwLock<HashMap<(u32, u32), TileState>>,
    accum_id: AtomicU64,
    participants_per_tile: AtomicU32,
    error_threshold_bits: AtomicU32,
    progress_bits: AtomicU32,
    cancelled: AtomicBool,
    state: Mutex<FrameState>,

    completion: Mutex<u64>,
    completion_cv: Condvar,

    master: Mutex<Option<Vec<f32>>>,
    master_errors: Mutex<Option<HashMap<(u32, u32), f32>>>,
}

impl FrameBuffer {
    pub fn new(
        width: u32,
        height: u32,
        tile_size: u32,
        mode: CompositeMode,
        channels: FbChannels,
        world_size: u32,
        rank: u32,
    ) -> Self {
        let tiles_x = width.div_ceil(tile_size);
        let tiles_y = height.div_ceil(tile_size);
        let owned_tiles = (0..tiles_y)
            .flat_map(|ty| (0..tiles_x).map(move |tx| (tx, ty)))
            .filter(|(tx, ty)| tile_owner(*tx, *ty, world_size) == rank)
            .count() as u64;
        Self {
            width,
            height,
            tile_size,
            mode,
            channels,
            world_size,
            rank,
            tiles_x,
            tiles_y,
            total_tiles: (tiles_x as u64) * (tiles_y as u64),
            owned_tiles,
            tiles: RwLock::new(HashMap::new()),
            accum_id: AtomicU64::new(0),
            participants_per_tile: AtomicU32::new(1),
            error_threshold_bits: AtomicU32::new(0.0f32.to_bits()),
            progress_bits: AtomicU32::new(0),
            cancelled: AtomicBool::new(false),
            state: Mutex::new(FrameState::Idle),
            completion: Mutex::new(0),
            completion_cv: Condvar::new(),
            master: Mutex::new(None),
            master_errors: Mutex::new(None),
        }
    }

    pub fn width(&self) -> u32 {
        self.width
    }
    pub fn height(&self) -> u32 {
        self.height
    }
    pub fn mode(&self) -> CompositeMode {
        self.mode
    }
    pub fn channels(&self) -> FbChannels {
        self.channels
    }
    pub fn total_tiles(&self) -> u64 {
        self.total_tiles
    }
    pub fn tiles_x(&self) -> u32 {
        self.tiles_x
    }
    pub fn tiles_y(&self) -> u32 {
        self.tiles_y
    }
    pub fn tile_size(&self) -> u32 {
        self.tile_size
    }

    fn check_bounds(&self, tile_x: u32, tile_y: u32) -> Result<(), FrameBufferError> {
        if tile_x >= self.tiles_x || tile_y >= self.tiles_y {
            Err(FrameBufferError::TileOutOfRange(
                tile_x,
                tile_y,
                self.tiles_x,
                self.tiles_y,
            ))
        } else {
            Ok(())
        }
    }

    pub fn owner_of(&self, tile_x: u32, tile_y: u32) -> u32 {
        tile_owner(tile_x, tile_y, self.world_size)
    }

    /// Clears per-frame counters, increments the global accumulation id,
    /// and arms the completion latch. `participants_per_tile` is the number
    /// of deliveries expected per tile this frame (z-composite/alpha-blend);
    /// write-once ignores it.
    pub fn start_frame(&self, error_threshold: f32, participants_per_tile: u32) -> u64 {
        {
            let mut tiles = self.tiles.write().unwrap();
            for tile in tiles.values_mut() {
                tile.received_this_frame = 0;
                tile.complete_this_frame = false;
                tile.pending.clear();
            }
        }
        let id = self.accum_id.fetch_add(1, Ordering::SeqCst) + 1;
        self.participants_per_tile
            .store(participants_per_tile.max(1), Ordering::SeqCst);
        self.error_threshold_bits
            .store(error_threshold.to_bits(), Ordering::SeqCst);
        self.progress_bits.store(0, Ordering::SeqCst);
        self.cancelled.store(false, Ordering::SeqCst);
        *self.completion.lock().unwrap() = 0;
        *self.state.lock().unwrap() = FrameState::Active;
        id
    }

    pub fn cancel(&self) {
        self.cancelled.store(true, Ordering::SeqCst);
        *self.state.lock().unwrap() = FrameState::Cancelled;
        // Fast-path: drive the completion counter straight to this rank's
        // owned-tile count so `wait_until_finished` unblocks immediately.
        let mut completed = self.completion.lock().unwrap();
        *completed = self.owned_tiles;
        self.completion_cv.notify_all();
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::SeqCst)
    }

    /// Route or accumulate a tile delivery. Returns `Forward` if this rank
    /// does not own the tile.
    pub fn set_tile(&self, sample: TileSample) -> Result<TileOutcome, FrameBufferError> {
        self.check_bounds(sample.tile_x, sample.tile_y)?;
        if self.is_cancelled() {
            return Ok(TileOutcome::Accumulated);
        }
        let owner = self.owner_of(sample.tile_x, sample.tile_y);
        if owner != self.rank {
            return Ok(TileOutcome::Forward { owner });
        }
        self.accumulate_locally(sample);
        Ok(TileOutcome::Accumulated)
    }

    fn accumulate_locally(&self, sample: TileSample) {
        let key = (sample.tile_x, sample.tile_y);
        let current_accum_id = self.accum_id.load(Ordering::SeqCst);
        let participants = self.participants_per_tile.load(Ordering::SeqCst);
        let mut tiles = self.tiles.write().unwrap();
        let tile = tiles.entry(key).or_default();
        tile.accum_id = current_accum_id;

        let just_completed = match self.mode {
            CompositeMode::WriteOnce => {
                tile.pixels = sample.pixels.clone();
                tile.accumulate_statistics(&sample.pixels);
                tile.complete_this_frame = true;
                true
            }
            CompositeMode::ZComposite => {
                if tile.received_this_frame == 0 {
                    tile.pixels = sample.pixels.clone();
                    tile.depth = sample.depth.clone().unwrap_or_default();
                } else if let Some(incoming_depth) = &sample.depth {
                    for i in 0..tile.depth.len().min(incoming_depth.len()) {
                        if incoming_depth[i] < tile.depth[i] {
                            tile.depth[i] = incoming_depth[i];
                            if i < sample.pixels.len() && i < tile.pixels.len() {
                                tile.pixels[i] = sample.pixels[i];
                            }
                        }
                    }
                }
                tile.accumulate_statistics(&sample.pixels);
                tile.received_this_frame += 1;
                if tile.received_this_frame >= participants {
                    tile.complete_this_frame = true;
                    true
                } else {
                    false
                }
            }
            CompositeMode::AlphaBlend => {
                tile.pending.push(sample.clone());
                tile.received_this_frame += 1;
                if tile.received_this_frame >= participants {
                    tile.pending.sort_by_key(|s| s.generation);
                    let mut composited = vec![0.0f32; tile.pending[0].pixels.len()];
                    for layer in &tile.pending {
                        composite_over(&mut composited, &layer.pixels);
                    }
                    tile.pixels = composited.clone();
                    tile.accumulate_statistics(&composited);
                    tile.complete_this_frame = true;
                    true
                } else {
                    false
                }
            }
        };

        if just_completed {
            let tile_pixels = self.tile_pixel_count() as f32;
            let total_pixels = (self.width * self.height).max(1) as f32;
            add_progress(&self.progress_bits, tile_pixels / total_pixels);
            drop(tiles);
            let mut completed = self.completion.lock().unwrap();
            *completed += 1;
            self.completion_cv.notify_all();
        }
    }

    fn tile_pixel_count(&self) -> u32 {
        self.tile_size * self.tile_size
    }

    pub fn tile_error(&self, tile_x: u32, tile_y: u32) -> f32 {
        self.tiles
            .read()
            .unwrap()
            .get(&(tile_x, tile_y))
            .map(|t| t.error)
            .unwrap_or(f32::INFINITY)
    }

    pub fn accum_id(&self, tile_x: u32, tile_y: u32) -> u64 {
        self.tiles
            .read()
            .unwrap()
            .get(&(tile_x, tile_y))
            .map(|t| t.accum_id)
            .unwrap_or(0)
    }

    pub fn progress(&self) -> f32 {
        f32::from_bits(self.progress_bits.load(Ordering::SeqCst))
    }

    /// Blocks until every tile this rank owns has signalled completion for
    /// the current frame. Non-owned tiles never reach `accumulate_locally`
    /// on this rank (`set_tile` routes them to `Forward` instead), so
    /// `owned_tiles`, not the grid-wide `total_tiles`, is the right target —
    /// waiting on `total_tiles` on any rank that doesn't own every tile
    /// would never unblock.
    pub fn wait_until_finished(&self) {
        let mut completed = self.completion.lock().unwrap();
        while *completed < self.owned_tiles {
            completed = self.completion_cv.wait(completed).unwrap();
        }
    }

    /// Closes the frame. Collective: every rank must call this before any
    /// rank proceeds (the caller is expected to pair it with a fabric
    /// barrier). Assembles this rank's contribution to the rank-0 master
    /// buffer from its own owned tiles; cross-rank gather of the rest is
    /// `dp-dispatch`'s job via [`Self::export_owned_tiles`] and
    /// [`Self::ingest_remote_tile`].
    pub fn end_frame(&self, _error_threshold: f32) {
        self.wait_until_finished();
        if self.rank == 0 {
            let mut master = self.master.lock().unwrap();
            let mut buffer = master.take().unwrap_or_else(|| {
                vec![0.0; (self.width as usize) * (self.height as usize)]
            });
            let mut errors = self.master_errors.lock().unwrap();
            let mut err_map = errors.take().unwrap_or_default();
            for ((tx, ty), tile) in self.tiles.read().unwrap().iter() {
                if self.owner_of(*tx, *ty) == 0 {
                    self.blit_tile(&mut buffer, *tx, *ty, &tile.pixels);
                    err_map.insert((*tx, *ty), tile.error);
                }
            }
            *master = Some(buffer);
            *errors = Some(err_map);
        }
        *self.state.lock().unwrap() = FrameState::Idle;
    }

    fn blit_tile(&self, master: &mut [f32], tile_x: u32, tile_y: u32, pixels: &[f32]) {
        let origin_x = tile_x * self.tile_size;
        let origin_y = tile_y * self.tile_size;
        for row in 0..self.tile_size {
            let y = origin_y + row;
            if y >= self.height {
                break;
            }
            for col in 0..self.tile_size {
                let x = origin_x + col;
                if x >= self.width {
                    break;
                }
                let src_idx = (row * self.tile_size + col) as usize;
                if src_idx < pixels.len() {
                    master[(y * self.width + x) as usize] = pixels[src_idx];
                }
            }
        }
    }

    /// Tiles this rank owns, for the host-side reduction gather.
    pub fn export_owned_tiles(&self) -> Vec<(u32, u32, Vec<f32>, f32)> {
        self.tiles
            .read()
            .unwrap()
            .iter()
            .filter(|((tx, ty), _)| self.owner_of(*tx, *ty) == self.rank)
            .map(|((tx, ty), tile)| (*tx, *ty, tile.pixels.clone(), tile.error))
            .collect()
    }

    /// Rank 0 calls this as it gathers remote tiles during the reduction.
    pub fn ingest_remote_tile(&self, tile_x: u32, tile_y: u32, pixels: &[f32], error: f32) {
        let mut master = self.master.lock().unwrap();
        let mut buffer = master.take().unwrap_or_else(|| {
            vec![0.0; (self.width as usize) * (self.height as usize)]
        });
        self.blit_tile(&mut buffer, tile_x, tile_y, pixels);
        *master = Some(buffer);
        let mut errors = self.master_errors.lock().unwrap();
        let mut err_map = errors.take().unwrap_or_default();
        err_map.insert((tile_x, tile_y), error);
        *errors = Some(err_map);
    }

    pub fn master_buffer(&self) -> Option<Vec<f32>> {
        self.master.lock().unwrap().clone()
    }

    /// Average of every known tile's error after a reduction, or `+inf` if
    /// nothing has been gathered yet. The exact variance-reduction estimator
    /// a dynamic balancer should use to decide on tile replication is an
    /// open question the source left unresolved (§9); this aggregate is
    /// only `get_variance`'s answer, not a replication signal.
    pub fn aggregate_variance(&self) -> f32 {
        let errors = self.master_errors.lock().unwrap();
        match errors.as_ref() {
            Some(map) if !map.is_empty() => {
                let finite: Vec<f32> = map.values().copied().filter(|e| e.is_finite()).collect();
                if finite.is_empty() {
                    f32::INFINITY
                } else {
                    finite.iter().sum::<f32>() / finite.len() as f32
                }
            }
            _ => f32::INFINITY,
        }
    }

    pub fn reset_accumulation(&self) {
        let mut tiles = self.tiles.write().unwrap();
        tiles.clear();
        *self.master.lock().unwrap() = None;
        *self.master_errors.lock().unwrap() = None;
    }
}

fn composite_over(dst: &mut [f32], src: &[f32]) {
    for (d, s) in dst.iter_mut().zip(src.iter()) {
        *d = *s + *d * (1.0 - s.clamp(0.0, 1.0));
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn tile_out_of_range_is_an_error() {
        let fb = FrameBuffer::new(64, 64, 32, CompositeMode::WriteOnce, FbChannels::COLOR, 1, 0);
        assert_eq!(
            fb.set_tile(TileSample {
                tile_x: 9,
                tile_y: 0,
                pixels: vec![],
                depth: None,
                generation: 0,
            }),
            Err(FrameBufferError::TileOutOfRange(9, 0, 2, 2))
        );
    }

    #[test]
    fn non_owner_is_asked_to_forward() {
        let fb = FrameBuffer::new(64, 64, 32, CompositeMode::WriteOnce, FbChannels::COLOR, 4, 0);
        // Find a tile this rank (0) does not own among the 2x2 grid.
        let mut forwarded = false;
        for (tx, ty) in [(0, 0), (1, 0), (0, 1), (1, 1)] {
            let outcome = fb
                .set_tile(TileSample {
                    tile_x: tx,
                    tile_y: ty,
                    pixels: vec![1.0; 1024],
                    depth: None,
                    generation: 0,
                })
                .unwrap();
            if matches!(outcome, TileOutcome::Forward { .. }) {
                forwarded = true;
            }
        }
        assert!(forwarded, "with 4 ranks at least one tile should not be owned by rank 0");
    }

    #[test]
    fn write_once_completes_after_a_single_delivery() {
        let fb = FrameBuffer::new(32, 32, 32, CompositeMode::WriteOnce, FbChannels::COLOR, 1, 0);
        fb.start_frame(0.0, 1);
        fb.set_tile(TileSample {
            tile_x: 0,
            tile_y: 0,
            pixels: vec![0.5; 1024],
            depth: None,
            generation: 0,
        })
        .unwrap();
        fb.wait_until_finished();
        assert_eq!(fb.tile_error(0, 0), 0.0);
    }

    #[test]
    fn z_composite_keeps_nearer_depth() {
        let fb = FrameBuffer::new(32, 32, 32, CompositeMode::ZComposite, FbChannels::COLOR, 1, 0);
        fb.start_frame(0.0, 2);
        fb.set_tile(TileSample {
            tile_x: 0,
            tile_y: 0,
            pixels: vec![1.0; 4],
            depth: Some(vec![5.0; 4]),
            generation: 0,
        })
        .unwrap();
        fb.set_tile(TileSample {
            tile_x: 0,
            tile_y: 0,
            pixels: vec![2.0; 4],
            depth: Some(vec![1.0; 4]),
            generation: 0,
        })
        .unwrap();
        fb.wait_until_finished();
        // The nearer (depth 1.0) sample's color should have won.
        let tiles = fb.tiles.read().unwrap();
        let tile = tiles.get(&(0, 0)).unwrap();
        assert_eq!(tile.pixels, vec![2.0; 4]);
    }

    #[test]
    fn alpha_blend_orders_by_generation() {
        let fb = FrameBuffer::new(32, 32, 32, CompositeMode::AlphaBlend, FbChannels::COLOR, 1, 0);
        fb.start_frame(0.0, 2);
        fb.set_tile(TileSample {
            tile_x: 0,
            tile_y: 0,
            pixels: vec![1.0],
            depth: None,
            generation: 1,
        })
        .unwrap();
        fb.set_tile(TileSample {
            tile_x: 0,
            tile_y: 0,
            pixels: vec![0.0],
            depth: None,
            generation: 0,
        })
        .unwrap();
        fb.wait_until_finished();
        assert_eq!(fb.accum_id(0, 0), 1);
    }

    #[test]
    fn cancellation_drives_completion_to_total_immediately() {
        let fb = FrameBuffer::new(64, 64, 32, CompositeMode::WriteOnce, FbChannels::COLOR, 1, 0);
        fb.start_frame(0.0, 1);
        fb.cancel();
        fb.wait_until_finished();
    }

    #[test]
    fn tile_error_is_infinite_before_first_render() {
        let fb = FrameBuffer::new(32, 32, 32, CompositeMode::WriteOnce, FbChannels::COLOR, 1, 0);
        assert_eq!(fb.tile_error(0, 0), f32::INFINITY);
    }

    #[test]
    fn aggregate_variance_is_infinite_before_any_reduction() {
        let fb = FrameBuffer::new(32, 32, 32, CompositeMode::WriteOnce, FbChannels::COLOR, 1, 0);
        assert_eq!(fb.aggregate_variance(), f32::INFINITY);
    }

    #[test]
    fn aggregate_variance_averages_reduced_tile_errors() {
        let fb = FrameBuffer::new(64, 32, 32, CompositeMode::WriteOnce, FbChannels::COLOR, 1, 0);
        fb.start_frame(0.0, 1);
        fb.set_tile(TileSample {
            tile_x: 0,
            tile_y: 0,
            pixels: vec![0.5; 1024],
            depth: None,
            generation: 0,
        })
        .unwrap();
        fb.set_tile(TileSample {
            tile_x: 1,
            tile_y: 0,
            pixels: vec![0.5; 1024],
            depth: None,
            generation: 0,
        })
        .unwrap();
        fb.wait_until_finished();
        fb.end_frame(0.0);
        assert_eq!(fb.aggregate_variance(), 0.0);
    }
}
