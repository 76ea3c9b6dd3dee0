//! C7: the tile load balancer. Two interchangeable strategies over the same
//! tile id space, plus the shared per-frame error state machine.

mod dynamic;
mod state;
mod static_rr;

pub use dynamic::{Coordinator, StealResponse};
pub use state::{ErrorStateMachine, FrameStage};
pub use static_rr::StaticRoundRobin;

/// Number of render jobs a tile gets this frame: more on the first
/// accumulation (full samples-per-pixel), one thereafter once enough
/// samples have accumulated to just refine the existing estimate.
pub fn job_count_for(samples_per_pixel: u32, accum_id: u64) -> u32 {
    if accum_id <= 1 {
        samples_per_pixel.max(1)
    } else {
        1
    }
}
