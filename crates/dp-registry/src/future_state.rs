//! Atomics-backed state for `Future` objects: progress, completion event and
//! cancellation, all readable without taking the registry's write lock.

use dp_codec::FrameEvent;
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, AtomicU8, Ordering};

/// Tracks one in-flight (or finished) asynchronous operation.
///
/// `ready_event` only ever moves forward through the `FrameEvent` total
/// order (`NoneFinished < WorldRendered < FrameFinished`); `mark_ready`
/// clamps to the maximum already observed so a stale worker report can never
/// regress a future that another worker already advanced further.
#[derive(Debug)]
pub struct FutureState {
    ready_event: AtomicU8,
    cancel_requested: AtomicBool,
    progress_bits: AtomicU32,
    duration_nanos: AtomicU64,
}

impl FutureState {
    pub fn new() -> Self {
        Self {
            ready_event: AtomicU8::new(FrameEvent::NoneFinished as u8),
            cancel_requested: AtomicBool::new(false),
            progress_bits: AtomicU32::new(0),
            duration_nanos: AtomicU64::new(0),
        }
    }

    pub fn is_ready(&self, event: FrameEvent) -> bool {
        self.ready_event.load(Ordering::Acquire) >= event as u8
    }

    /// Advance the completion marker to at least `event`.
    pub fn mark_ready(&self, event: FrameEvent) {
        self.ready_event.fetch_max(event as u8, Ordering::AcqRel);
    }

    pub fn request_cancel(&self) {
        self.cancel_requested.store(true, Ordering::Release);
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancel_requested.load(Ordering::Acquire)
    }

    pub fn set_progress(&self, fraction: f32) {
        self.progress_bits
            .store(fraction.to_bits(), Ordering::Release);
    }

    pub fn progress(&self) -> f32 {
        f32::from_bits(self.progress_bits.load(Ordering::Acquire))
    }

    pub fn set_duration(&self, nanos: u64) {
        self.duration_nanos.store(nanos, Ordering::Release);
    }

    pub fn duration(&self) -> u64 {
        self.duration_nanos.load(Ordering::Acquire)
    }
}

impl Default for FutureState {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn starts_unready_and_uncancelled() {
        let fut = FutureState::new();
        assert!(!fut.is_ready(FrameEvent::WorldRendered));
        assert!(fut.is_ready(FrameEvent::NoneFinished));
        assert!(!fut.is_cancelled());
    }

    #[test]
    fn ready_event_is_monotone() {
        let fut = FutureState::new();
        fut.mark_ready(FrameEvent::FrameFinished);
        fut.mark_ready(FrameEvent::WorldRendered);
        assert!(fut.is_ready(FrameEvent::FrameFinished));
    }

    #[test]
    fn progress_and_duration_round_trip() {
        let fut = FutureState::new();
        fut.set_progress(0.42);
        fut.set_duration(1_500_000);
        assert_eq!(fut.progress(), 0.42);
        assert_eq!(fut.duration(), 1_500_000);
    }

    #[test]
    fn cancel_is_sticky() {
        let fut = FutureState::new();
        fut.request_cancel();
        assert!(fut.is_cancelled());
    }
}
