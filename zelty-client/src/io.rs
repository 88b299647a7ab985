//! Collaborator boundaries: the capture source that pushes frames into
//! the transport and the sink that consumes fused state. Real capture and
//! overlay components live outside this crate; the implementations here
//! keep the pipeline exercisable end to end without them.

use tracing::debug;

use zelty_types::{now_ms, FrameData, GameState};

/// Produces capture frames. The real implementation wraps the platform
/// screen-capture component.
pub trait FrameSource: Send {
    fn next_frame(&mut self) -> Option<FrameData>;
}

/// Consumes fused world state (overlay, input logic, recording, ...).
pub trait StateSink: Send {
    fn consume(&mut self, state: &GameState);
}

/// Synthetic gray frames at a fixed size, keyframed on the configured
/// interval. Stands in for the capture component during development and
/// in tests.
pub struct SyntheticFrameSource {
    width: u16,
    height: u16,
    keyframe_interval: u32,
    next_frame_id: u32,
}

impl SyntheticFrameSource {
    pub fn new(width: u16, height: u16, keyframe_interval: u8) -> Self {
        Self {
            width,
            height,
            keyframe_interval: keyframe_interval.max(1) as u32,
            next_frame_id: 1,
        }
    }
}

impl FrameSource for SyntheticFrameSource {
    fn next_frame(&mut self) -> Option<FrameData> {
        let frame_id = self.next_frame_id;
        self.next_frame_id = self.next_frame_id.wrapping_add(1).max(1);
        Some(FrameData {
            frame_id,
            timestamp: now_ms(),
            width: self.width,
            height: self.height,
            keyframe: frame_id % self.keyframe_interval == 1,
            data: vec![0x80; self.width as usize * self.height as usize * 3],
        })
    }
}

/// Logs a one-line summary of each consumed state.
#[derive(Default)]
pub struct LoggingSink {
    consumed: u64,
}

impl StateSink for LoggingSink {
    fn consume(&mut self, state: &GameState) {
        self.consumed += 1;
        debug!(
            "state {}: {} detections ({} consumed so far)",
            state.frame_id,
            state.detections.len(),
            self.consumed
        );
    }
}
