//! Local prediction engine: per-track Kalman filters fed by server
//! detections, extrapolated to "now" between server updates.

use std::collections::BTreeMap;

use tracing::trace;

use zelty_tracking::{BoxFilter, FilterParams};
use zelty_types::{Detection, PredictionParams};

struct LocalTrack {
    filter: BoxFilter,
    class_id: u8,
    confidence: f32,
    last_update_ms: u64,
}

/// Per-track filters keyed by the server's stable track id. Detections
/// without a track id are ignored; association is the server's job.
pub struct PredictionEngine {
    params: PredictionParams,
    filter_params: FilterParams,
    /// Per-frame (16.67 ms) confidence decay applied while extrapolating.
    confidence_decay: f32,
    max_track_age_ms: u64,
    tracks: BTreeMap<u32, LocalTrack>,
}

impl PredictionEngine {
    pub fn new(params: PredictionParams, confidence_decay: f32, max_track_age_ms: u64) -> Self {
        let filter_params = FilterParams {
            process_noise_pos: params.position_uncertainty as f64,
            // Acceleration uncertainty inflates the velocity block of the
            // constant-velocity model.
            process_noise_vel: (params.velocity_uncertainty + params.acceleration_uncertainty)
                as f64,
            measurement_noise: 1e-1,
        };
        Self {
            params,
            filter_params,
            confidence_decay,
            max_track_age_ms,
            tracks: BTreeMap::new(),
        }
    }

    /// Feed one server detection. Creates the track on first sight.
    pub fn add_detection(&mut self, detection: &Detection) {
        if detection.track_id == 0 {
            return;
        }
        match self.tracks.get_mut(&detection.track_id) {
            Some(track) => {
                let dt_s =
                    detection.timestamp.saturating_sub(track.last_update_ms) as f64 / 1000.0;
                if let Err(err) = track.filter.update(dt_s, &detection.bbox) {
                    trace!("local track {}: {err}", detection.track_id);
                }
                track.class_id = detection.class_id;
                track.confidence = detection.confidence;
                track.last_update_ms = detection.timestamp;
            }
            None => {
                self.tracks.insert(
                    detection.track_id,
                    LocalTrack {
                        filter: BoxFilter::new(&detection.bbox, &self.filter_params),
                        class_id: detection.class_id,
                        confidence: detection.confidence,
                        last_update_ms: detection.timestamp,
                    },
                );
            }
        }
    }

    /// Extrapolate every track to `target_ms`. The extrapolation span is
    /// clamped to the prediction horizon; confidence decays with the span
    /// and tracks that fall below the configured confidence floor are
    /// withheld.
    pub fn predict_state(&self, target_ms: u64) -> Vec<Detection> {
        let horizon_ms = self.params.max_prediction_time as u64;
        self.tracks
            .iter()
            .filter_map(|(&track_id, track)| {
                let span_ms = target_ms
                    .saturating_sub(track.last_update_ms)
                    .min(horizon_ms);
                let bbox = track.filter.predict_at(span_ms as f64 / 1000.0);
                let decay = self.confidence_decay * (span_ms as f32 / 16.67);
                let confidence = (track.confidence - decay).max(0.0);
                if confidence < self.params.min_confidence_threshold {
                    return None;
                }
                Some(Detection {
                    bbox,
                    confidence,
                    class_id: track.class_id,
                    track_id,
                    timestamp: target_ms,
                })
            })
            .collect()
    }

    /// Predicted centre points of one track over the next `steps`
    /// intervals of `interval_ms`, for overlay motion trails.
    pub fn predict_trajectory(
        &self,
        track_id: u32,
        steps: usize,
        interval_ms: u64,
    ) -> Option<Vec<(f32, f32)>> {
        self.tracks
            .get(&track_id)
            .map(|track| track.filter.predict_trajectory(steps, interval_ms as f64 / 1000.0))
    }

    /// Drop tracks that have not seen a server update for longer than the
    /// track age limit.
    pub fn prune(&mut self, now_ms: u64) {
        let max_age = self.max_track_age_ms;
        self.tracks
            .retain(|_, track| now_ms.saturating_sub(track.last_update_ms) <= max_age);
    }

    pub fn track_count(&self) -> usize {
        self.tracks.len()
    }

    pub fn clear(&mut self) {
        self.tracks.clear();
    }
}
