//! Multi-object tracker: Hungarian-matched data association over
//! per-track Kalman filters, producing stable track identities.

use std::collections::BTreeMap;
use std::collections::VecDeque;

use tracing::trace;

use zelty_tracking::{hungarian, iou, BoxFilter, FilterParams};
use zelty_types::{BoundingBox, Detection, TrackingParams};

const HISTORY_CAPACITY: usize = 30;
/// Confidence multiplier applied to predicted (unmatched) track output.
const PREDICTED_CONFIDENCE_SCALE: f32 = 0.9;

/// One tracked object.
#[derive(Debug)]
pub struct Track {
    pub id: u32,
    pub class_id: u8,
    pub confidence: f32,
    pub created_ms: u64,
    pub last_update_ms: u64,
    pub hit_count: u32,
    pub miss_count: u32,
    pub history: VecDeque<BoundingBox>,
    filter: BoxFilter,
}

impl Track {
    fn new(id: u32, detection: &Detection, filter_params: &FilterParams) -> Self {
        let mut history = VecDeque::with_capacity(HISTORY_CAPACITY);
        history.push_back(detection.bbox);
        Self {
            id,
            class_id: detection.class_id,
            confidence: detection.confidence,
            created_ms: detection.timestamp,
            last_update_ms: detection.timestamp,
            hit_count: 1,
            miss_count: 0,
            history,
            filter: BoxFilter::new(&detection.bbox, filter_params),
        }
    }

    fn dt_to(&self, timestamp_ms: u64) -> f64 {
        timestamp_ms.saturating_sub(self.last_update_ms) as f64 / 1000.0
    }

    /// Predicted box at `timestamp_ms` without committing the filter.
    pub fn predict(&self, timestamp_ms: u64) -> BoundingBox {
        self.filter.predict_at(self.dt_to(timestamp_ms))
    }

    fn apply_measurement(&mut self, detection: &Detection) {
        let dt = self.dt_to(detection.timestamp);
        if let Err(err) = self.filter.update(dt, &detection.bbox) {
            trace!("track {}: {err}", self.id);
        }
        self.last_update_ms = detection.timestamp;
        self.hit_count += 1;
        self.miss_count = 0;
        self.class_id = detection.class_id;
        self.confidence = 0.7 * self.confidence + 0.3 * detection.confidence;
        if self.history.len() == HISTORY_CAPACITY {
            self.history.pop_front();
        }
        self.history.push_back(detection.bbox);
    }

    fn is_expired(&self, now_ms: u64, max_age_ms: u64) -> bool {
        now_ms.saturating_sub(self.created_ms) > max_age_ms
            || now_ms.saturating_sub(self.last_update_ms) > max_age_ms / 2
    }
}

/// Copyable view of a track for status reporting.
#[derive(Debug, Clone)]
pub struct TrackSnapshot {
    pub id: u32,
    pub class_id: u8,
    pub confidence: f32,
    pub hit_count: u32,
    pub miss_count: u32,
    pub age_ms: u64,
}

pub struct MultiObjectTracker {
    params: TrackingParams,
    filter_params: FilterParams,
    tracks: BTreeMap<u32, Track>,
    next_track_id: u32,
}

impl MultiObjectTracker {
    pub fn new(params: TrackingParams) -> Self {
        let filter_params = FilterParams {
            process_noise_pos: params.process_noise_pos,
            process_noise_vel: params.process_noise_vel,
            measurement_noise: params.measurement_noise,
        };
        Self {
            params,
            filter_params,
            tracks: BTreeMap::new(),
            next_track_id: 1,
        }
    }

    /// Associate one frame of detections with the live tracks and return
    /// the detections emitted to consumers: confirmed tracks, matched or
    /// predicted, carrying their stable ids.
    pub fn update(&mut self, detections: &[Detection], now_ms: u64) -> Vec<Detection> {
        // Predict every live track to now, keeping track order stable.
        let track_ids: Vec<u32> = self.tracks.keys().copied().collect();
        let predicted: Vec<BoundingBox> = track_ids
            .iter()
            .map(|id| self.tracks[id].predict(now_ms))
            .collect();

        // Cost matrix: 1 - IoU(detection, predicted track box).
        let matches = if detections.is_empty() || track_ids.is_empty() {
            Vec::new()
        } else {
            let cost: Vec<Vec<f64>> = detections
                .iter()
                .map(|det| {
                    predicted
                        .iter()
                        .map(|p| 1.0 - iou(&det.bbox, p) as f64)
                        .collect()
                })
                .collect();
            hungarian(&cost)
                .into_iter()
                .filter(|&(di, ti)| {
                    iou(&detections[di].bbox, &predicted[ti]) >= self.params.iou_threshold
                })
                .collect()
        };

        let mut matched_detection = vec![false; detections.len()];
        let mut matched_track: BTreeMap<u32, usize> = BTreeMap::new();
        for &(di, ti) in &matches {
            matched_detection[di] = true;
            matched_track.insert(track_ids[ti], di);
        }

        // Matched tracks are corrected with their measurement.
        for (&track_id, &di) in &matched_track {
            if let Some(track) = self.tracks.get_mut(&track_id) {
                track.apply_measurement(&detections[di]);
            }
        }

        // Unmatched detections give birth to new tracks.
        let mut born = std::collections::BTreeSet::new();
        for (di, det) in detections.iter().enumerate() {
            if !matched_detection[di] {
                let id = self.next_track_id;
                self.next_track_id = self.next_track_id.wrapping_add(1).max(1);
                trace!("birth of track {id} at frame time {now_ms}");
                self.tracks
                    .insert(id, Track::new(id, det, &self.filter_params));
                born.insert(id);
            }
        }

        // Pre-existing unmatched tracks accrue a miss.
        for (id, track) in self.tracks.iter_mut() {
            if !matched_track.contains_key(id) && !born.contains(id) {
                track.miss_count += 1;
            }
        }

        // Deaths.
        let max_age = self.params.max_age_ms;
        self.tracks.retain(|id, track| {
            let keep = !track.is_expired(now_ms, max_age);
            if !keep {
                trace!("death of track {id}");
            }
            keep
        });

        // Emit confirmed tracks: measured boxes for matches, predicted
        // boxes (with scaled confidence) for the rest.
        let mut output = Vec::new();
        for (id, track) in &self.tracks {
            if track.hit_count < self.params.min_hits {
                continue;
            }
            match matched_track.get(id) {
                Some(&di) => {
                    let mut det = detections[di];
                    det.track_id = *id;
                    output.push(det);
                }
                None => {
                    output.push(Detection {
                        bbox: track.predict(now_ms),
                        confidence: track.confidence * PREDICTED_CONFIDENCE_SCALE,
                        class_id: track.class_id,
                        track_id: *id,
                        timestamp: now_ms,
                    });
                }
            }
        }
        output
    }

    pub fn track_count(&self) -> usize {
        self.tracks.len()
    }

    pub fn snapshot(&self, now_ms: u64) -> Vec<TrackSnapshot> {
        self.tracks
            .values()
            .map(|t| TrackSnapshot {
                id: t.id,
                class_id: t.class_id,
                confidence: t.confidence,
                hit_count: t.hit_count,
                miss_count: t.miss_count,
                age_ms: now_ms.saturating_sub(t.created_ms),
            })
            .collect()
    }

    pub fn clear(&mut self) {
        self.tracks.clear();
    }
}
