//! Dual-engine fusion: reconcile the last authoritative (but stale)
//! server state with the local predictions via similarity-weighted
//! interpolation.

use zelty_types::{Detection, FusionParams, GameState};

/// Similarity of a server/local pair. Zero across classes.
fn similarity(server: &Detection, local: &Detection) -> f32 {
    if server.class_id != local.class_id {
        return 0.0;
    }

    let dx = server.bbox.x - local.bbox.x;
    let dy = server.bbox.y - local.bbox.y;
    let center_dist = (dx * dx + dy * dy).sqrt();

    let dw = (server.bbox.width - local.bbox.width).abs()
        / server.bbox.width.max(local.bbox.width);
    let dh = (server.bbox.height - local.bbox.height).abs()
        / server.bbox.height.max(local.bbox.height);
    let size_diff = (dw + dh) / 2.0;

    let center_weight = (-10.0 * center_dist).exp();
    let size_weight = (-5.0 * size_diff).exp();
    let conf_weight = server.confidence * local.confidence;

    0.6 * center_weight + 0.3 * size_weight + 0.1 * conf_weight
}

/// Greedy matching in descending similarity above the threshold.
fn best_matches(
    server: &[Detection],
    local: &[Detection],
    threshold: f32,
) -> Vec<(usize, usize)> {
    let mut scored: Vec<(f32, usize, usize)> = Vec::new();
    for (si, s) in server.iter().enumerate() {
        for (li, l) in local.iter().enumerate() {
            let sim = similarity(s, l);
            if sim > threshold {
                scored.push((sim, si, li));
            }
        }
    }
    scored.sort_by(|a, b| b.0.partial_cmp(&a.0).unwrap_or(std::cmp::Ordering::Equal));

    let mut used_server = vec![false; server.len()];
    let mut used_local = vec![false; local.len()];
    let mut matches = Vec::new();
    for (_, si, li) in scored {
        if !used_server[si] && !used_local[li] {
            used_server[si] = true;
            used_local[li] = true;
            matches.push((si, li));
        }
    }
    matches
}

/// Interpolate a matched pair. `weight` pulls the local prediction toward
/// the server box; the fused detection keeps the local track identity.
fn blend(local: &Detection, server: &Detection, weight: f32, timestamp: u64) -> Detection {
    let w = weight.clamp(0.0, 1.0);
    let mut fused = *local;
    fused.bbox.x = local.bbox.x * (1.0 - w) + server.bbox.x * w;
    fused.bbox.y = local.bbox.y * (1.0 - w) + server.bbox.y * w;
    fused.bbox.width = local.bbox.width * (1.0 - w) + server.bbox.width * w;
    fused.bbox.height = local.bbox.height * (1.0 - w) + server.bbox.height * w;
    fused.confidence = local.confidence.max(server.confidence);
    fused.timestamp = timestamp;
    fused
}

/// Fuse the latest server state with the current local predictions.
///
/// Stale or empty server state yields the local predictions unchanged;
/// an empty local set yields the server state. Otherwise matched pairs
/// are interpolated with a weight that fades as the server state ages
/// past 100 ms, and unmatched detections on either side survive when
/// their confidence clears the floor.
pub fn fuse(
    server_state: &GameState,
    local_predictions: &[Detection],
    now_ms: u64,
    params: &FusionParams,
) -> GameState {
    let mut fused = GameState {
        frame_id: server_state.frame_id.wrapping_add(1),
        timestamp: now_ms,
        detections: Vec::new(),
    };

    let server_age_ms = now_ms.saturating_sub(server_state.timestamp);

    if server_state.detections.is_empty() || server_age_ms > params.max_server_state_age_ms {
        fused.detections = local_predictions.to_vec();
        return fused;
    }
    if local_predictions.is_empty() {
        fused.detections = server_state.detections.clone();
        return fused;
    }

    let matches = best_matches(
        &server_state.detections,
        local_predictions,
        params.similarity_threshold,
    );
    let mut used_server = vec![false; server_state.detections.len()];
    let mut used_local = vec![false; local_predictions.len()];

    let age_factor = (server_age_ms as f32 / 100.0).clamp(0.0, 1.0);
    let weight = params.server_correction_weight * (1.0 - age_factor);

    for (si, li) in matches {
        used_server[si] = true;
        used_local[li] = true;
        fused.detections.push(blend(
            &local_predictions[li],
            &server_state.detections[si],
            weight,
            now_ms,
        ));
    }

    for (si, det) in server_state.detections.iter().enumerate() {
        if !used_server[si] && det.confidence >= params.min_server_confidence {
            fused.detections.push(*det);
        }
    }
    for (li, det) in local_predictions.iter().enumerate() {
        if !used_local[li] && det.confidence >= params.min_server_confidence {
            fused.detections.push(*det);
        }
    }

    fused
}

#[cfg(test)]
mod tests {
    use super::*;
    use zelty_types::BoundingBox;

    fn det(x: f32, y: f32, conf: f32, class_id: u8, track_id: u32) -> Detection {
        Detection {
            bbox: BoundingBox::new(x, y, 0.1, 0.2),
            confidence: conf,
            class_id,
            track_id,
            timestamp: 0,
        }
    }

    fn server_state(timestamp: u64, detections: Vec<Detection>) -> GameState {
        GameState {
            frame_id: 10,
            timestamp,
            detections,
        }
    }

    /// Identical boxes fuse to themselves exactly.
    #[test]
    fn identical_states_fuse_to_identity() {
        let params = FusionParams::default();
        let now = 1000;
        let server = server_state(now, vec![det(0.5, 0.5, 0.9, 1, 42)]);
        let local = vec![det(0.5, 0.5, 0.9, 1, 42)];
        let fused = fuse(&server, &local, now, &params);
        assert_eq!(fused.frame_id, 11);
        assert_eq!(fused.detections.len(), 1);
        assert_eq!(fused.detections[0].bbox, local[0].bbox);
    }

    /// With offset delta, the fused box is L + w*(S-L) with
    /// w = server_correction_weight * (1 - age/100).
    #[test]
    fn fused_box_interpolates_with_age_weight() {
        let params = FusionParams::default();
        let now = 1000u64;
        let age = 50u64;
        let server = server_state(now - age, vec![det(0.6, 0.5, 0.9, 1, 1)]);
        let local = vec![det(0.5, 0.5, 0.9, 1, 9)];
        let fused = fuse(&server, &local, now, &params);

        let w = 0.3 * (1.0 - age as f32 / 100.0); // 0.15
        let expected_x = 0.5 + w * (0.6 - 0.5);
        assert_eq!(fused.detections.len(), 1);
        assert!((fused.detections[0].bbox.x - expected_x).abs() < 1e-6);
        // local identity is carried
        assert_eq!(fused.detections[0].track_id, 9);
    }

    /// At age 0, matched output uses the full server correction weight;
    /// past 100 ms the weight is zero and the local prediction wins.
    #[test]
    fn correction_weight_fades_within_100_ms() {
        let params = FusionParams::default();
        let server = server_state(1000, vec![det(0.6, 0.5, 0.9, 1, 1)]);
        let local = vec![det(0.5, 0.5, 0.9, 1, 9)];

        let fresh = fuse(&server, &local, 1000, &params);
        assert!((fresh.detections[0].bbox.x - (0.5 + 0.3 * 0.1)).abs() < 1e-6);

        let faded = fuse(&server, &local, 1000 + 150, &params);
        assert!((faded.detections[0].bbox.x - 0.5).abs() < 1e-6);
    }

    /// Scenario: server state older than 500 ms is ignored entirely.
    #[test]
    fn stale_server_state_yields_local_predictions() {
        let params = FusionParams::default();
        let server = server_state(1000, vec![det(0.9, 0.9, 0.99, 1, 1)]);
        let local = vec![det(0.2, 0.2, 0.5, 1, 9)];
        let fused = fuse(&server, &local, 1000 + 600, &params);
        assert_eq!(fused.detections, local);
    }

    /// Fresh server state with no local predictions passes through.
    #[test]
    fn empty_local_set_yields_server_state() {
        let params = FusionParams::default();
        let server = server_state(1000, vec![det(0.4, 0.4, 0.8, 1, 1)]);
        let fused = fuse(&server, &[], 1000, &params);
        assert_eq!(fused.detections, server.detections);
        assert_eq!(fused.frame_id, server.frame_id + 1);
    }

    /// Unmatched detections survive only above the confidence floor.
    #[test]
    fn unmatched_detections_are_gated_by_confidence() {
        let params = FusionParams::default();
        let now = 1000;
        let server = server_state(
            now,
            vec![
                det(0.1, 0.1, 0.9, 1, 1),  // unmatched, confident
                det(0.9, 0.9, 0.2, 2, 2),  // unmatched, weak
            ],
        );
        let local = vec![
            det(0.5, 0.5, 0.5, 3, 9),  // unmatched, above floor
            det(0.7, 0.7, 0.1, 4, 10), // unmatched, weak
        ];
        let fused = fuse(&server, &local, now, &params);
        let kept: Vec<u32> = fused.detections.iter().map(|d| d.track_id).collect();
        assert_eq!(kept, vec![1, 9]);
    }

    /// Different classes never match even when boxes coincide.
    #[test]
    fn matching_is_class_aware() {
        let params = FusionParams::default();
        let now = 1000;
        let server = server_state(now, vec![det(0.5, 0.5, 0.9, 1, 1)]);
        let local = vec![det(0.5, 0.5, 0.9, 2, 9)];
        let fused = fuse(&server, &local, now, &params);
        // both survive unmatched (both confident)
        assert_eq!(fused.detections.len(), 2);
    }
}
