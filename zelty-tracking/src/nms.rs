use zelty_types::{BoundingBox, Detection};

/// Intersection over union of two centre-format boxes.
pub fn iou(a: &BoundingBox, b: &BoundingBox) -> f32 {
    let a_min_x = a.x - a.width / 2.0;
    let a_max_x = a.x + a.width / 2.0;
    let a_min_y = a.y - a.height / 2.0;
    let a_max_y = a.y + a.height / 2.0;

    let b_min_x = b.x - b.width / 2.0;
    let b_max_x = b.x + b.width / 2.0;
    let b_min_y = b.y - b.height / 2.0;
    let b_max_y = b.y + b.height / 2.0;

    let ix = (a_max_x.min(b_max_x) - a_min_x.max(b_min_x)).max(0.0);
    let iy = (a_max_y.min(b_max_y) - a_min_y.max(b_min_y)).max(0.0);
    let intersection = ix * iy;

    let union = a.width * a.height + b.width * b.height - intersection;
    if union > 0.0 {
        intersection / union
    } else {
        0.0
    }
}

/// Per-class non-maximum suppression.
///
/// Sorts by class ascending then confidence descending and drops any later
/// same-class detection overlapping a survivor above `iou_threshold`.
pub fn non_max_suppression(mut detections: Vec<Detection>, iou_threshold: f32) -> Vec<Detection> {
    if detections.len() <= 1 {
        return detections;
    }

    detections.sort_by(|a, b| {
        a.class_id.cmp(&b.class_id).then(
            b.confidence
                .partial_cmp(&a.confidence)
                .unwrap_or(std::cmp::Ordering::Equal),
        )
    });

    let mut removed = vec![false; detections.len()];
    let mut result = Vec::with_capacity(detections.len());

    for i in 0..detections.len() {
        if removed[i] {
            continue;
        }
        result.push(detections[i]);
        for j in (i + 1)..detections.len() {
            if removed[j] || detections[j].class_id != detections[i].class_id {
                continue;
            }
            if iou(&detections[i].bbox, &detections[j].bbox) > iou_threshold {
                removed[j] = true;
            }
        }
    }

    result
}

#[cfg(test)]
mod tests {
    use super::*;

    fn det(x: f32, y: f32, w: f32, h: f32, conf: f32, class_id: u8) -> Detection {
        Detection {
            bbox: BoundingBox::new(x, y, w, h),
            confidence: conf,
            class_id,
            track_id: 0,
            timestamp: 0,
        }
    }

    #[test]
    fn identical_boxes_have_unit_iou() {
        let a = BoundingBox::new(0.5, 0.5, 0.2, 0.2);
        assert!((iou(&a, &a) - 1.0).abs() < 1e-6);
    }

    #[test]
    fn disjoint_boxes_have_zero_iou() {
        let a = BoundingBox::new(0.2, 0.2, 0.1, 0.1);
        let b = BoundingBox::new(0.8, 0.8, 0.1, 0.1);
        assert_eq!(iou(&a, &b), 0.0);
    }

    #[test]
    fn suppresses_lower_confidence_duplicate() {
        let kept = det(0.5, 0.5, 0.2, 0.2, 0.9, 1);
        let dup = det(0.51, 0.5, 0.2, 0.2, 0.6, 1);
        let out = non_max_suppression(vec![dup, kept], 0.45);
        assert_eq!(out.len(), 1);
        assert_eq!(out[0].confidence, 0.9);
    }

    #[test]
    fn different_classes_are_never_suppressed() {
        let a = det(0.5, 0.5, 0.2, 0.2, 0.9, 1);
        let b = det(0.5, 0.5, 0.2, 0.2, 0.6, 2);
        let out = non_max_suppression(vec![a, b], 0.45);
        assert_eq!(out.len(), 2);
    }

    #[test]
    fn nms_is_idempotent() {
        let dets = vec![
            det(0.5, 0.5, 0.2, 0.2, 0.9, 1),
            det(0.52, 0.5, 0.2, 0.2, 0.7, 1),
            det(0.1, 0.1, 0.1, 0.1, 0.8, 1),
            det(0.5, 0.5, 0.2, 0.2, 0.95, 2),
        ];
        let once = non_max_suppression(dets, 0.45);
        let twice = non_max_suppression(once.clone(), 0.45);
        assert_eq!(once, twice);
    }

    #[test]
    fn output_never_longer_than_input() {
        let dets: Vec<Detection> = (0..10)
            .map(|i| det(0.5, 0.5, 0.2, 0.2, 0.5 + 0.04 * i as f32, 1))
            .collect();
        let out = non_max_suppression(dets.clone(), 0.45);
        assert!(out.len() <= dets.len());
        assert_eq!(out.len(), 1);
    }
}
