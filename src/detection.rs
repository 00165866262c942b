use serde::{Deserialize, Serialize};

/// One recognized object: `[x1, y1, x2, y2]` in pixels from the top-left
/// corner, a class label and a confidence in `[0, 1]`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DetectionRecord {
    pub bbox: [f32; 4],
    #[serde(rename = "class")]
    pub class_label: String,
    pub score: f32,
}

impl DetectionRecord {
    pub fn new(bbox: [f32; 4], class_label: impl Into<String>, score: f32) -> Self {
        Self {
            bbox,
            class_label: class_label.into(),
            score,
        }
    }

    /// Orders the box corners and forces the score into `[0, 1]`.
    pub fn normalized(self) -> Self {
        let [x1, y1, x2, y2] = self.bbox;
        let score = if self.score.is_nan() {
            0.0
        } else {
            self.score.clamp(0.0, 1.0)
        };

        Self {
            bbox: [x1.min(x2), y1.min(y2), x1.max(x2), y1.max(y2)],
            class_label: self.class_label,
            score,
        }
    }
}

/// Detections produced for the frame with sequence number `sequence`.
#[derive(Debug, Clone, PartialEq)]
pub struct DetectionResult {
    pub sequence: u64,
    pub detections: Vec<DetectionRecord>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_record_serializes_with_class_key() {
        let record = DetectionRecord::new([50.0, 50.0, 100.0, 100.0], "person", 0.9);
        let json = serde_json::to_value(&record).unwrap();

        assert_eq!(json["class"], "person");
        assert_eq!(json["bbox"].as_array().unwrap().len(), 4);
        assert!(json.get("class_label").is_none());
    }

    #[test]
    fn test_normalized_orders_corners_and_clamps_score() {
        let record = DetectionRecord::new([100.0, 20.0, 10.0, 5.0], "dog", 1.7).normalized();
        assert_eq!(record.bbox, [10.0, 5.0, 100.0, 20.0]);
        assert_eq!(record.score, 1.0);

        let record = DetectionRecord::new([0.0, 0.0, 1.0, 1.0], "cat", f32::NAN).normalized();
        assert_eq!(record.score, 0.0);

        let record = DetectionRecord::new([0.0, 0.0, 1.0, 1.0], "cat", -0.2).normalized();
        assert_eq!(record.score, 0.0);
    }
}
