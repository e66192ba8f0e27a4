use crate::inference::bones;
use crate::inference::model::{Detection, Image, JointCrop, Model, ModelError};
use crate::inference::report::{BoneDetail, HandDetail, Rect};
use atlas::logging::{self, Logger};
use hashbrown::HashMap;
use std::sync::{Arc, Mutex};

/// How one detector class maps onto the canonical joints: which of the
/// x-sorted boxes are kept and which classifier category each one gets.
struct ExtractRule {
    class_id: i32,
    /// Sort boxes by descending x before picking (little finger to thumb).
    sort_by_x: bool,
    /// `(box index, joint id, category id)` picks applied when the box count
    /// matches the expected count.
    picks: &'static [(usize, usize, i32)],
    /// Label prefix and category used when the count does not match and all
    /// boxes are reported as-is.
    fallback_label: &'static str,
    fallback_category: i32,
}

const EXTRACT_RULES: [ExtractRule; 7] = [
    ExtractRule { class_id: 0, sort_by_x: false, picks: &[(0, 0, 0)], fallback_label: "radius", fallback_category: 0 },
    ExtractRule { class_id: 1, sort_by_x: false, picks: &[(0, 1, 1)], fallback_label: "ulna", fallback_category: 1 },
    ExtractRule { class_id: 2, sort_by_x: false, picks: &[(0, 2, 2)], fallback_label: "mcpfirst", fallback_category: 2 },
    ExtractRule { class_id: 3, sort_by_x: true, picks: &[(1, 3, 3), (3, 4, 3)], fallback_label: "MCP", fallback_category: 3 },
    ExtractRule { class_id: 4, sort_by_x: true, picks: &[(0, 5, 4), (2, 6, 5), (4, 7, 5)], fallback_label: "PIP", fallback_category: 5 },
    ExtractRule { class_id: 5, sort_by_x: true, picks: &[(1, 8, 6), (3, 9, 6)], fallback_label: "MIP", fallback_category: 6 },
    ExtractRule { class_id: 6, sort_by_x: true, picks: &[(0, 10, 7), (2, 11, 8), (4, 12, 8)], fallback_label: "DIP", fallback_category: 8 },
];

/// Reduces one image's detections to the canonical joint set. A class whose
/// box count does not match the expected layout keeps all its boxes under
/// numbered names and marks the hand invalid, so the client can see what was
/// actually found.
pub fn extract_hand_detail(detections: &[Detection], log: &Logger) -> HandDetail {
    let mut boxes_by_class: HashMap<i32, Vec<Rect>> = HashMap::new();
    for detection in detections {
        boxes_by_class
            .entry(detection.class_id)
            .or_insert_with(Vec::new)
            .push(detection.rect);
    }

    let mut hand = HandDetail {
        is_valid: true,
        bones_detail: Vec::with_capacity(bones::KEY_JOINTS.len()),
    };

    for rule in &EXTRACT_RULES {
        let boxes = match boxes_by_class.get_mut(&rule.class_id) {
            Some(boxes) => boxes,
            None => continue,
        };
        if rule.sort_by_x {
            boxes.sort_by(|a, b| b.x.cmp(&a.x));
        }

        let expected = bones::detect_class(rule.class_id)
            .map(|class| class.expected_count)
            .unwrap_or(0);

        if boxes.len() == expected {
            for &(index, joint_id, category_id) in rule.picks {
                hand.bones_detail.push(BoneDetail {
                    joint: bones::joint_name(joint_id).to_string(),
                    rect: boxes[index],
                    category_id,
                    maturity_stage: -1,
                });
            }
        } else {
            logging::error!(log, "detection count mismatch";
                            "context" => "extract",
                            "class" => rule.fallback_label,
                            "expected" => expected,
                            "got" => boxes.len());
            for (index, rect) in boxes.iter().enumerate() {
                hand.bones_detail.push(BoneDetail {
                    joint: format!("{}{}", rule.fallback_label, index),
                    rect: *rect,
                    category_id: rule.fallback_category,
                    maturity_stage: -1,
                });
            }
            hand.is_valid = false;
        }
    }

    hand
}

/// Drives detect then classify over one batch of decoded images and fills in
/// the maturity stages. Model calls are serialized behind a lock; the
/// runtimes this fronts are not assumed thread-safe.
pub struct InferencePipeline {
    model: Arc<dyn Model>,
    model_lock: Mutex<()>,
    log: Logger,
}

impl InferencePipeline {
    pub fn new(model: Arc<dyn Model>, log: &Logger) -> InferencePipeline {
        InferencePipeline {
            model,
            model_lock: Mutex::new(()),
            log: log.new(logging::o!("context" => "pipeline")),
        }
    }

    #[inline]
    pub fn decode(&self, raw: &[u8]) -> Option<Image> {
        self.model.decode(raw)
    }

    pub fn run(&self, images: &[Image]) -> Result<Vec<HandDetail>, ModelError> {
        let _serialized = self.model_lock.lock().unwrap();

        let detections = self.model.detect(images)?;
        logging::debug!(self.log, "detection done"; "batch" => images.len());

        let mut hands: Vec<HandDetail> = detections
            .iter()
            .map(|image_detections| extract_hand_detail(image_detections, &self.log))
            .collect();

        let mut crops = Vec::new();
        for (index, hand) in hands.iter().enumerate() {
            let image = &images[index];
            for bone in &hand.bones_detail {
                crops.push(JointCrop {
                    image,
                    region: bone
                        .rect
                        .clipped_to(image.width as i32, image.height as i32),
                    category_id: bone.category_id,
                });
            }
        }

        let stages = self.model.classify(&crops)?;
        if stages.len() != crops.len() {
            return Err(ModelError::Runtime(format!(
                "classifier returned {} stages for {} crops",
                stages.len(),
                crops.len()
            )));
        }

        let mut offset = 0;
        for hand in &mut hands {
            for bone in &mut hand.bones_detail {
                bone.maturity_stage = stages[offset];
                offset += 1;
            }
        }

        Ok(hands)
    }
}
