use serde_derive::Serialize;

/// Axis-aligned box in image coordinates.
#[derive(Debug, Copy, Clone, Default, Eq, PartialEq, Serialize)]
pub struct Rect {
    pub x: i32,
    pub y: i32,
    pub width: i32,
    pub height: i32,
}

impl Rect {
    pub fn new(x: i32, y: i32, width: i32, height: i32) -> Rect {
        Rect {
            x,
            y,
            width,
            height,
        }
    }

    /// Intersection with the image bounds `(0, 0, width, height)`. Boxes
    /// fully outside collapse to an empty rect at the clamped position.
    pub fn clipped_to(self, image_width: i32, image_height: i32) -> Rect {
        let left = self.x.max(0).min(image_width);
        let top = self.y.max(0).min(image_height);
        let right = (self.x + self.width).max(0).min(image_width);
        let bottom = (self.y + self.height).max(0).min(image_height);
        Rect {
            x: left,
            y: top,
            width: (right - left).max(0),
            height: (bottom - top).max(0),
        }
    }
}

/// One scored joint in the prediction response.
#[derive(Debug, Clone, Serialize)]
pub struct BoneDetail {
    pub joint: String,
    #[serde(rename = "box")]
    pub rect: Rect,
    pub category_id: i32,
    pub maturity_stage: i32,
}

/// Full per-image assessment. `is_valid` is false when the detector's output
/// did not match the expected joint layout; the boxes are still reported so a
/// client can inspect what was found.
#[derive(Debug, Clone, Default, Serialize)]
pub struct HandDetail {
    pub is_valid: bool,
    pub bones_detail: Vec<BoneDetail>,
}

impl HandDetail {
    pub fn to_json(&self) -> String {
        serde_json::to_string(self).unwrap_or_default()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_clipping() {
        let image = (100, 80);
        assert_eq!(
            Rect::new(10, 10, 20, 20).clipped_to(image.0, image.1),
            Rect::new(10, 10, 20, 20)
        );
        assert_eq!(
            Rect::new(-5, -5, 20, 20).clipped_to(image.0, image.1),
            Rect::new(0, 0, 15, 15)
        );
        assert_eq!(
            Rect::new(90, 70, 20, 20).clipped_to(image.0, image.1),
            Rect::new(90, 70, 10, 10)
        );
        assert_eq!(
            Rect::new(200, 200, 10, 10).clipped_to(image.0, image.1).width,
            0
        );
    }

    #[test]
    fn test_json_shape() {
        let hand = HandDetail {
            is_valid: true,
            bones_detail: vec![BoneDetail {
                joint: "radius".to_string(),
                rect: Rect::new(1, 2, 3, 4),
                category_id: 0,
                maturity_stage: 9,
            }],
        };

        let json: serde_json::Value = serde_json::from_str(&hand.to_json()).unwrap();
        assert_eq!(json["is_valid"], true);
        assert_eq!(json["bones_detail"][0]["joint"], "radius");
        assert_eq!(json["bones_detail"][0]["box"]["x"], 1);
        assert_eq!(json["bones_detail"][0]["box"]["height"], 4);
        assert_eq!(json["bones_detail"][0]["category_id"], 0);
        assert_eq!(json["bones_detail"][0]["maturity_stage"], 9);
    }
}
