//! Interface to the external detection/classification runtime. The server
//! only depends on this trait; wiring in an ONNX-backed implementation
//! replaces [`load`] and nothing else.

use crate::inference::report::Rect;
use atlas::logging::{self, Logger};
use std::error;
use std::fmt;
use std::io;
use std::path::Path;
use std::sync::Arc;

/// A decoded radiograph.
pub struct Image {
    pub width: u32,
    pub height: u32,
    pub data: Vec<u8>,
}

/// One detector hit: the class of the skeletal region and its box.
#[derive(Debug, Clone, Copy)]
pub struct Detection {
    pub class_id: i32,
    pub rect: Rect,
}

/// A joint region handed to the classifier together with its category.
pub struct JointCrop<'a> {
    pub image: &'a Image,
    pub region: Rect,
    pub category_id: i32,
}

#[derive(Debug)]
pub enum ModelError {
    Runtime(String),
}

impl fmt::Display for ModelError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            ModelError::Runtime(message) => write!(f, "model runtime error: {}", message),
        }
    }
}

impl error::Error for ModelError {}

/// The two model stages plus image decoding, supplied by the runtime library.
///
/// `detect` returns one detection list per input image; `classify` returns one
/// maturity stage per crop, in order. A decode failure is per-image and
/// yields `None`; runtime failures are batch-level.
pub trait Model: Send + Sync + fmt::Debug {
    fn decode(&self, raw: &[u8]) -> Option<Image>;
    fn detect(&self, images: &[Image]) -> Result<Vec<Vec<Detection>>, ModelError>;
    fn classify(&self, crops: &[JointCrop<'_>]) -> Result<Vec<i32>, ModelError>;
}

/// Validates the model files and wires the backend. Missing files are a
/// fatal startup error. Until a runtime-backed `Model` is linked in, the
/// returned backend is [`NullModel`].
pub fn load(
    detect_model: &Path,
    cls_model: &Path,
    log: &Logger,
) -> io::Result<Arc<dyn Model>> {
    for path in &[detect_model, cls_model] {
        if !path.is_file() {
            return Err(io::Error::new(
                io::ErrorKind::NotFound,
                format!("model file missing: {}", path.display()),
            ));
        }
    }

    logging::warn!(log, "no model runtime linked, predictions will be empty";
                   "context" => "load",
                   "detect_model" => detect_model.display().to_string(),
                   "cls_model" => cls_model.display().to_string());
    Ok(Arc::new(NullModel))
}

/// Backend of last resort: accepts well-formed image bytes and reports no
/// detections, so every assessment comes back empty and invalid.
#[derive(Debug)]
pub struct NullModel;

impl NullModel {
    fn looks_like_image(raw: &[u8]) -> bool {
        raw.starts_with(&[0xFF, 0xD8, 0xFF])            // JPEG
            || raw.starts_with(&[0x89, b'P', b'N', b'G']) // PNG
            || raw.starts_with(b"BM") // BMP
    }
}

impl Model for NullModel {
    fn decode(&self, raw: &[u8]) -> Option<Image> {
        if !Self::looks_like_image(raw) {
            return None;
        }
        Some(Image {
            width: 0,
            height: 0,
            data: raw.to_vec(),
        })
    }

    fn detect(&self, images: &[Image]) -> Result<Vec<Vec<Detection>>, ModelError> {
        Ok(vec![Vec::new(); images.len()])
    }

    fn classify(&self, crops: &[JointCrop<'_>]) -> Result<Vec<i32>, ModelError> {
        Ok(vec![-1; crops.len()])
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;

    #[test]
    fn test_load_requires_model_files() {
        let missing = Path::new("/no/such/model.onnx");
        let result = load(missing, missing, &logging::null());
        assert_eq!(result.unwrap_err().kind(), io::ErrorKind::NotFound);
    }

    #[test]
    fn test_load_with_present_files() {
        let dir = std::env::temp_dir().join(format!("boneaged-models-{}", std::process::id()));
        fs::create_dir_all(&dir).unwrap();
        let detect = dir.join("detect.onnx");
        let cls = dir.join("classify.onnx");
        fs::write(&detect, b"stub").unwrap();
        fs::write(&cls, b"stub").unwrap();

        assert!(load(&detect, &cls, &logging::null()).is_ok());
    }

    #[test]
    fn test_null_model_decode_sniffs_signatures() {
        let model = NullModel;
        assert!(model.decode(&[0xFF, 0xD8, 0xFF, 0xE0, 1, 2]).is_some());
        assert!(model.decode(b"\x89PNG\r\n\x1a\n....").is_some());
        assert!(model.decode(b"BM......").is_some());
        assert!(model.decode(b"not an image").is_none());
        assert!(model.decode(&[]).is_none());
    }

    #[test]
    fn test_null_model_reports_nothing() {
        let model = NullModel;
        let image = model.decode(&[0xFF, 0xD8, 0xFF, 0xE0]).unwrap();
        let detections = model.detect(&[image]).unwrap();
        assert_eq!(detections.len(), 1);
        assert!(detections[0].is_empty());
        assert_eq!(model.classify(&[]).unwrap().len(), 0);
    }
}
