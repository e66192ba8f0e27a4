//! Batched bone-age inference: the dispatcher that decouples I/O loops from
//! model execution, the joint-extraction pipeline and the tables describing
//! the skeletal regions the models work with.

pub mod bones;
pub mod dispatch;
pub mod model;
pub mod pipeline;
pub mod report;

pub use self::dispatch::{Dispatcher, InferenceResult, InferenceTask};
pub use self::model::{Detection, Image, JointCrop, Model, ModelError};
pub use self::report::{BoneDetail, HandDetail, Rect};
