/// 模型实现 (Models)
///
/// ## YOLOv8
/// - 模型加载 (new) + 预热
/// - letterbox 预处理 (preprocess)
/// - 推理 (OrtBackend::run)
/// - person 类后处理 + NMS (postprocess)
/// - 文件: `yolov8.rs`
///
/// 对外只暴露 `PersonCounter` 能力,流水线不依赖具体模型。
pub mod yolov8;

pub use yolov8::{Letterbox, YoloPersonCounter, PERSON_CLASS_ID};
