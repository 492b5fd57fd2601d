/// 目标检测与多目标追踪 (Detection & multi-object tracking)
///
/// - Detector: 检测能力统一接口 (测试中可用脚本化假检测器替换)
/// - OnnxDetector: ONNX Runtime 推理 + ByteTrack 追踪
/// - ByteTracker: 高低分两轮IOU匹配的追踪器
pub mod bytetrack;
pub mod kalman;
pub mod onnx;
pub mod types;

pub use bytetrack::ByteTracker;
pub use onnx::{OnnxDetector, MODEL_EXTENSIONS};
pub use types::{BBox, Detection, UNTRACKED};

use anyhow::Result;
use opencv::core::Mat;

use crate::config::PipelineConfig;

/// 检测能力统一接口
///
/// 输入一帧图像与当前配置快照, 返回 (边界框, 追踪ID) 集合。
/// 同一逻辑会话内追踪ID跨帧稳定; 目标离开画面后重新进入
/// 允许分配新ID (身份连续性完全由实现负责)。
pub trait Detector: Send {
    fn infer(&mut self, frame: &Mat, config: &PipelineConfig) -> Result<Vec<Detection>>;
}
