//! 过线计数流水线 (Boundary-crossing counting pipeline)
//!
//! 持续采集视频帧 → 目标检测与多目标追踪 → 过线计数:
//! 每个被追踪目标在底边越过画面底部计数线时恰好被计数一次。
pub mod config; // 流水线配置参数
pub mod counting; // 过线计数引擎
pub mod detection; // 检测与追踪系统
pub mod device; // 计算后端选择
pub mod error; // 错误分类
pub mod source; // 视频输入源管理
pub mod worker; // 流水线工作器

pub use crate::config::PipelineConfig;
pub use crate::counting::{count_line_y, CountingEngine, CountingSession, FrameSummary};
pub use crate::detection::{BBox, Detection, Detector, OnnxDetector, UNTRACKED};
pub use crate::device::{select_device, Device};
pub use crate::error::PipelineError;
pub use crate::source::{available_cameras, CameraInfo, Source, SourceManager};
pub use crate::worker::{CountingPipeline, Event, PipelineState};

/// 贪心NMS: 按置信度降序保留, IOU超过阈值的后续框被抑制
pub fn non_max_suppression(xs: &mut Vec<BBox>, iou_threshold: f32) {
    xs.sort_by(|b1, b2| {
        b2.confidence
            .partial_cmp(&b1.confidence)
            .unwrap_or(std::cmp::Ordering::Equal)
    });

    let mut current_index = 0;
    for index in 0..xs.len() {
        let mut drop = false;
        for prev_index in 0..current_index {
            let iou = detection::kalman::compute_iou(&xs[prev_index], &xs[index]);
            if iou > iou_threshold {
                drop = true;
                break;
            }
        }
        if !drop {
            xs.swap(current_index, index);
            current_index += 1;
        }
    }
    xs.truncate(current_index);
}

/// 生成带分隔符的时间字符串 (用于日志与文件命名)
pub fn gen_time_string(delimiter: &str) -> String {
    let t_now = chrono::Local::now();
    let fmt = format!(
        "%Y{}%m{}%d{}%H{}%M{}%S",
        delimiter, delimiter, delimiter, delimiter, delimiter
    );
    t_now.format(&fmt).to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_nms_suppresses_overlapping_boxes() {
        let mut boxes = vec![
            BBox::new(0.0, 0.0, 100.0, 100.0, 0.8),
            BBox::new(5.0, 5.0, 105.0, 105.0, 0.9), // 高度重叠, 置信度更高
            BBox::new(300.0, 300.0, 400.0, 400.0, 0.7),
        ];
        non_max_suppression(&mut boxes, 0.45);
        assert_eq!(boxes.len(), 2);
        // 保留重叠对中置信度更高者
        assert_eq!(boxes[0].confidence, 0.9);
    }

    #[test]
    fn test_nms_keeps_disjoint_boxes() {
        let mut boxes = vec![
            BBox::new(0.0, 0.0, 10.0, 10.0, 0.5),
            BBox::new(50.0, 50.0, 60.0, 60.0, 0.6),
        ];
        non_max_suppression(&mut boxes, 0.45);
        assert_eq!(boxes.len(), 2);
    }
}
