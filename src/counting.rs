//! 过线计数引擎 (Boundary-crossing counting engine)
//!
//! 消费单帧检测结果, 维护每条轨迹的已计数状态,
//! 按"底边过线"规则推导单帧与累计计数:
//! 检测框底边到达 `帧高 - detect_bottom` (含) 即视为过线,
//! 每个追踪ID在一个会话内至多计数一次。

use std::collections::HashSet;

use opencv::core::{Mat, Point, Rect, Scalar};
use opencv::imgproc;
use opencv::prelude::*;

use crate::config::PipelineConfig;
use crate::detection::{Detection, UNTRACKED};

// ========== 会话状态 ==========

/// 计数会话: 两次重置之间的累计状态
#[derive(Debug, Clone, Default)]
pub struct CountingSession {
    /// 累计计数 (自上次重置起单调不减)
    pub cumulative: u64,

    /// 最近一帧的计数
    pub frame_count: u32,

    /// 已计数的追踪ID集合 (进入后不再离开, 直到重置)
    counted: HashSet<i64>,

    /// 当前输入源的帧高度
    pub frame_height: i32,
}

impl CountingSession {
    pub fn new(frame_height: i32) -> Self {
        Self {
            frame_height,
            ..Self::default()
        }
    }

    /// 清空计数状态 (帧高保留)
    pub fn reset(&mut self) {
        self.cumulative = 0;
        self.frame_count = 0;
        self.counted.clear();
    }

    pub fn is_counted(&self, track_id: i64) -> bool {
        self.counted.contains(&track_id)
    }
}

// ========== 单帧结果 ==========

/// 单个检测框的叠加指令
pub struct OverlayBox {
    pub detection: Detection,
    /// 该ID在当前会话中已被计数
    pub counted: bool,
}

/// 单帧计数摘要 + 叠加指令
pub struct FrameSummary {
    pub frame_count: u32,
    pub cumulative: u64,
    pub count_line_y: i32,
    pub boxes: Vec<OverlayBox>,
}

// ========== 计数引擎 ==========

pub struct CountingEngine;

impl CountingEngine {
    /// 更新计数状态
    ///
    /// 永不失败: 几何非法的检测框被静默跳过。
    /// 计数条件 (全部满足): 追踪ID有效 ∧ 底边过线 ∧ 本会话尚未计数。
    pub fn update(
        session: &mut CountingSession,
        detections: &[Detection],
        config: &PipelineConfig,
    ) -> FrameSummary {
        let line_y = count_line_y(session.frame_height, config.detect_bottom);
        let mut frame_count = 0u32;
        let mut boxes = Vec::with_capacity(detections.len());

        for det in detections {
            if !det.bbox.is_valid() {
                continue;
            }

            // 底边到达计数线即过线 (含等于)
            let crossed = det.bbox.y2 >= line_y as f32;
            if crossed && det.track_id != UNTRACKED && session.counted.insert(det.track_id) {
                frame_count += 1;
            }

            boxes.push(OverlayBox {
                counted: det.track_id != UNTRACKED && session.counted.contains(&det.track_id),
                detection: det.clone(),
            });
        }

        session.frame_count = frame_count;
        session.cumulative += frame_count as u64;

        FrameSummary {
            frame_count,
            cumulative: session.cumulative,
            count_line_y: line_y,
            boxes,
        }
    }
}

/// 计数线Y坐标 (距帧底 detect_bottom 像素)
pub fn count_line_y(frame_height: i32, detect_bottom: u32) -> i32 {
    (frame_height - detect_bottom as i32).max(0)
}

// ========== 叠加绘制 ==========

/// 轨迹配色盘 (BGR, 按ID取模)
const PALETTE: [(f64, f64, f64); 8] = [
    (64.0, 64.0, 255.0),   // 红
    (64.0, 255.0, 64.0),   // 绿
    (255.0, 64.0, 64.0),   // 蓝
    (64.0, 255.0, 255.0),  // 黄
    (255.0, 64.0, 255.0),  // 品红
    (255.0, 255.0, 64.0),  // 青
    (0.0, 128.0, 255.0),   // 橙
    (255.0, 0.0, 128.0),   // 紫
];

fn track_color(track_id: i64, counted: bool) -> Scalar {
    if track_id == UNTRACKED {
        // 未关联检测: 灰色, 仅展示
        return Scalar::new(128.0, 128.0, 128.0, 0.0);
    }
    if counted {
        // 已计数: 统一绿色高亮
        return Scalar::new(0.0, 255.0, 0.0, 0.0);
    }
    let (b, g, r) = PALETTE[(track_id as usize) % PALETTE.len()];
    Scalar::new(b, g, r, 0.0)
}

/// 将叠加指令烧录进帧: 检测框 + ID标签 + 计数线 + HUD统计
pub fn annotate(frame: &mut Mat, summary: &FrameSummary, latency_ms: f64) -> opencv::Result<()> {
    let width = frame.cols();

    // 计数线 (金色)
    imgproc::line(
        frame,
        Point::new(0, summary.count_line_y),
        Point::new(width, summary.count_line_y),
        Scalar::new(0.0, 215.0, 255.0, 0.0),
        2,
        imgproc::LINE_8,
        0,
    )?;

    for item in &summary.boxes {
        let bbox = &item.detection.bbox;
        let color = track_color(item.detection.track_id, item.counted);
        let rect = Rect::new(
            bbox.x1 as i32,
            bbox.y1 as i32,
            bbox.width().max(1.0) as i32,
            bbox.height().max(1.0) as i32,
        );
        imgproc::rectangle(frame, rect, color, 2, imgproc::LINE_8, 0)?;

        let label = if item.detection.track_id == UNTRACKED {
            format!("{:.2}", bbox.confidence)
        } else {
            format!("ID {}", item.detection.track_id)
        };
        imgproc::put_text(
            frame,
            &label,
            Point::new(bbox.x1 as i32, (bbox.y1 as i32).saturating_sub(6)),
            imgproc::FONT_HERSHEY_SIMPLEX,
            0.5,
            color,
            1,
            imgproc::LINE_8,
            false,
        )?;
    }

    // HUD统计
    let hud = format!(
        "Count: {} | Frame: +{} | {:.1}ms",
        summary.cumulative, summary.frame_count, latency_ms
    );
    imgproc::put_text(
        frame,
        &hud,
        Point::new(10, 24),
        imgproc::FONT_HERSHEY_SIMPLEX,
        0.6,
        Scalar::new(0.0, 255.0, 0.0, 0.0),
        2,
        imgproc::LINE_8,
        false,
    )?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::detection::BBox;

    fn config_with_bottom(detect_bottom: u32) -> PipelineConfig {
        PipelineConfig {
            detect_bottom,
            ..PipelineConfig::default()
        }
    }

    fn det(y1: f32, y2: f32, track_id: i64) -> Detection {
        Detection {
            bbox: BBox::new(10.0, y1, 30.0, y2, 0.9),
            track_id,
        }
    }

    #[test]
    fn test_boundary_inclusive_and_idempotent() {
        // 帧高600, 偏移20 → 计数线 y=580;
        // 框(y=560, 高30) → 底边590 ≥ 580 → 计数
        let mut session = CountingSession::new(600);
        let config = config_with_bottom(20);

        let first = CountingEngine::update(&mut session, &[det(560.0, 590.0, 7)], &config);
        assert_eq!(first.count_line_y, 580);
        assert_eq!(first.frame_count, 1);
        assert_eq!(first.cumulative, 1);
        assert!(session.is_counted(7));

        // 同一ID后续帧不重复计数
        let second = CountingEngine::update(&mut session, &[det(560.0, 590.0, 7)], &config);
        assert_eq!(second.frame_count, 0);
        assert_eq!(second.cumulative, 1);
        assert!(second.boxes[0].counted);
    }

    #[test]
    fn test_bottom_edge_exactly_on_line_counts() {
        let mut session = CountingSession::new(600);
        let config = config_with_bottom(20);
        let summary = CountingEngine::update(&mut session, &[det(550.0, 580.0, 3)], &config);
        assert_eq!(summary.frame_count, 1);
    }

    #[test]
    fn test_above_line_not_counted() {
        let mut session = CountingSession::new(600);
        let config = config_with_bottom(20);
        let summary = CountingEngine::update(&mut session, &[det(500.0, 579.0, 3)], &config);
        assert_eq!(summary.frame_count, 0);
        assert!(!session.is_counted(3));
    }

    #[test]
    fn test_untracked_never_counted() {
        let mut session = CountingSession::new(600);
        let config = config_with_bottom(20);
        let summary =
            CountingEngine::update(&mut session, &[det(560.0, 599.0, UNTRACKED)], &config);
        assert_eq!(summary.frame_count, 0);
        assert_eq!(summary.cumulative, 0);
        // 仍然渲染
        assert_eq!(summary.boxes.len(), 1);
        assert!(!summary.boxes[0].counted);
    }

    #[test]
    fn test_malformed_box_silently_skipped() {
        let mut session = CountingSession::new(600);
        let config = config_with_bottom(20);
        let bad = Detection {
            bbox: BBox::new(10.0, 590.0, 30.0, 560.0, 0.9), // 高度为负
            track_id: 5,
        };
        let nan = Detection {
            bbox: BBox::new(f32::NAN, 560.0, 30.0, 590.0, 0.9),
            track_id: 6,
        };
        let summary = CountingEngine::update(&mut session, &[bad, nan], &config);
        assert_eq!(summary.frame_count, 0);
        assert!(summary.boxes.is_empty());
    }

    #[test]
    fn test_cumulative_is_sum_of_frame_counts_and_monotone() {
        let mut session = CountingSession::new(600);
        let config = config_with_bottom(20);

        let frames = vec![
            vec![det(560.0, 590.0, 1), det(560.0, 590.0, 2)],
            vec![det(560.0, 590.0, 1)],
            vec![det(560.0, 590.0, 3), det(100.0, 200.0, 4)],
        ];

        let mut sum = 0u64;
        let mut last_cumulative = 0u64;
        for dets in &frames {
            let summary = CountingEngine::update(&mut session, dets, &config);
            sum += summary.frame_count as u64;
            assert!(summary.cumulative >= last_cumulative);
            last_cumulative = summary.cumulative;
        }
        assert_eq!(last_cumulative, sum);
        assert_eq!(last_cumulative, 3); // ID 1,2,3 过线; 4未过线
    }

    #[test]
    fn test_reset_and_replay_reproduces_counts() {
        let config = config_with_bottom(20);
        let frames = vec![
            vec![det(560.0, 590.0, 1)],
            vec![det(560.0, 590.0, 1), det(560.0, 595.0, 2)],
            vec![det(560.0, 585.0, 2)],
        ];

        let run = |session: &mut CountingSession| -> u64 {
            let mut last = 0;
            for dets in &frames {
                last = CountingEngine::update(session, dets, &config).cumulative;
            }
            last
        };

        let mut session = CountingSession::new(600);
        let first_run = run(&mut session);
        session.reset();
        let second_run = run(&mut session);
        assert_eq!(first_run, second_run);
        assert_eq!(first_run, 2);
    }

    #[test]
    fn test_count_line_saturates_at_zero() {
        assert_eq!(count_line_y(10, 50), 0);
    }
}
