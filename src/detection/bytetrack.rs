//! ByteTrack 算法实现
//! ByteTrack: Simple and effective multi-object tracking
//!
//! 核心思想:
//! 1. 高低分检测框分开处理
//! 2. 高分框优先匹配 (IOU)
//! 3. 低分框救援丢失的轨迹
//! 4. 纯运动模型,无需外观特征
//!
//! 本实现的关联参数 (丢失帧上限/确认命中数/关联代价上限) 来自
//! 配置快照, 每帧可热更新。

use super::kalman::{compute_iou, KalmanBoxFilter};
use super::types::{BBox, Detection, UNTRACKED};
use crate::config::PipelineConfig;

/// 单条轨迹
#[derive(Clone)]
struct Track {
    /// 唯一追踪ID (正整数, 会话内递增)
    id: u32,

    /// 当前边界框 (卡尔曼滤波平滑后)
    bbox: BBox,

    kalman: KalmanBoxFilter,

    /// 连续丢失帧数
    frames_lost: u32,

    /// 累计命中次数 (达到 track_min_hits 后轨迹才对外确认)
    hits: u32,
}

impl Track {
    fn new(id: u32, bbox: BBox) -> Self {
        // 降低观测噪声(r=0.5),更信任检测结果,快速响应移动
        let kalman = KalmanBoxFilter::new(&bbox, 0.1, 0.5);
        let smoothed = kalman.state_bbox();

        Self {
            id,
            bbox: smoothed,
            kalman,
            frames_lost: 0,
            hits: 1,
        }
    }

    fn predict(&mut self) {
        self.kalman.predict();
        self.bbox = self.kalman.state_bbox();
    }

    fn update(&mut self, bbox: &BBox) {
        self.kalman.update(bbox);
        self.bbox = self.kalman.state_bbox();
        self.frames_lost = 0;
        self.hits += 1;
    }

    fn mark_lost(&mut self) {
        self.frames_lost += 1;
    }
}

/// ByteTrack 追踪器
pub struct ByteTracker {
    tracks: Vec<Track>,

    /// 下一个分配的ID
    next_id: u32,

    /// 高分检测阈值
    high_score_threshold: f32,

    /// 低分检测阈值 (救援用)
    low_score_threshold: f32,

    /// 救援匹配代价上限 (比首轮更宽松)
    rescue_cost_threshold: f32,
}

impl ByteTracker {
    pub fn new() -> Self {
        Self {
            tracks: Vec::new(),
            next_id: 1,
            high_score_threshold: 0.4,
            low_score_threshold: 0.1,
            rescue_cost_threshold: 0.7,
        }
    }

    /// 更新追踪 (ByteTrack 三步匹配)
    ///
    /// 为每个输入检测框返回关联结果: 已确认轨迹带稳定ID与平滑后的框,
    /// 未确认/未关联的检测以 `UNTRACKED` 返回 (可渲染, 不计数)。
    pub fn update(&mut self, detections: &[BBox], config: &PipelineConfig) -> Vec<Detection> {
        // 1. 所有轨迹先预测
        for track in &mut self.tracks {
            track.predict();
        }

        // 2. 分离高低分检测框
        let mut high_dets: Vec<usize> = Vec::new();
        let mut low_dets: Vec<usize> = Vec::new();
        for (idx, det) in detections.iter().enumerate() {
            if det.confidence >= self.high_score_threshold {
                high_dets.push(idx);
            } else if det.confidence >= self.low_score_threshold {
                low_dets.push(idx);
            }
        }

        // 检测框 → 轨迹ID 的关联表
        let mut assigned: Vec<Option<u32>> = vec![None; detections.len()];
        let mut matched_track = vec![false; self.tracks.len()];

        // 3. 第一轮匹配: 高分检测 + 所有轨迹 (代价 = 1 - IOU ≤ track_dist)
        let all_tracks: Vec<usize> = (0..self.tracks.len()).collect();
        for (det_idx, track_idx) in
            self.match_detections(&high_dets, detections, &all_tracks, config.track_dist)
        {
            matched_track[track_idx] = true;
            self.tracks[track_idx].update(&detections[det_idx]);
            assigned[det_idx] = Some(self.tracks[track_idx].id);
        }

        // 4. 第二轮匹配: 低分检测 + 未匹配的轨迹 (救援)
        let unmatched_tracks: Vec<usize> = (0..self.tracks.len())
            .filter(|&idx| !matched_track[idx])
            .collect();
        for (det_idx, track_idx) in self.match_detections(
            &low_dets,
            detections,
            &unmatched_tracks,
            self.rescue_cost_threshold,
        ) {
            matched_track[track_idx] = true;
            self.tracks[track_idx].update(&detections[det_idx]);
            assigned[det_idx] = Some(self.tracks[track_idx].id);
        }

        // 5. 未匹配的高分检测 → 新建轨迹
        for &det_idx in &high_dets {
            if assigned[det_idx].is_none() {
                let track = Track::new(self.next_id, detections[det_idx].clone());
                assigned[det_idx] = Some(track.id);
                self.tracks.push(track);
                self.next_id += 1;
            }
        }

        // 6. 未匹配的轨迹 → 标记丢失
        for (track_idx, &matched) in matched_track.iter().enumerate() {
            if !matched {
                self.tracks[track_idx].mark_lost();
            }
        }

        // 7. 删除丢失太久的轨迹
        let buffer = config.track_buffer;
        self.tracks.retain(|t| t.frames_lost <= buffer);

        // 8. 输出: 命中数达标的轨迹带ID, 其余检测以 UNTRACKED 返回
        let min_hits = config.track_min_hits.max(1);
        detections
            .iter()
            .enumerate()
            .map(|(det_idx, det)| match assigned[det_idx] {
                Some(id) => match self.track_by_id(id) {
                    Some(track) if track.hits >= min_hits => Detection {
                        bbox: track.bbox.clone(),
                        track_id: id as i64,
                    },
                    _ => Detection::untracked(det.clone()),
                },
                None => Detection::untracked(det.clone()),
            })
            .collect()
    }

    /// 会话重置: 清空全部轨迹
    ///
    /// ID计数不回卷: 重新进入的目标拿到新ID, 不会与历史ID混淆。
    pub fn reset(&mut self) {
        self.tracks.clear();
    }

    pub fn track_count(&self) -> usize {
        self.tracks.len()
    }

    fn track_by_id(&self, id: u32) -> Option<&Track> {
        self.tracks.iter().find(|t| t.id == id)
    }

    /// 贪心IOU匹配: 按代价升序逐对确认
    fn match_detections(
        &self,
        det_indices: &[usize],
        detections: &[BBox],
        track_indices: &[usize],
        cost_threshold: f32,
    ) -> Vec<(usize, usize)> {
        if det_indices.is_empty() || track_indices.is_empty() {
            return Vec::new();
        }

        // 计算 IOU 代价矩阵 (超过代价上限的组合直接剔除)
        let mut candidates = Vec::new();
        for (local_det, &det_idx) in det_indices.iter().enumerate() {
            for (local_track, &track_idx) in track_indices.iter().enumerate() {
                let predicted = self.tracks[track_idx].kalman.predicted_bbox();
                let cost = 1.0 - compute_iou(&detections[det_idx], &predicted);
                if cost <= cost_threshold {
                    candidates.push((cost, det_idx, local_det, track_idx, local_track));
                }
            }
        }

        // 按代价排序后贪心确认
        candidates.sort_by(|a, b| a.0.partial_cmp(&b.0).unwrap_or(std::cmp::Ordering::Equal));

        let mut assignments = Vec::new();
        let mut used_det = vec![false; det_indices.len()];
        let mut used_track = vec![false; track_indices.len()];
        for (_, det_idx, local_det, track_idx, local_track) in candidates {
            if !used_det[local_det] && !used_track[local_track] {
                assignments.push((det_idx, track_idx));
                used_det[local_det] = true;
                used_track[local_track] = true;
            }
        }
        assignments
    }
}

impl Default for ByteTracker {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config_with_min_hits(min_hits: u32) -> PipelineConfig {
        PipelineConfig {
            track_min_hits: min_hits,
            ..PipelineConfig::default()
        }
    }

    fn bbox_at(x: f32, y: f32) -> BBox {
        BBox::new(x, y, x + 40.0, y + 80.0, 0.9)
    }

    #[test]
    fn test_id_stable_across_frames() {
        let mut tracker = ByteTracker::new();
        let config = config_with_min_hits(1);

        let first = tracker.update(&[bbox_at(100.0, 100.0)], &config);
        assert_eq!(first.len(), 1);
        let id = first[0].track_id;
        assert!(id > 0);

        // 小幅移动, 仍应关联到同一条轨迹
        for step in 1..=5 {
            let out = tracker.update(&[bbox_at(100.0 + step as f32 * 3.0, 100.0)], &config);
            assert_eq!(out[0].track_id, id);
        }
    }

    #[test]
    fn test_min_hits_gates_confirmation() {
        let mut tracker = ByteTracker::new();
        let config = config_with_min_hits(3);

        // 前两帧命中数不足, 以 UNTRACKED 返回
        let out = tracker.update(&[bbox_at(50.0, 50.0)], &config);
        assert_eq!(out[0].track_id, UNTRACKED);
        let out = tracker.update(&[bbox_at(52.0, 50.0)], &config);
        assert_eq!(out[0].track_id, UNTRACKED);

        // 第三帧确认
        let out = tracker.update(&[bbox_at(54.0, 50.0)], &config);
        assert!(out[0].track_id > 0);
    }

    #[test]
    fn test_track_retired_after_buffer_and_new_id_assigned() {
        let mut tracker = ByteTracker::new();
        let config = PipelineConfig {
            track_min_hits: 1,
            track_buffer: 3,
            ..PipelineConfig::default()
        };

        let out = tracker.update(&[bbox_at(200.0, 200.0)], &config);
        let first_id = out[0].track_id;

        // 连续空帧直到轨迹被删除
        for _ in 0..5 {
            tracker.update(&[], &config);
        }
        assert_eq!(tracker.track_count(), 0);

        // 同一位置重新出现 → 新ID (身份连续性由检测器负责, 重入重计是预期行为)
        let out = tracker.update(&[bbox_at(200.0, 200.0)], &config);
        assert!(out[0].track_id > first_id);
    }

    #[test]
    fn test_low_score_detection_never_creates_track() {
        let mut tracker = ByteTracker::new();
        let config = config_with_min_hits(1);

        let weak = BBox::new(10.0, 10.0, 40.0, 60.0, 0.2);
        let out = tracker.update(&[weak], &config);
        assert_eq!(out[0].track_id, UNTRACKED);
        assert_eq!(tracker.track_count(), 0);
    }

    #[test]
    fn test_reset_clears_tracks() {
        let mut tracker = ByteTracker::new();
        let config = config_with_min_hits(1);
        tracker.update(&[bbox_at(0.0, 0.0)], &config);
        assert_eq!(tracker.track_count(), 1);
        tracker.reset();
        assert_eq!(tracker.track_count(), 0);
    }
}
