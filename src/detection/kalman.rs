//! 追踪公共组件: 边界框卡尔曼滤波与IOU计算
//! Common components for box tracking

use super::types::BBox;

/// 简化卡尔曼滤波器 (单个边界框的位置和尺寸平滑)
/// 状态向量: [cx, cy, w, h, vx, vy, vw, vh]
#[derive(Clone)]
pub struct KalmanBoxFilter {
    /// 状态估计: [cx, cy, w, h, vx, vy, vw, vh]
    state: [f32; 8],

    /// 估计误差协方差 (简化为对角阵)
    p: [f32; 8],

    /// 过程噪声 (运动不确定性)
    q: f32,

    /// 观测噪声 (测量不确定性)
    r: f32,

    /// 速度衰减因子 (用于静止目标)
    velocity_decay: f32,

    /// 静止阈值 (像素/帧)
    stationary_threshold: f32,

    /// 连续静止帧数计数器
    stationary_count: u32,

    /// 最近一次观测的置信度 (透传给输出框)
    confidence: f32,
}

impl KalmanBoxFilter {
    /// 创建新的卡尔曼滤波器
    ///
    /// # 参数
    /// - `bbox`: 初始边界框
    /// - `q`: 过程噪声 (0.1-1.0, 越小越平滑)
    /// - `r`: 观测噪声 (越大越平滑)
    pub fn new(bbox: &BBox, q: f32, r: f32) -> Self {
        let (cx, cy) = bbox.center();

        Self {
            state: [cx, cy, bbox.width(), bbox.height(), 0.0, 0.0, 0.0, 0.0],
            p: [10.0; 8],
            q,
            r,
            velocity_decay: 0.95,
            stationary_threshold: 2.0,
            stationary_count: 0,
            confidence: bbox.confidence,
        }
    }

    /// 预测下一帧状态 (匀速运动模型 + 速度衰减)
    pub fn predict(&mut self) {
        // 速度小于阈值视为静止
        let speed = (self.state[4] * self.state[4] + self.state[5] * self.state[5]).sqrt();
        let is_stationary = speed < self.stationary_threshold;

        if is_stationary {
            self.stationary_count += 1;
            // 连续静止3帧后大幅衰减速度
            let decay = if self.stationary_count > 3 {
                0.7
            } else {
                self.velocity_decay
            };
            self.state[4] *= decay;
            self.state[5] *= decay;
            self.state[6] *= decay;
            self.state[7] *= decay;
        } else {
            self.stationary_count = 0;
            self.state[4] *= self.velocity_decay;
            self.state[5] *= self.velocity_decay;
            self.state[6] *= 0.98; // 尺寸变化更慢
            self.state[7] *= 0.98;
        }

        // 状态转移: x = x + vx
        self.state[0] += self.state[4];
        self.state[1] += self.state[5];
        self.state[2] += self.state[6];
        self.state[3] += self.state[7];

        // 协方差预测: P = P + Q (静止时减小过程噪声)
        let q_factor = if is_stationary { 0.5 } else { 1.0 };
        for i in 0..8 {
            self.p[i] += self.q * q_factor;
        }
    }

    /// 融合观测值 (自适应噪声调整)
    pub fn update(&mut self, bbox: &BBox) {
        let (cx, cy) = bbox.center();
        let y = [
            cx - self.state[0],
            cy - self.state[1],
            bbox.width() - self.state[2],
            bbox.height() - self.state[3],
        ];

        // 根据残差大小自适应调整观测噪声:
        // 小幅移动更信任观测, 大幅跳变更信任预测
        let residual_norm = (y[0] * y[0] + y[1] * y[1]).sqrt();
        let adaptive_r = if residual_norm < self.stationary_threshold {
            self.r * 0.3
        } else if residual_norm < 10.0 {
            self.r
        } else {
            self.r * 3.0
        };

        // 卡尔曼增益: K = P / (P + R)
        let mut k = [0f32; 8];
        for i in 0..4 {
            k[i] = self.p[i] / (self.p[i] + adaptive_r);
            k[i + 4] = self.p[i + 4] / (self.p[i + 4] + adaptive_r * 10.0);
        }

        // 状态更新: x = x + K * y
        self.state[0] += k[0] * y[0];
        self.state[1] += k[1] * y[1];
        self.state[2] += k[2] * y[2];
        self.state[3] += k[3] * y[3];

        // 速度更新 (静止时减小速度估计影响)
        let velocity_gain = if residual_norm < self.stationary_threshold {
            0.3
        } else {
            1.0
        };
        self.state[4] += k[4] * y[0] * velocity_gain;
        self.state[5] += k[5] * y[1] * velocity_gain;
        self.state[6] += k[6] * y[2] * velocity_gain;
        self.state[7] += k[7] * y[3] * velocity_gain;

        // 协方差更新: P = (I - K) * P
        for i in 0..8 {
            self.p[i] *= 1.0 - k[i];
        }

        if residual_norm >= self.stationary_threshold {
            self.stationary_count = 0;
        }
        self.confidence = bbox.confidence;
    }

    /// 当前状态的边界框 (平滑后)
    pub fn state_bbox(&self) -> BBox {
        let cx = self.state[0];
        let cy = self.state[1];
        let w = self.state[2].max(1.0);
        let h = self.state[3].max(1.0);
        BBox::new(
            cx - w / 2.0,
            cy - h / 2.0,
            cx + w / 2.0,
            cy + h / 2.0,
            self.confidence,
        )
    }

    /// 预测的边界框 (用于匹配)
    pub fn predicted_bbox(&self) -> BBox {
        let cx = self.state[0] + self.state[4];
        let cy = self.state[1] + self.state[5];
        let w = (self.state[2] + self.state[6]).max(1.0);
        let h = (self.state[3] + self.state[7]).max(1.0);
        BBox::new(
            cx - w / 2.0,
            cy - h / 2.0,
            cx + w / 2.0,
            cy + h / 2.0,
            self.confidence,
        )
    }
}

// ========== 工具函数 ==========

/// 计算两个边界框的IOU (Intersection over Union)
pub fn compute_iou(bbox1: &BBox, bbox2: &BBox) -> f32 {
    let x1 = bbox1.x1.max(bbox2.x1);
    let y1 = bbox1.y1.max(bbox2.y1);
    let x2 = bbox1.x2.min(bbox2.x2);
    let y2 = bbox1.y2.min(bbox2.y2);

    if x2 <= x1 || y2 <= y1 {
        return 0.0;
    }

    let intersection = (x2 - x1) * (y2 - y1);
    let union = bbox1.area() + bbox2.area() - intersection;

    if union <= 0.0 {
        return 0.0;
    }

    intersection / union
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_iou_identical() {
        let a = BBox::new(0.0, 0.0, 10.0, 10.0, 1.0);
        assert!((compute_iou(&a, &a) - 1.0).abs() < 1e-6);
    }

    #[test]
    fn test_iou_disjoint() {
        let a = BBox::new(0.0, 0.0, 10.0, 10.0, 1.0);
        let b = BBox::new(20.0, 20.0, 30.0, 30.0, 1.0);
        assert_eq!(compute_iou(&a, &b), 0.0);
    }

    #[test]
    fn test_kalman_converges_to_observation() {
        let initial = BBox::new(0.0, 0.0, 10.0, 10.0, 0.9);
        let mut filter = KalmanBoxFilter::new(&initial, 0.1, 0.5);

        // 连续观测到同一位置, 状态应收敛到观测框附近
        let observed = BBox::new(2.0, 2.0, 12.0, 12.0, 0.9);
        for _ in 0..20 {
            filter.predict();
            filter.update(&observed);
        }
        let state = filter.state_bbox();
        assert!((state.x1 - observed.x1).abs() < 1.0);
        assert!((state.y2 - observed.y2).abs() < 1.0);
    }
}
