/// 检测与追踪数据结构定义
/// Data structures for detection and tracking

// ========== 公共常量 ==========

/// 未关联追踪ID哨兵值
///
/// 检测框没有稳定身份 (追踪禁用、轨迹未确认) 时使用;
/// 这类检测框参与渲染但永远不参与计数。
pub const UNTRACKED: i64 = -1;

// ========== 数据结构 ==========

/// 检测框 (Detection bounding box)
#[derive(Clone, Debug, PartialEq)]
pub struct BBox {
    pub x1: f32,
    pub y1: f32,
    pub x2: f32,
    pub y2: f32,
    pub confidence: f32,
}

impl BBox {
    pub fn new(x1: f32, y1: f32, x2: f32, y2: f32, confidence: f32) -> Self {
        Self {
            x1,
            y1,
            x2,
            y2,
            confidence,
        }
    }

    pub fn width(&self) -> f32 {
        self.x2 - self.x1
    }

    pub fn height(&self) -> f32 {
        self.y2 - self.y1
    }

    pub fn area(&self) -> f32 {
        self.width() * self.height()
    }

    /// 中心点
    pub fn center(&self) -> (f32, f32) {
        ((self.x1 + self.x2) / 2.0, (self.y1 + self.y2) / 2.0)
    }

    /// 边界框几何是否合法 (坐标有限且宽高为正)
    pub fn is_valid(&self) -> bool {
        [self.x1, self.y1, self.x2, self.y2, self.confidence]
            .iter()
            .all(|v| v.is_finite())
            && self.width() > 0.0
            && self.height() > 0.0
    }
}

/// 单个检测结果: 边界框 + 追踪ID (追踪器分配, 同一目标跨帧稳定)
#[derive(Clone, Debug)]
pub struct Detection {
    pub bbox: BBox,
    /// 追踪ID; `UNTRACKED` 表示未关联
    pub track_id: i64,
}

impl Detection {
    pub fn untracked(bbox: BBox) -> Self {
        Self {
            bbox,
            track_id: UNTRACKED,
        }
    }

    pub fn is_tracked(&self) -> bool {
        self.track_id != UNTRACKED
    }
}
