//! 流水线配置 - 支持JSON持久化与运行中热更新

use serde::{Deserialize, Serialize};
use std::fs;

// ========== 可热更新参数键 ==========

pub const KEY_TRACK_DIST: &str = "track_dist";
pub const KEY_DETECT_BOTTOM: &str = "detect_bottom";
pub const KEY_MIN_AREA: &str = "min_area";
pub const KEY_MAX_AREA: &str = "max_area";
pub const KEY_MODEL_CONF: &str = "model_conf";
pub const KEY_MODEL_NMS: &str = "model_nms";
pub const KEY_MODEL_SIZE: &str = "model_size";
pub const KEY_TRACK_ENABLED: &str = "track_enabled";
pub const KEY_TRACK_BUFFER: &str = "track_buffer";
pub const KEY_TRACK_MIN_HITS: &str = "track_min_hits";

/// 流水线参数配置
///
/// 处理循环每帧在锁内整体快照一次, 控制方随时可写单个字段;
/// 所有字段都有合法默认值。
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PipelineConfig {
    // === 检测参数 ===
    pub model_conf: f32, // 检测置信度阈值
    pub model_nms: f32,  // NMS IOU阈值
    pub model_size: u32, // 推理输入尺寸

    // === 计数参数 ===
    pub detect_bottom: u32, // 计数线距帧底偏移 (像素)
    pub min_area: f32,      // 目标最小面积
    pub max_area: f32,      // 目标最大面积

    // === 追踪参数 ===
    pub track_enabled: bool, // 是否启用追踪
    pub track_buffer: u32,   // 轨迹最大丢失帧数
    pub track_min_hits: u32, // 轨迹确认所需命中次数
    pub track_dist: f32,     // 关联代价上限 (代价 = 1 - IOU)
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            model_conf: 0.25,
            model_nms: 0.45,
            model_size: 640,

            detect_bottom: 20,
            min_area: 0.0,
            max_area: 1.0e9,

            track_enabled: true,
            track_buffer: 30,
            track_min_hits: 3,
            track_dist: 0.6,
        }
    }
}

impl PipelineConfig {
    /// 从JSON文件加载配置
    pub fn load(path: &str) -> Self {
        match fs::read_to_string(path) {
            Ok(json) => match serde_json::from_str(&json) {
                Ok(config) => {
                    println!("✅ 配置已从 {} 加载", path);
                    config
                }
                Err(e) => {
                    eprintln!("⚠️  配置文件解析失败: {}, 使用默认值", e);
                    Self::default()
                }
            },
            Err(_) => {
                println!("📝 配置文件不存在,创建默认配置...");
                let config = Self::default();
                config.save(path);
                config
            }
        }
    }

    /// 保存配置到JSON文件
    pub fn save(&self, path: &str) {
        match serde_json::to_string_pretty(self) {
            Ok(json) => {
                if let Err(e) = fs::write(path, json) {
                    eprintln!("❌ 保存配置失败: {}", e);
                } else {
                    println!("💾 配置已保存到 {}", path);
                }
            }
            Err(e) => eprintln!("❌ 序列化配置失败: {}", e),
        }
    }

    /// 打印当前配置
    pub fn print_summary(&self) {
        println!("\n🎛️  当前流水线配置:");
        println!("  检测置信度: {:.2}", self.model_conf);
        println!("  NMS阈值: {:.2}", self.model_nms);
        println!("  推理尺寸: {}", self.model_size);
        println!("  计数线偏移: {} 像素", self.detect_bottom);
        println!("  面积过滤: {:.0} ~ {:.0}", self.min_area, self.max_area);
        println!(
            "  追踪: {} (buffer={}, min_hits={}, dist={:.2})\n",
            if self.track_enabled { "启用" } else { "禁用" },
            self.track_buffer,
            self.track_min_hits,
            self.track_dist
        );
    }

    /// 按键名应用单个参数更新
    ///
    /// 返回键名是否被识别; 未识别的键不做任何修改。
    /// 已识别键但值类型无法转换时保留原值。
    pub fn apply(&mut self, name: &str, value: &serde_json::Value) -> bool {
        let num = value.as_f64();
        match name {
            KEY_MODEL_CONF => {
                if let Some(v) = num {
                    self.model_conf = v as f32;
                }
            }
            KEY_MODEL_NMS => {
                if let Some(v) = num {
                    self.model_nms = v as f32;
                }
            }
            KEY_MODEL_SIZE => {
                if let Some(v) = num {
                    self.model_size = v.max(0.0) as u32;
                }
            }
            KEY_DETECT_BOTTOM => {
                if let Some(v) = num {
                    self.detect_bottom = v.max(0.0) as u32;
                }
            }
            KEY_MIN_AREA => {
                if let Some(v) = num {
                    self.min_area = v as f32;
                }
            }
            KEY_MAX_AREA => {
                if let Some(v) = num {
                    self.max_area = v as f32;
                }
            }
            KEY_TRACK_ENABLED => {
                if let Some(b) = value.as_bool() {
                    self.track_enabled = b;
                } else if let Some(v) = num {
                    self.track_enabled = v != 0.0;
                }
            }
            KEY_TRACK_BUFFER => {
                if let Some(v) = num {
                    self.track_buffer = v.max(0.0) as u32;
                }
            }
            KEY_TRACK_MIN_HITS => {
                if let Some(v) = num {
                    self.track_min_hits = v.max(0.0) as u32;
                }
            }
            KEY_TRACK_DIST => {
                if let Some(v) = num {
                    self.track_dist = v as f32;
                }
            }
            _ => return false,
        }
        true
    }
}
