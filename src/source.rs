//! 视频输入源管理 (Video source management)
//!
//! 独占持有一个原生采集句柄, 负责摄像头探测、打开校验、
//! 逐帧读取、文件回卷与确定性释放。

use std::collections::BTreeMap;
use std::path::PathBuf;

use once_cell::sync::Lazy;
use opencv::core::Mat;
use opencv::prelude::*;
use opencv::videoio::{self, VideoCapture};

use crate::error::PipelineError;

/// 支持的视频文件扩展名
pub const VIDEO_EXTENSIONS: [&str; 3] = ["mp4", "avi", "mkv"];

/// 摄像头探测范围上限
const MAX_PROBE_INDEX: i32 = 8;

/// 单帧读取超时 (毫秒), 避免无界阻塞
const READ_TIMEOUT_MS: f64 = 5000.0;

/// 输入源: 摄像头索引或视频文件
#[derive(Clone, Debug, PartialEq)]
pub enum Source {
    Camera(i32),
    File(PathBuf),
}

impl Source {
    pub fn describe(&self) -> String {
        match self {
            Source::Camera(index) => format!("摄像头 {}", index),
            Source::File(path) => format!("文件 {}", path.display()),
        }
    }

    pub fn is_file(&self) -> bool {
        matches!(self, Source::File(_))
    }
}

/// 摄像头能力信息
#[derive(Clone, Debug)]
pub struct CameraInfo {
    pub width: i32,
    pub height: i32,
    pub fps: f64,
}

/// 启动后首次访问时探测一次的可用摄像头集合
static AVAILABLE_CAMERAS: Lazy<BTreeMap<i32, CameraInfo>> = Lazy::new(probe_cameras);

fn probe_cameras() -> BTreeMap<i32, CameraInfo> {
    println!("🔍 正在扫描视频设备...");
    let mut found = BTreeMap::new();

    for index in 0..MAX_PROBE_INDEX {
        let Ok(mut capture) = VideoCapture::new(index, videoio::CAP_ANY) else {
            continue;
        };
        if capture.is_opened().unwrap_or(false) {
            let width = capture.get(videoio::CAP_PROP_FRAME_WIDTH).unwrap_or(0.0) as i32;
            let height = capture.get(videoio::CAP_PROP_FRAME_HEIGHT).unwrap_or(0.0) as i32;
            let fps = capture.get(videoio::CAP_PROP_FPS).unwrap_or(0.0);
            println!("   [{}] {}x{} @ {:.0}fps", index, width, height, fps);
            found.insert(index, CameraInfo { width, height, fps });
        }
        let _ = capture.release();
    }

    if found.is_empty() {
        println!("⚠️  未发现可用摄像头");
    } else {
        println!("✅ 找到 {} 个视频设备", found.len());
    }
    found
}

/// 可用摄像头列表 (索引 → 能力信息)
pub fn available_cameras() -> &'static BTreeMap<i32, CameraInfo> {
    &AVAILABLE_CAMERAS
}

/// 单帧读取结果
#[derive(Debug, PartialEq, Eq)]
pub enum ReadOutcome {
    /// 正常帧已写入输出缓冲
    Frame,
    /// 流结束 (文件播放完毕; 回卷策略由调用方决定)
    EndOfStream,
}

/// 输入源管理器 (同一时间独占一个采集句柄)
pub struct SourceManager {
    capture: Option<VideoCapture>,
    source: Option<Source>,
}

impl SourceManager {
    pub fn new() -> Self {
        Self {
            capture: None,
            source: None,
        }
    }

    /// 校验输入源合法性 (不触碰底层设备)
    pub fn validate(source: &Source) -> Result<(), PipelineError> {
        match source {
            Source::Camera(index) => {
                if !available_cameras().contains_key(index) {
                    return Err(PipelineError::InvalidSource(format!(
                        "摄像头索引 {} 不在可用集合中",
                        index
                    )));
                }
            }
            Source::File(path) => {
                if !path.is_file() {
                    return Err(PipelineError::InvalidSource(format!(
                        "文件不存在: {}",
                        path.display()
                    )));
                }
                let ext = path
                    .extension()
                    .and_then(|e| e.to_str())
                    .map(|e| e.to_ascii_lowercase())
                    .unwrap_or_default();
                if !VIDEO_EXTENSIONS.contains(&ext.as_str()) {
                    return Err(PipelineError::InvalidSource(format!(
                        "不支持的视频格式: {} (支持 {:?})",
                        path.display(),
                        VIDEO_EXTENSIONS
                    )));
                }
            }
        }
        Ok(())
    }

    /// 打开输入源, 返回帧高度
    ///
    /// 校验失败时已打开的旧源保持不变;
    /// 校验通过后先释放旧句柄再打开新句柄 (先关后开)。
    pub fn open(&mut self, source: Source) -> Result<i32, PipelineError> {
        Self::validate(&source)?;
        self.close();

        let mut capture = match &source {
            Source::Camera(index) => VideoCapture::new(*index, videoio::CAP_ANY),
            Source::File(path) => {
                VideoCapture::from_file(&path.to_string_lossy(), videoio::CAP_ANY)
            }
        }
        .map_err(|e| PipelineError::DeviceOpenFailed(e.to_string()))?;

        let opened = capture
            .is_opened()
            .map_err(|e| PipelineError::DeviceOpenFailed(e.to_string()))?;
        if !opened {
            return Err(PipelineError::DeviceOpenFailed(format!(
                "无法打开{}",
                source.describe()
            )));
        }

        // 限制缓冲深度并设置读取超时 (仅部分后端支持, 设置失败可忽略)
        let _ = capture.set(videoio::CAP_PROP_BUFFERSIZE, 1.0);
        let _ = capture.set(videoio::CAP_PROP_READ_TIMEOUT_MSEC, READ_TIMEOUT_MS);

        let height = capture
            .get(videoio::CAP_PROP_FRAME_HEIGHT)
            .map_err(|e| PipelineError::DeviceOpenFailed(e.to_string()))? as i32;

        println!("📹 已打开{} (帧高 {})", source.describe(), height);
        self.capture = Some(capture);
        self.source = Some(source);
        Ok(height)
    }

    pub fn is_open(&self) -> bool {
        self.capture.is_some()
    }

    /// 当前源是否为文件 (只有文件源允许回卷)
    pub fn is_file(&self) -> bool {
        self.source.as_ref().map(Source::is_file).unwrap_or(false)
    }

    /// 阻塞读取一帧 (有界等待)
    pub fn read_frame(&mut self, frame: &mut Mat) -> Result<ReadOutcome, PipelineError> {
        let capture = self
            .capture
            .as_mut()
            .ok_or_else(|| PipelineError::Frame("输入源未打开".to_string()))?;

        let grabbed = capture
            .read(frame)
            .map_err(|e| PipelineError::Frame(e.to_string()))?;
        if !grabbed || frame.empty() {
            return Ok(ReadOutcome::EndOfStream);
        }
        Ok(ReadOutcome::Frame)
    }

    /// 文件源回卷到第一帧
    pub fn rewind(&mut self) -> Result<(), PipelineError> {
        if let Some(capture) = self.capture.as_mut() {
            capture
                .set(videoio::CAP_PROP_POS_FRAMES, 0.0)
                .map_err(|e| PipelineError::Frame(e.to_string()))?;
        }
        Ok(())
    }

    /// 幂等关闭; 释放失败仅记录日志, 不向外传播
    pub fn close(&mut self) {
        if let Some(mut capture) = self.capture.take() {
            if let Err(e) = capture.release() {
                eprintln!("⚠️  采集句柄释放失败: {}", e);
            }
        }
        self.source = None;
    }
}

impl Default for SourceManager {
    fn default() -> Self {
        Self::new()
    }
}

impl Drop for SourceManager {
    fn drop(&mut self) {
        self.close();
    }
}
