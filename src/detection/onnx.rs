//! ONNX Runtime 检测器
//! 职责: 模型加载 → 预处理 → 推理 → 解码/NMS/面积过滤 → ByteTrack关联

use std::path::Path;

use anyhow::{bail, Context, Result};
use opencv::core::{self, Mat, MatTraitConstManual, Size};
use opencv::imgproc;
use opencv::prelude::*;
use ort::execution_providers as ep;
use ort::session::Session;
use ort::value::Tensor;

use super::bytetrack::ByteTracker;
use super::types::{BBox, Detection};
use crate::config::PipelineConfig;
use crate::device::Device;
use crate::error::PipelineError;
use crate::non_max_suppression;

/// 支持的模型文件扩展名
pub const MODEL_EXTENSIONS: [&str; 2] = ["onnx", "ort"];

/// YOLO系列检测模型 + ByteTrack追踪
///
/// 会话与执行提供器在加载时绑定一次; 置信度/NMS/输入尺寸/追踪参数
/// 每帧从配置快照读取, 支持热更新。
pub struct OnnxDetector {
    session: Session,
    tracker: ByteTracker,
    device: Device,
}

impl OnnxDetector {
    /// 校验模型文件路径与扩展名 (不触碰推理后端)
    pub fn validate(path: &Path) -> Result<(), PipelineError> {
        if !path.is_file() {
            return Err(PipelineError::ModelLoad(format!(
                "模型文件不存在: {}",
                path.display()
            )));
        }
        let ext = path
            .extension()
            .and_then(|e| e.to_str())
            .map(|e| e.to_ascii_lowercase())
            .unwrap_or_default();
        if !MODEL_EXTENSIONS.contains(&ext.as_str()) {
            return Err(PipelineError::ModelLoad(format!(
                "不支持的模型格式: {} (支持 {:?})",
                path.display(),
                MODEL_EXTENSIONS
            )));
        }
        Ok(())
    }

    /// 加载模型并绑定计算后端
    pub fn load(path: &Path, device: Device) -> Result<Self, PipelineError> {
        Self::validate(path)?;
        let session = build_session(path, device)
            .map_err(|e| PipelineError::ModelLoad(format!("{:#}", e)))?;
        println!(
            "✅ 检测模型加载成功: {} ({})",
            path.display(),
            device.name()
        );
        Ok(Self {
            session,
            tracker: ByteTracker::new(),
            device,
        })
    }

    pub fn device(&self) -> Device {
        self.device
    }
}

impl super::Detector for OnnxDetector {
    fn infer(&mut self, frame: &Mat, config: &PipelineConfig) -> Result<Vec<Detection>> {
        let input_size = config.model_size.max(32) as i32;
        let frame_w = frame.cols() as f32;
        let frame_h = frame.rows() as f32;

        // 1. 预处理: BGR → RGB → NCHW f32
        let tensor = preprocess(frame, input_size)?;

        // 2. 推理
        let outputs = self
            .session
            .run(ort::inputs!["images" => tensor])
            .context("YOLO推理失败")?;
        let value = outputs
            .iter()
            .next()
            .map(|(_, v)| v)
            .context("模型没有输出张量")?;
        let (shape, data) = value
            .try_extract_tensor::<f32>()
            .context("提取输出张量失败")?;

        // 3. 解码 + 置信度过滤
        let mut bboxes = decode_predictions(
            shape,
            data,
            config.model_conf,
            input_size as f32,
            frame_w,
            frame_h,
        )?;

        // 4. NMS + 面积过滤
        non_max_suppression(&mut bboxes, config.model_nms);
        bboxes.retain(|b| {
            let area = b.area();
            area >= config.min_area && area <= config.max_area
        });

        // 5. 追踪关联: 启用时换取稳定ID, 禁用时全部视为未关联
        let detections = if config.track_enabled {
            self.tracker.update(&bboxes, config)
        } else {
            bboxes.into_iter().map(Detection::untracked).collect()
        };
        Ok(detections)
    }
}

fn build_session(path: &Path, device: Device) -> Result<Session> {
    let builder = Session::builder().context("创建ORT会话构建器失败")?;
    let builder = match device {
        Device::Trt(id) => builder.with_execution_providers([
            ep::TensorRTExecutionProvider::default()
                .with_device_id(id)
                .build(),
            // TensorRT不可用的算子回退到CUDA
            ep::CUDAExecutionProvider::default()
                .with_device_id(id)
                .build(),
        ]),
        Device::Cuda(id) => builder.with_execution_providers([ep::CUDAExecutionProvider::default()
            .with_device_id(id)
            .build()]),
        Device::Cpu => {
            builder.with_execution_providers([ep::CPUExecutionProvider::default().build()])
        }
    }
    .context("注册执行提供器失败")?;
    builder.commit_from_file(path).context("加载ONNX模型失败")
}

/// 预处理: 缩放到推理尺寸, BGR→RGB, 归一化为 [1,3,S,S] NCHW 张量
fn preprocess(frame: &Mat, size: i32) -> Result<ort::value::DynValue> {
    let mut resized = Mat::default();
    imgproc::resize(
        frame,
        &mut resized,
        Size::new(size, size),
        0.0,
        0.0,
        imgproc::INTER_LINEAR,
    )
    .context("帧缩放失败")?;

    let mut rgb = Mat::default();
    imgproc::cvt_color(
        &resized,
        &mut rgb,
        imgproc::COLOR_BGR2RGB,
        0,
        core::AlgorithmHint::ALGO_HINT_DEFAULT,
    )
    .context("颜色空间转换失败")?;

    let raw = rgb.data_bytes().context("读取帧数据失败")?;
    let area = (size * size) as usize;
    if raw.len() < area * 3 {
        bail!("帧数据长度异常: {} < {}", raw.len(), area * 3);
    }

    let mut tensor_data = vec![0f32; 3 * area];
    for idx in 0..area {
        tensor_data[idx] = raw[idx * 3] as f32 / 255.0;
        tensor_data[area + idx] = raw[idx * 3 + 1] as f32 / 255.0;
        tensor_data[2 * area + idx] = raw[idx * 3 + 2] as f32 / 255.0;
    }

    let shape = [1usize, 3, size as usize, size as usize];
    Ok(Tensor::from_array((shape, tensor_data.into_boxed_slice()))
        .context("构建输入张量失败")?
        .into_dyn())
}

/// 解码YOLOv8输出 [1, 4+nc, N] (列主序): 取各候选的最高类别分,
/// 低于置信度阈值的剔除, 坐标缩放回原始帧
fn decode_predictions(
    shape: &[i64],
    data: &[f32],
    conf_threshold: f32,
    input_size: f32,
    frame_w: f32,
    frame_h: f32,
) -> Result<Vec<BBox>> {
    if shape.len() != 3 || shape[1] < 5 {
        bail!("输出张量维度异常: {:?}", shape);
    }
    let attrs = shape[1] as usize;
    let proposals = shape[2] as usize;
    if data.len() < attrs * proposals {
        bail!("输出张量长度异常: {} < {}", data.len(), attrs * proposals);
    }

    let scale_x = frame_w / input_size;
    let scale_y = frame_h / input_size;

    let mut bboxes = Vec::new();
    for i in 0..proposals {
        // 数据布局: [cx, cy, w, h, cls0, cls1, ...] 按行展开
        let cx = data[i];
        let cy = data[proposals + i];
        let w = data[2 * proposals + i];
        let h = data[3 * proposals + i];

        let mut best = 0f32;
        for c in 4..attrs {
            let score = data[c * proposals + i];
            if score > best {
                best = score;
            }
        }
        if best < conf_threshold {
            continue;
        }

        // (cx,cy,w,h) 推理尺度 → (x1,y1,x2,y2) 原始帧尺度
        let x1 = ((cx - w / 2.0) * scale_x).max(0.0);
        let y1 = ((cy - h / 2.0) * scale_y).max(0.0);
        let x2 = ((cx + w / 2.0) * scale_x).min(frame_w);
        let y2 = ((cy + h / 2.0) * scale_y).min(frame_h);

        let bbox = BBox::new(x1, y1, x2, y2, best);
        if bbox.is_valid() {
            bboxes.push(bbox);
        }
    }
    Ok(bboxes)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_validate_rejects_missing_file() {
        let result = OnnxDetector::validate(Path::new("/no/such/model.onnx"));
        assert!(matches!(result, Err(PipelineError::ModelLoad(_))));
    }

    #[test]
    fn test_validate_rejects_unknown_extension() {
        let path = std::env::temp_dir().join("countline-test-model.pt");
        std::fs::write(&path, b"x").unwrap();
        let result = OnnxDetector::validate(&path);
        let _ = std::fs::remove_file(&path);
        assert!(matches!(result, Err(PipelineError::ModelLoad(_))));
    }

    #[test]
    fn test_decode_filters_by_confidence_and_scales() {
        // 两个候选: 一个高分, 一个低分; attrs=6 (4坐标+2类别), proposals=2
        let shape = [1i64, 6, 2];
        // 列主序: 每行 proposals 个值
        let data = [
            320.0, 100.0, // cx
            320.0, 100.0, // cy
            64.0, 10.0, // w
            64.0, 10.0, // h
            0.9, 0.1, // cls0
            0.3, 0.05, // cls1
        ];
        let boxes = decode_predictions(&shape, &data, 0.5, 640.0, 1280.0, 720.0).unwrap();
        assert_eq!(boxes.len(), 1);
        let b = &boxes[0];
        // cx=320 (推理尺度) → x中心=640 (原始帧), w=64 → 128
        assert!((b.center().0 - 640.0).abs() < 1e-3);
        assert!((b.width() - 128.0).abs() < 1e-3);
        assert!((b.confidence - 0.9).abs() < 1e-6);
    }

    #[test]
    fn test_decode_rejects_bad_shape() {
        assert!(decode_predictions(&[1, 2], &[0.0; 4], 0.5, 640.0, 640.0, 640.0).is_err());
    }
}
