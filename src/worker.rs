//! 计数流水线工作器 (Counting pipeline worker)
//!
//! 持续运行的处理循环: 独占采集/推理/计数资源,
//! 向控制方暴露线程安全的控制面, 每帧发布处理结果。
//!
//! 并发模型:
//! - 状态+配置共用一把互斥锁 (控制块), 循环每帧整体快照一次配置
//! - 非Running状态下循环挂起在条件变量上, start()/resume() 唤醒单个等待者
//! - 采集句柄与检测器各自独立互斥; 全局加锁顺序: 控制块 → 采集 → 检测器 → 会话
//! - stop(): 在途帧先完成, 再在资源锁内确定性释放句柄与检测器

use std::collections::BTreeMap;
use std::path::PathBuf;
use std::sync::{Arc, Condvar, Mutex};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use crossbeam_channel::{bounded, Receiver, Sender};
use opencv::core::Mat;

use crate::config::PipelineConfig;
use crate::counting::{self, CountingEngine, CountingSession};
use crate::detection::{Detector, OnnxDetector};
use crate::device::{self, Device};
use crate::error::PipelineError;
use crate::source::{self, CameraInfo, ReadOutcome, Source, SourceManager};

/// 事件通道容量 (发布只做一次入队, 决不长时间阻塞循环)
const EVENT_CAPACITY: usize = 8;

/// 摄像头连续读取失败上限, 超过后进入 Error 状态等待控制方处理
const CAMERA_FAILURE_LIMIT: u32 = 120;

/// 流水线状态机 (工作器独占所有权, 控制方只能请求迁移)
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PipelineState {
    Idle,
    Ready,
    Running,
    Paused,
    Stopping,
    Error,
}

/// 发布给控制方的通知
pub enum Event {
    /// 单帧处理完成: 叠加后的图像 + 累计计数 + 单帧计数 + 处理耗时
    Frame {
        image: Mat,
        cumulative: u64,
        frame_count: u32,
        latency_ms: f64,
    },
    /// 模型加载结果
    ModelLoaded(bool),
    /// 可恢复错误 (人类可读消息)
    Error(String),
    /// 文件源播放完毕, 已回卷到第一帧
    LoopRestarted,
}

/// 控制块: 状态 + 配置, 同一把锁保护以保证配置快照不被撕裂
struct ControlBlock {
    state: PipelineState,
    config: PipelineConfig,
    shutdown: bool,
}

struct Shared {
    control: Mutex<ControlBlock>,
    wakeup: Condvar,
    source: Mutex<SourceManager>,
    detector: Mutex<Option<Box<dyn Detector>>>,
    session: Mutex<CountingSession>,
    events: Sender<Event>,
}

/// 计数流水线
///
/// 构造时探测一次计算后端并启动工作线程;
/// 所有控制方法线程安全, 可在任意线程调用。
pub struct CountingPipeline {
    shared: Arc<Shared>,
    device: Device,
    worker: Option<JoinHandle<()>>,
}

impl CountingPipeline {
    pub fn spawn() -> (Self, Receiver<Event>) {
        Self::spawn_with_config(PipelineConfig::default())
    }

    pub fn spawn_with_config(config: PipelineConfig) -> (Self, Receiver<Event>) {
        let (tx, rx) = bounded(EVENT_CAPACITY);
        let device = device::select_device();
        let shared = Arc::new(Shared {
            control: Mutex::new(ControlBlock {
                state: PipelineState::Idle,
                config,
                shutdown: false,
            }),
            wakeup: Condvar::new(),
            source: Mutex::new(SourceManager::new()),
            detector: Mutex::new(None),
            session: Mutex::new(CountingSession::default()),
            events: tx,
        });

        let worker = thread::spawn({
            let shared = shared.clone();
            move || run_loop(shared)
        });

        (
            Self {
                shared,
                device,
                worker: Some(worker),
            },
            rx,
        )
    }

    pub fn state(&self) -> PipelineState {
        self.shared.control.lock().unwrap().state
    }

    /// 当前配置快照
    pub fn config(&self) -> PipelineConfig {
        self.shared.control.lock().unwrap().config.clone()
    }

    pub fn device(&self) -> Device {
        self.device
    }

    /// 可用摄像头列表 (启动后首次调用时探测一次)
    pub fn available_cameras(&self) -> &'static BTreeMap<i32, CameraInfo> {
        source::available_cameras()
    }

    /// 加载检测模型
    ///
    /// 预加载清理: 旧检测器先释放 (加速器上下文确定性回收), 再构建新会话。
    /// 失败时模型保持未加载, 流水线状态不变。
    pub fn load_model(&self, path: impl Into<PathBuf>) -> Result<(), PipelineError> {
        let path = path.into();
        {
            let mut slot = self.shared.detector.lock().unwrap();
            slot.take();
        }

        match OnnxDetector::load(&path, self.device) {
            Ok(detector) => {
                *self.shared.detector.lock().unwrap() = Some(Box::new(detector));
                let _ = self.shared.events.try_send(Event::ModelLoaded(true));
                Ok(())
            }
            Err(e) => {
                eprintln!("❌ {}", e);
                let _ = self.shared.events.try_send(Event::ModelLoaded(false));
                Err(e)
            }
        }
    }

    /// 打开输入源并重置计数会话
    ///
    /// 校验失败 (InvalidSource) 时已打开的旧源保持不变;
    /// 任何失败都不改变流水线状态。成功返回帧高度并迁移到 Ready。
    pub fn set_source(&self, new_source: Source) -> Result<i32, PipelineError> {
        SourceManager::validate(&new_source)?;

        let height = {
            let mut manager = self.shared.source.lock().unwrap();
            manager.open(new_source)?
        };

        {
            let mut session = self.shared.session.lock().unwrap();
            *session = CountingSession::new(height);
        }
        {
            let mut control = self.shared.control.lock().unwrap();
            if matches!(control.state, PipelineState::Idle | PipelineState::Error) {
                control.state = PipelineState::Ready;
            }
        }
        Ok(height)
    }

    /// 启动处理循环; 模型与输入源缺一不可
    pub fn start(&self) -> Result<(), PipelineError> {
        if self.shared.detector.lock().unwrap().is_none() {
            return Err(PipelineError::NotReady("模型未加载"));
        }
        if !self.shared.source.lock().unwrap().is_open() {
            return Err(PipelineError::NotReady("输入源未打开"));
        }

        let mut control = self.shared.control.lock().unwrap();
        control.state = PipelineState::Running;
        // 精确唤醒单个等待者 (工作线程)
        self.shared.wakeup.notify_one();
        Ok(())
    }

    /// 暂停: 资源保持打开, 循环停止消费帧
    pub fn pause(&self) {
        let mut control = self.shared.control.lock().unwrap();
        if control.state == PipelineState::Running {
            control.state = PipelineState::Paused;
        }
    }

    pub fn resume(&self) {
        let mut control = self.shared.control.lock().unwrap();
        if control.state == PipelineState::Paused {
            control.state = PipelineState::Running;
            self.shared.wakeup.notify_one();
        }
    }

    /// 停止循环并释放资源; 幂等, 重复调用安全
    pub fn stop(&self) {
        {
            let mut control = self.shared.control.lock().unwrap();
            control.state = PipelineState::Stopping;
            self.shared.wakeup.notify_one();
        }

        // 在途帧完成前, 资源锁由循环持有, 此处等待即实现
        // "先完成当前帧, 再观察停止标志" 的取消语义
        {
            let mut manager = self.shared.source.lock().unwrap();
            manager.close();
        }
        {
            let mut slot = self.shared.detector.lock().unwrap();
            slot.take();
        }

        let mut control = self.shared.control.lock().unwrap();
        control.state = PipelineState::Idle;
    }

    /// 任意状态下清空计数会话
    pub fn reset_counters(&self) {
        self.shared.session.lock().unwrap().reset();
    }

    /// 热更新单个参数
    ///
    /// 在控制块锁内原子应用, 下一帧的配置快照立即可见;
    /// 未识别的键被忽略 (容忍前向兼容的调用方), 不算错误。
    pub fn update_parameter(&self, name: &str, value: &serde_json::Value) {
        let mut control = self.shared.control.lock().unwrap();
        if !control.config.apply(name, value) {
            println!("⚠️  忽略未识别参数: {} = {}", name, value);
        }
    }

    /// 累计计数快照
    pub fn cumulative_count(&self) -> u64 {
        self.shared.session.lock().unwrap().cumulative
    }
}

impl Drop for CountingPipeline {
    fn drop(&mut self) {
        if let Ok(mut control) = self.shared.control.lock() {
            control.shutdown = true;
            control.state = PipelineState::Stopping;
        }
        self.shared.wakeup.notify_one();
        if let Some(handle) = self.worker.take() {
            let _ = handle.join();
        }
        // 兜底释放 (工作线程已退出, 锁必然可得)
        if let Ok(mut manager) = self.shared.source.lock() {
            manager.close();
        }
        if let Ok(mut slot) = self.shared.detector.lock() {
            slot.take();
        }
    }
}

// ========== 工作线程主循环 ==========

fn run_loop(shared: Arc<Shared>) {
    println!("✅ 计数工作线程启动");
    let mut frame = Mat::default();
    let mut consecutive_camera_failures: u32 = 0;
    let mut processed: u64 = 0;

    loop {
        // 1. 等待Running状态 (空闲时挂起在条件变量上, 不忙等)
        let config = {
            let mut control = shared.control.lock().unwrap();
            loop {
                if control.shutdown {
                    println!("✅ 计数工作线程退出");
                    return;
                }
                if control.state == PipelineState::Running {
                    break;
                }
                control = shared.wakeup.wait(control).unwrap();
            }
            // 每帧整体快照一次配置, 逻辑相关的字段不会被撕裂读取
            control.config.clone()
        };

        let started = Instant::now();

        // 2. 读取一帧 (有界阻塞)
        let (outcome, is_file) = {
            let mut manager = shared.source.lock().unwrap();
            (manager.read_frame(&mut frame), manager.is_file())
        };

        match outcome {
            Ok(ReadOutcome::Frame) => {
                consecutive_camera_failures = 0;
            }
            Ok(ReadOutcome::EndOfStream) => {
                // stop() 竞争窗口: 状态已离开 Running 时静默跳过
                if shared.control.lock().unwrap().state != PipelineState::Running {
                    continue;
                }
                if is_file {
                    // 文件源: 回卷到第一帧循环播放
                    let rewound = { shared.source.lock().unwrap().rewind() };
                    match rewound {
                        Ok(()) => {
                            let _ = shared.events.try_send(Event::LoopRestarted);
                        }
                        Err(e) => report_frame_error(&shared, &e.to_string()),
                    }
                } else {
                    // 摄像头不应出现流结束, 视为单帧失败并继续;
                    // 长时间失联才升级为 Error 状态
                    consecutive_camera_failures += 1;
                    if consecutive_camera_failures >= CAMERA_FAILURE_LIMIT {
                        eprintln!(
                            "❌ 摄像头连续 {} 次读取失败, 进入错误状态",
                            consecutive_camera_failures
                        );
                        consecutive_camera_failures = 0;
                        shared.control.lock().unwrap().state = PipelineState::Error;
                        let _ = shared
                            .events
                            .try_send(Event::Error("摄像头失联, 流水线已挂起".to_string()));
                    } else {
                        report_frame_error(&shared, "摄像头读取空帧");
                        thread::sleep(Duration::from_millis(20));
                    }
                }
                continue;
            }
            Err(e) => {
                // stop() 竞争窗口: 状态已离开 Running 时静默跳过
                if shared.control.lock().unwrap().state != PipelineState::Running {
                    continue;
                }
                report_frame_error(&shared, &e.to_string());
                thread::sleep(Duration::from_millis(50));
                continue;
            }
        }

        // 3. 推理 (检测器已被 stop() 释放时静默跳过)
        let inferred = {
            let mut slot = shared.detector.lock().unwrap();
            slot.as_mut().map(|det| det.infer(&frame, &config))
        };
        let detections = match inferred {
            None => continue,
            Some(Err(e)) => {
                report_frame_error(&shared, &format!("推理失败: {:#}", e));
                continue;
            }
            Some(Ok(detections)) => detections,
        };

        // 4. 计数
        let summary = {
            let mut session = shared.session.lock().unwrap();
            CountingEngine::update(&mut session, &detections, &config)
        };

        // 5. 叠加绘制 + 发布
        let mut annotated = frame.clone();
        let latency_ms = started.elapsed().as_secs_f64() * 1000.0;
        if let Err(e) = counting::annotate(&mut annotated, &summary, latency_ms) {
            eprintln!("⚠️  叠加绘制失败: {}", e);
        }

        // try_send: 控制方消费慢时丢弃本帧通知, 循环决不阻塞
        let _ = shared.events.try_send(Event::Frame {
            image: annotated,
            cumulative: summary.cumulative,
            frame_count: summary.frame_count,
            latency_ms,
        });

        processed += 1;
        if processed % 120 == 0 {
            println!(
                "📊 已处理 {} 帧 | 累计计数: {} | 本帧耗时 {:.1}ms",
                processed, summary.cumulative, latency_ms
            );
        }
    }
}

/// 报告可恢复的单帧错误 (循环继续运行)
fn report_frame_error(shared: &Shared, message: &str) {
    eprintln!("⚠️  {}", message);
    let _ = shared
        .events
        .try_send(Event::Error(PipelineError::Frame(message.to_string()).to_string()));
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_initial_state_is_idle() {
        let (pipeline, _events) = CountingPipeline::spawn();
        assert_eq!(pipeline.state(), PipelineState::Idle);
    }

    #[test]
    fn test_start_without_model_fails_not_ready() {
        let (pipeline, _events) = CountingPipeline::spawn();
        assert!(matches!(
            pipeline.start(),
            Err(PipelineError::NotReady(_))
        ));
        assert_eq!(pipeline.state(), PipelineState::Idle);
    }

    #[test]
    fn test_load_model_invalid_path_publishes_failure() {
        let (pipeline, events) = CountingPipeline::spawn();
        let result = pipeline.load_model("/no/such/model.onnx");
        assert!(matches!(result, Err(PipelineError::ModelLoad(_))));
        assert_eq!(pipeline.state(), PipelineState::Idle);

        match events.recv_timeout(Duration::from_secs(1)) {
            Ok(Event::ModelLoaded(ok)) => assert!(!ok),
            other => panic!("期望 ModelLoaded(false), 实际 {:?}", other.is_ok()),
        }
    }

    #[test]
    fn test_set_source_invalid_camera_index() {
        let (pipeline, _events) = CountingPipeline::spawn();
        let result = pipeline.set_source(Source::Camera(9999));
        assert!(matches!(result, Err(PipelineError::InvalidSource(_))));
        assert_eq!(pipeline.state(), PipelineState::Idle);
    }

    #[test]
    fn test_update_parameter_visible_in_next_snapshot() {
        let (pipeline, _events) = CountingPipeline::spawn();
        pipeline.update_parameter("model_conf", &serde_json::json!(0.8));
        assert_eq!(pipeline.config().model_conf, 0.8);
    }

    #[test]
    fn test_update_parameter_unknown_key_ignored() {
        let (pipeline, _events) = CountingPipeline::spawn();
        let before = pipeline.config();
        pipeline.update_parameter("future_knob", &serde_json::json!(1.0));
        assert_eq!(pipeline.config(), before);
    }

    #[test]
    fn test_snapshot_never_torn_under_concurrent_writes() {
        // 两个字段总是成对写成相同值; 任何快照中二者必须相等
        let (pipeline, _events) = CountingPipeline::spawn();
        let pipeline = Arc::new(pipeline);

        let writer = {
            let pipeline = pipeline.clone();
            thread::spawn(move || {
                for i in 0..500u32 {
                    let v = (i % 7) as f64 / 10.0;
                    let mut control = pipeline.shared.control.lock().unwrap();
                    control.config.model_conf = v as f32;
                    control.config.model_nms = v as f32;
                }
            })
        };

        for _ in 0..500 {
            let snapshot = pipeline.config();
            assert_eq!(snapshot.model_conf, snapshot.model_nms);
        }
        writer.join().unwrap();
    }

    #[test]
    fn test_stop_is_idempotent() {
        let (pipeline, _events) = CountingPipeline::spawn();
        pipeline.stop();
        assert_eq!(pipeline.state(), PipelineState::Idle);
        pipeline.stop();
        assert_eq!(pipeline.state(), PipelineState::Idle);
    }

    #[test]
    fn test_reset_counters_safe_in_any_state() {
        let (pipeline, _events) = CountingPipeline::spawn();
        pipeline.reset_counters();
        assert_eq!(pipeline.cumulative_count(), 0);
        pipeline.stop();
        pipeline.reset_counters();
        assert_eq!(pipeline.cumulative_count(), 0);
    }

    #[test]
    fn test_pause_without_running_is_noop() {
        let (pipeline, _events) = CountingPipeline::spawn();
        pipeline.pause();
        assert_eq!(pipeline.state(), PipelineState::Idle);
        pipeline.resume();
        assert_eq!(pipeline.state(), PipelineState::Idle);
    }

    #[test]
    fn test_drop_joins_worker() {
        let (pipeline, _events) = CountingPipeline::spawn();
        drop(pipeline); // 不应悬挂
    }
}
