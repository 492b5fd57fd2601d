//! 过线计数器 (Boundary-crossing counter)
//!
//! 系统架构:
//! 1. 工作线程: 采集 → 检测/追踪 → 过线计数 (countline_rs::worker)
//! 2. 主线程:   控制面 + 结果渲染 (highgui窗口或无头模式)

use std::time::Duration;

use clap::Parser;
use crossbeam_channel::RecvTimeoutError;
use opencv::highgui;

use countline_rs::{
    available_cameras, gen_time_string, CountingPipeline, Event, PipelineConfig, PipelineState,
    Source,
};

#[global_allocator]
static GLOBAL: mimalloc::MiMalloc = mimalloc::MiMalloc;

/// 过线计数器参数
#[derive(Parser, Debug)]
#[command(author, version, about = "过线计数器 - 视觉过线计数流水线", long_about = None)]
struct Args {
    /// 检测模型路径 (.onnx / .ort)
    #[arg(short, long, default_value = "models/yolov8n.onnx")]
    model: String,

    /// 输入源: 摄像头索引(如 0)或视频文件路径
    #[arg(short, long, default_value = "0")]
    source: String,

    /// 配置文件路径 (JSON, 不存在时创建默认配置)
    #[arg(short, long, default_value = "countline.json")]
    config: String,

    /// 仅列出可用摄像头后退出
    #[arg(long, default_value_t = false)]
    list_cameras: bool,

    /// 无头模式 (不显示窗口)
    #[arg(long, default_value_t = false)]
    headless: bool,
}

fn parse_source(raw: &str) -> Source {
    match raw.parse::<i32>() {
        Ok(index) => Source::Camera(index),
        Err(_) => Source::File(raw.into()),
    }
}

/// 处理窗口按键; 返回是否退出
fn handle_key(pipeline: &CountingPipeline, key: i32) -> bool {
    match key {
        27 | 113 => return true, // ESC / q 退出
        32 => {
            // 空格: 暂停/恢复
            if pipeline.state() == PipelineState::Paused {
                pipeline.resume();
                println!("▶️  恢复");
            } else {
                pipeline.pause();
                println!("⏸️  暂停");
            }
        }
        114 => {
            // r: 计数清零
            pipeline.reset_counters();
            println!("🔄 计数已清零");
        }
        _ => {}
    }
    false
}

fn main() -> anyhow::Result<()> {
    let args = Args::parse();
    println!("🚀 过线计数器启动 ({})", gen_time_string("-"));

    if args.list_cameras {
        for (index, info) in available_cameras() {
            println!("   [{}] {}x{} @ {:.0}fps", index, info.width, info.height, info.fps);
        }
        return Ok(());
    }

    let config = PipelineConfig::load(&args.config);
    config.print_summary();

    // ========== 启动流水线 ==========
    let (pipeline, events) = CountingPipeline::spawn_with_config(config);
    pipeline.load_model(&args.model)?;
    let height = pipeline.set_source(parse_source(&args.source))?;
    println!("📐 输入帧高度: {}", height);
    pipeline.start()?;

    // ========== 结果渲染循环 ==========
    let window = "countline";
    let mut display = !args.headless;
    if display {
        if let Err(e) = highgui::named_window(window, highgui::WINDOW_AUTOSIZE) {
            eprintln!("⚠️  无法创建显示窗口: {}, 切换为无头模式", e);
            display = false;
        }
    }

    let mut frames: u64 = 0;
    loop {
        match events.recv_timeout(Duration::from_millis(100)) {
            Ok(Event::Frame {
                image,
                cumulative,
                frame_count,
                latency_ms,
            }) => {
                frames += 1;
                if frames % 60 == 0 {
                    println!(
                        "📊 累计: {} | 本帧: +{} | {:.1}ms",
                        cumulative, frame_count, latency_ms
                    );
                }
                if display {
                    highgui::imshow(window, &image)?;
                    if handle_key(&pipeline, highgui::wait_key(1)?) {
                        break;
                    }
                }
            }
            Ok(Event::ModelLoaded(true)) => println!("✅ 模型加载成功"),
            Ok(Event::ModelLoaded(false)) => eprintln!("❌ 模型加载失败"),
            Ok(Event::LoopRestarted) => println!("🔁 文件播放完毕, 回到第一帧"),
            Ok(Event::Error(message)) => eprintln!("⚠️  {}", message),
            Err(RecvTimeoutError::Timeout) => {
                // 暂停等无帧状态下仍要轮询按键
                if display && handle_key(&pipeline, highgui::wait_key(1)?) {
                    break;
                }
            }
            Err(RecvTimeoutError::Disconnected) => break,
        }
    }

    pipeline.stop();
    println!("👋 累计计数: {}, 退出", pipeline.cumulative_count());
    Ok(())
}
