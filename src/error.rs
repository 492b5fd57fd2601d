//! 流水线错误分类
//!
//! 资源获取类错误只使当次调用失败, 工作器保持原状态;
//! 单帧错误仅上报, 处理循环继续运行。

use thiserror::Error;

#[derive(Debug, Error)]
pub enum PipelineError {
    /// 摄像头索引不在探测集合中, 或文件路径/扩展名非法
    #[error("非法输入源: {0}")]
    InvalidSource(String),

    /// 底层采集句柄打开失败
    #[error("设备打开失败: {0}")]
    DeviceOpenFailed(String),

    /// 模型文件缺失、扩展名不支持或推理后端加载失败
    #[error("模型加载失败: {0}")]
    ModelLoad(String),

    /// start() 时模型或输入源未就绪
    #[error("流水线未就绪: {0}")]
    NotReady(&'static str),

    /// 单帧解码或推理失败 (不终止处理循环)
    #[error("帧处理失败: {0}")]
    Frame(String),
}
