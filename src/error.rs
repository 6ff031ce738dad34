//! 错误类型
//!
//! 组件内部的失败一律在边界处转成日志 + 计数器，
//! 只有以下几类会返回给调用方。

/// 会话引擎对外暴露的错误
#[derive(Debug, thiserror::Error)]
pub enum PacingError {
    /// 配置非法 (区间颠倒、间隔为 0、重复的单元 ID 等)
    #[error("配置非法: {0}")]
    InvalidConfig(String),

    /// 无法获取会话句柄 (致命)
    #[error("获取会话句柄失败: {0}")]
    Acquire(String),

    /// 配置文件读取/解析失败
    #[error("配置文件错误: {0}")]
    Config(String),

    /// 已有会话在运行
    #[error("会话已在运行")]
    AlreadyRunning,
}

pub type Result<T> = std::result::Result<T, PacingError>;
