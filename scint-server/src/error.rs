// 闪烁监测服务器 - 错误类型定义
//
// 启动/停止/状态查询使用 ServerError，数据流端点使用 StreamError，
// 闪烁计算器使用 ScintError。运行循环内部的错误只记录日志，不向外传播。

use std::io;
use thiserror::Error;

/// 服务器生命周期错误
#[derive(Error, Debug)]
pub enum ServerError {
    #[error("server already started")]
    AlreadyRunning,

    #[error("server not running")]
    NotRunning,

    #[error("server still running")]
    StillRunning,

    /// 缓冲区或状态对象分配失败
    #[error("buffer allocation error: {what} ({bytes} bytes)")]
    Allocation { what: String, bytes: usize },

    /// 数据流打开失败，index 为 0 起始的流序号，消息中按 1 起始显示
    #[error("str{} open error path={path}: {reason}", .index + 1)]
    StreamOpen {
        index: usize,
        path: String,
        reason: String,
    },

    #[error("thread create error: {0}")]
    ThreadCreate(String),

    #[error("scintillation calculator init failed: {0}")]
    CalculatorInit(#[from] ScintError),

    #[error("decoder init failed for stream {index}: {reason}")]
    DecoderInit { index: usize, reason: String },

    #[error("invalid stream index: {0}")]
    InvalidStreamIndex(usize),

    #[error("stream {0} already open")]
    StreamBusy(usize),

    #[error("invalid configuration: {0}")]
    InvalidConfig(String),
}

/// 数据流端点错误
#[derive(Error, Debug)]
pub enum StreamError {
    #[error("IO error: {0}")]
    Io(#[from] io::Error),

    #[error("invalid stream path: {0}")]
    InvalidPath(String),

    #[error("stream type {0} cannot be opened in this mode")]
    Unsupported(String),

    #[error("stream already open")]
    Busy,
}

/// 闪烁计算错误
#[derive(Error, Debug)]
pub enum ScintError {
    #[error("insufficient data: {0}")]
    InsufficientData(String),

    #[error("invalid scintillation options: {0}")]
    InvalidOptions(String),

    #[error("result log error: {0}")]
    Log(#[from] io::Error),
}

pub type Result<T> = std::result::Result<T, ServerError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_stream_open_message_is_one_based() {
        let err = ServerError::StreamOpen {
            index: 4,
            path: "sol2.pos".to_string(),
            reason: "permission denied".to_string(),
        };
        assert_eq!(
            err.to_string(),
            "str5 open error path=sol2.pos: permission denied"
        );
    }

    #[test]
    fn test_calculator_error_converts() {
        let err: ServerError = ScintError::InvalidOptions("window must be positive".into()).into();
        assert!(matches!(err, ServerError::CalculatorInit(_)));
        assert!(err.to_string().contains("window must be positive"));
    }
}
