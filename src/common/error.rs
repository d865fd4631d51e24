//! 错误处理模块
//! 定义统一错误类型与 IO 错误分类

use std::io::{self, Error as IoError, ErrorKind};
use std::time::Duration;
use thiserror::Error;
use config::ConfigError;

/// 全局错误类型
#[derive(Debug, Error)]
pub enum NetRelayError {
    /// 配置错误
    #[error("配置错误: {0}")]
    Config(#[from] ConfigError),

    /// 服务器错误
    #[error("服务器错误: {0}")]
    Server(#[from] ServerError),

    /// IO错误
    #[error("IO错误: {0}")]
    Io(#[from] IoError),
}

/// 服务器错误
#[derive(Debug, Error)]
pub enum ServerError {
    /// 绑定端口失败
    #[error("绑定地址 {addr} 失败: {source}")]
    Bind {
        addr: String,
        #[source]
        source: IoError,
    },

    /// 连接上游失败
    #[error("连接上游 {addr} 失败: {source}")]
    Connect {
        addr: String,
        #[source]
        source: IoError,
    },

    /// 连接上游超时
    #[error("连接上游 {0} 超时")]
    ConnectTimeout(String),
}

/// 中继错误，描述单次中继或单条连接的终止原因
#[derive(Debug, Error)]
pub enum RelayError {
    /// 写入返回的字节数少于请求且没有附带错误
    #[error("短写: 写入字节数少于请求")]
    ShortWrite,

    /// 写入返回了越界的字节数
    #[error("无效的写入结果")]
    InvalidWrite,

    /// 连接累计传输量超出字节上限
    #[error("连接字节上限已耗尽")]
    CapExceeded,

    /// 双向均无数据传输，空闲超时
    #[error("空闲超时: {0:?} 内无数据传输")]
    IdleTimeout(Duration),

    /// 外部取消信号触发
    #[error("中继已取消")]
    Cancelled,

    /// 复制任务未上报结果即退出（任务 panic）
    #[error("复制任务异常退出")]
    CopyAborted,

    /// 底层IO错误，原样透传
    #[error("IO错误: {0}")]
    Io(#[from] IoError),
}

impl RelayError {
    /// 是否属于超时类错误
    pub fn is_timeout(&self) -> bool {
        match self {
            RelayError::IdleTimeout(_) => true,
            RelayError::Io(err) => is_timeout(err),
            _ => false,
        }
    }
}

/// 中继失败结果，同时保留已传输的字节数
#[derive(Debug, Error)]
#[error("中继在传输 {transferred} 字节后失败: {error}")]
pub struct RelayFailure {
    transferred: u64,
    #[source]
    error: RelayError,
}

impl RelayFailure {
    pub(crate) fn new(transferred: u64, error: RelayError) -> Self {
        Self { transferred, error }
    }

    /// 终止前双向成功写出的字节总数
    pub fn transferred(&self) -> u64 {
        self.transferred
    }

    /// 终止原因
    pub fn error(&self) -> &RelayError {
        &self.error
    }

    pub fn into_error(self) -> RelayError {
        self.error
    }

    /// 是否属于超时类错误
    pub fn is_timeout(&self) -> bool {
        self.error.is_timeout()
    }
}

/// 截止时间到期产生的错误
pub(crate) fn deadline_exceeded() -> IoError {
    IoError::new(ErrorKind::TimedOut, "deadline exceeded")
}

/// 在已关闭的流上操作产生的错误
pub(crate) fn stream_closed() -> IoError {
    IoError::new(ErrorKind::NotConnected, "use of closed stream")
}

/// 字节上限耗尽，归类为流结束
pub(crate) fn cap_exceeded() -> IoError {
    IoError::new(ErrorKind::UnexpectedEof, RelayError::CapExceeded)
}

/// 判断 IO 错误是否由截止时间到期引起
pub fn is_timeout(err: &io::Error) -> bool {
    err.kind() == ErrorKind::TimedOut
}

/// 判断 IO 错误是否表示流结束（字节上限耗尽）
pub fn is_end_of_stream(err: &io::Error) -> bool {
    err.kind() == ErrorKind::UnexpectedEof
        && err
            .get_ref()
            .and_then(|inner| inner.downcast_ref::<RelayError>())
            .map_or(false, |inner| matches!(inner, RelayError::CapExceeded))
}

/// 简化错误类型定义
pub type Result<T> = std::result::Result<T, NetRelayError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cap_exceeded_is_end_of_stream() {
        let err = cap_exceeded();
        assert!(is_end_of_stream(&err));
        assert!(!is_timeout(&err));

        let plain = IoError::new(ErrorKind::UnexpectedEof, "early eof");
        assert!(!is_end_of_stream(&plain));
    }

    #[test]
    fn test_timeout_classification() {
        assert!(RelayError::Io(deadline_exceeded()).is_timeout());
        assert!(RelayError::IdleTimeout(Duration::from_secs(1)).is_timeout());
        assert!(!RelayError::Cancelled.is_timeout());
        assert!(!RelayError::Io(stream_closed()).is_timeout());

        let failure = RelayFailure::new(7, RelayError::IdleTimeout(Duration::from_secs(2)));
        assert!(failure.is_timeout());
        assert_eq!(failure.transferred(), 7);
    }
}
