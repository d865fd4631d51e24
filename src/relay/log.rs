//! 中继调试日志出口

use std::fmt;
use std::sync::Arc;
use serde::{Deserialize, Serialize};

/// 调试日志接收端
pub trait LogSink: Send + Sync {
    fn debug(&self, args: fmt::Arguments<'_>);
}

/// 转发到 tracing 的日志接收端
#[derive(Debug, Clone, Copy, Default)]
pub struct TracingSink;

impl LogSink for TracingSink {
    fn debug(&self, args: fmt::Arguments<'_>) {
        tracing::debug!(target: "netrelay::relay", "{}", args);
    }
}

/// 丢弃所有日志
#[derive(Debug, Clone, Copy, Default)]
pub struct NoopSink;

impl LogSink for NoopSink {
    fn debug(&self, _args: fmt::Arguments<'_>) {}
}

/// 中继调试级别
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DebugLevel {
    /// 不输出
    #[default]
    Off,
    /// 仅输出空闲超时等关键事件
    Basic,
    /// 额外输出关闭握手的每一步
    Verbose,
}

/// 按级别过滤后写入日志接收端
#[derive(Clone)]
pub(crate) struct Reporter {
    sink: Arc<dyn LogSink>,
    level: DebugLevel,
}

impl Reporter {
    pub(crate) fn new(sink: Arc<dyn LogSink>, level: DebugLevel) -> Self {
        Self { sink, level }
    }

    pub(crate) fn basic(&self, args: fmt::Arguments<'_>) {
        if self.level >= DebugLevel::Basic {
            self.sink.debug(args);
        }
    }

    pub(crate) fn verbose(&self, args: fmt::Arguments<'_>) {
        if self.level >= DebugLevel::Verbose {
            self.sink.debug(args);
        }
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use parking_lot::Mutex;

    /// 记录所有消息的日志接收端
    #[derive(Default)]
    pub(crate) struct RecordingSink {
        pub(crate) messages: Mutex<Vec<String>>,
    }

    impl LogSink for RecordingSink {
        fn debug(&self, args: fmt::Arguments<'_>) {
            self.messages.lock().push(args.to_string());
        }
    }

    #[test]
    fn test_reporter_filters_by_level() {
        let sink = Arc::new(RecordingSink::default());
        let reporter = Reporter::new(sink.clone(), DebugLevel::Basic);
        reporter.basic(format_args!("idle {}", 1));
        reporter.verbose(format_args!("swapped"));
        assert_eq!(*sink.messages.lock(), vec!["idle 1".to_string()]);

        let silent = Reporter::new(sink.clone(), DebugLevel::Off);
        silent.basic(format_args!("ignored"));
        assert_eq!(sink.messages.lock().len(), 1);
    }
}
