//! 公共组件
//! 错误类型与统计

pub mod error;
pub mod stats;
