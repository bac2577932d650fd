//! 日志初始化
//!
//! 基于 `tracing` + `tracing-subscriber`。标准输出是协议通道，
//! 所以日志一律写到标准错误。

use tracing_subscriber::EnvFilter;

use crate::config::LoggingConfig;

/// 初始化日志系统
///
/// 日志级别优先取 `RUST_LOG` 环境变量，否则使用配置中的级别。
/// 重复调用是安全的：已经安装过订阅者时直接忽略。
pub fn initialize_logging(config: &LoggingConfig) {
    if !config.log_to_console {
        return;
    }

    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(config.level.as_filter()));

    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .with_target(true)
        .try_init();

    tracing::info!(target: "bridge", "Engine bridge logging initialized");
}
