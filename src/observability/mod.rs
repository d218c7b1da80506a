//! 可观测性：tracing 订阅者（RUST_LOG 覆盖默认 info）

use tracing_subscriber::{fmt, prelude::*, EnvFilter};

/// 安装全局订阅者；重复调用（如测试中）静默忽略
pub fn init() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let _ = tracing_subscriber::registry()
        .with(filter)
        .with(fmt::layer().with_target(false))
        .try_init();
}
