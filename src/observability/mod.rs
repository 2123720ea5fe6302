//! 可观测性
//!
//! 结构化日志输出；RUST_LOG 可覆盖默认级别，动作审计以 JSON 事件进入同一管道。

use tracing_subscriber::{fmt, prelude::*, EnvFilter};

pub fn init() {
    tracing_subscriber::registry()
        .with(EnvFilter::from_default_env().add_directive("info".parse().unwrap()))
        .with(fmt::layer())
        .init();
}
