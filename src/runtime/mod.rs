//! 后台执行模块：为同步宿主程序提供独立的异步运行时线程。
//!
//! # Background Execution
//!
//! Synchronous host applications have no tokio runtime to run observe-path
//! calls on. A [`BackgroundWorker`] owns one on a dedicated thread. It is
//! created explicitly and handed to whatever needs it; there is no global
//! instance.

mod worker;

pub use worker::BackgroundWorker;
