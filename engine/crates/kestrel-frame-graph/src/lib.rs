//! Kestrel 帧图执行引擎
//!
//! 以声明方式描述 render pass、附件与依赖，按帧驱动执行：
//!
//! ```text
//! Queue 编译 → FgFrameRequest → FgFrameHandle → 每个 Queue 一个 FgFrameQueue
//!     → 附件 / pass 沿显式状态机推进 → 命令录制与提交 → 资源回到 FgFrameCache
//!     → FgFrameEmitter 调节帧节奏
//! ```
//!
//! # 线程模型
//!
//! 一个专职 loop 线程拥有全部帧图可变状态；CPU 密集的准备工作被抛给
//! 工作线程池，结果经 [`engine::FgEngineRemote`] 回投 loop 线程。
//! 状态机从不阻塞 loop 线程：所有等待点都挂起为显式 continuation。
//!
//! # 错误约定
//!
//! 引擎核心不使用 panic 传播错误：可失败操作返回 `bool` / `Option` 并记录日志。
//! 失败局限于单帧；只有 device-lost 会触发 Emitter 整体失效。

pub mod counters;
pub mod dependency_event;
pub mod emitter;
pub mod engine;
pub mod frame_cache;
pub mod frame_handle;
pub mod frame_queue;
pub mod graph;
pub mod image_storage;
pub mod pass_handle;
pub mod request;
pub mod resource;
pub mod semaphore;
pub mod state;
