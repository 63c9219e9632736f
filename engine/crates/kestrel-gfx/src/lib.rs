//! Kestrel 的 Gfx 层
//!
//! 帧图引擎不直接调用任何图形驱动，所有设备能力都收敛到 [`device::GfxDevice`]
//! trait 上。本 crate 提供：
//!
//! - `handles`: 基于 slotmap 的轻量资源句柄
//! - `image_info`: 图像 / 视图描述（同时充当缓存 key）
//! - `command`: 可录制、可检查的命令流
//! - `submit_info`: 队列提交描述（wait / signal / fence）
//! - `device`: 设备能力 trait 和 `GfxDeviceQueue`
//! - `virtual_device`: 纯软件实现，测试与 headless 运行的后端

pub mod command;
pub mod device;
pub mod handles;
pub mod image_info;
pub mod submit_info;
pub mod virtual_device;
