//! 队列提交描述
//!
//! 帧图在 pass 进入 `Submission` 状态时构建本结构：wait/signal 信号量来自
//! 附件的首次/末次使用，fence 用于 CPU 侧的帧完成回报。

use ash::vk;

use crate::command::GfxCommandList;
use crate::handles::{GfxFenceHandle, GfxSemaphoreHandle};

/// 单个信号量的提交信息
#[derive(Clone, Copy, Debug)]
pub struct GfxSemaphoreSubmit {
    pub semaphore: GfxSemaphoreHandle,
    /// 等待（或信号）所处的 pipeline stage
    pub stage: vk::PipelineStageFlags2,
}

impl GfxSemaphoreSubmit {
    #[inline]
    pub fn new(semaphore: GfxSemaphoreHandle, stage: vk::PipelineStageFlags2) -> Self {
        Self { semaphore, stage }
    }
}

/// 一次队列提交
#[derive(Default, Clone, Debug)]
pub struct GfxSubmitInfo {
    /// 录制好的命令流
    pub commands: GfxCommandList,
    /// 提交前等待的信号量
    pub waits: Vec<GfxSemaphoreSubmit>,
    /// 提交完成后发出的信号量
    pub signals: Vec<GfxSemaphoreSubmit>,
    /// 可选的 fence，GPU 完成时被 signal
    pub fence: Option<GfxFenceHandle>,
}

// new & builder
impl GfxSubmitInfo {
    pub fn new(commands: GfxCommandList) -> Self {
        Self { commands, ..Default::default() }
    }

    #[inline]
    pub fn wait(mut self, semaphore: GfxSemaphoreHandle, stage: vk::PipelineStageFlags2) -> Self {
        self.waits.push(GfxSemaphoreSubmit::new(semaphore, stage));
        self
    }

    #[inline]
    pub fn signal(mut self, semaphore: GfxSemaphoreHandle, stage: vk::PipelineStageFlags2) -> Self {
        self.signals.push(GfxSemaphoreSubmit::new(semaphore, stage));
        self
    }

    #[inline]
    pub fn with_fence(mut self, fence: GfxFenceHandle) -> Self {
        self.fence = Some(fence);
        self
    }
}
