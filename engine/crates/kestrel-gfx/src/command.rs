//! 可录制的命令流
//!
//! PassHandle 把一帧内的工作录制成 `GfxCommandList`，随提交一起交给设备。
//! 命令流是纯数据，设备实现（或测试）可以完整检查它。

use ash::vk;

use crate::handles::{GfxFramebufferHandle, GfxImageHandle, GfxRenderPassId};

/// 图像 Barrier
#[derive(Clone, Copy, Debug)]
pub struct GfxImageBarrier {
    pub image: GfxImageHandle,
    pub src_stage: vk::PipelineStageFlags2,
    pub src_access: vk::AccessFlags2,
    pub dst_stage: vk::PipelineStageFlags2,
    pub dst_access: vk::AccessFlags2,
    pub old_layout: vk::ImageLayout,
    pub new_layout: vk::ImageLayout,
    pub aspect: vk::ImageAspectFlags,
}

// new & builder
impl GfxImageBarrier {
    pub fn new(image: GfxImageHandle) -> Self {
        Self {
            image,
            src_stage: vk::PipelineStageFlags2::TOP_OF_PIPE,
            src_access: vk::AccessFlags2::NONE,
            dst_stage: vk::PipelineStageFlags2::BOTTOM_OF_PIPE,
            dst_access: vk::AccessFlags2::NONE,
            old_layout: vk::ImageLayout::UNDEFINED,
            new_layout: vk::ImageLayout::UNDEFINED,
            aspect: vk::ImageAspectFlags::COLOR,
        }
    }

    #[inline]
    pub fn layout_transfer(mut self, old: vk::ImageLayout, new: vk::ImageLayout) -> Self {
        self.old_layout = old;
        self.new_layout = new;
        self
    }

    #[inline]
    pub fn src_mask(mut self, stage: vk::PipelineStageFlags2, access: vk::AccessFlags2) -> Self {
        self.src_stage = stage;
        self.src_access = access;
        self
    }

    #[inline]
    pub fn dst_mask(mut self, stage: vk::PipelineStageFlags2, access: vk::AccessFlags2) -> Self {
        self.dst_stage = stage;
        self.dst_access = access;
        self
    }

    #[inline]
    pub fn image_aspect_flag(mut self, aspect: vk::ImageAspectFlags) -> Self {
        self.aspect = aspect;
        self
    }
}

/// 缓冲区 Barrier
#[derive(Clone, Copy, Debug)]
pub struct GfxBufferBarrier {
    pub src_stage: vk::PipelineStageFlags2,
    pub src_access: vk::AccessFlags2,
    pub dst_stage: vk::PipelineStageFlags2,
    pub dst_access: vk::AccessFlags2,
    pub offset: vk::DeviceSize,
    pub size: vk::DeviceSize,
}

impl Default for GfxBufferBarrier {
    fn default() -> Self {
        Self {
            src_stage: vk::PipelineStageFlags2::TOP_OF_PIPE,
            src_access: vk::AccessFlags2::NONE,
            dst_stage: vk::PipelineStageFlags2::BOTTOM_OF_PIPE,
            dst_access: vk::AccessFlags2::NONE,
            offset: 0,
            size: vk::WHOLE_SIZE,
        }
    }
}

/// 单条命令
#[derive(Clone, Debug)]
pub enum GfxCommand {
    /// 合并后的 pipeline barrier（在 render pass 开始前一次性下发）
    PipelineBarrier {
        image_barriers: Vec<GfxImageBarrier>,
        buffer_barriers: Vec<GfxBufferBarrier>,
    },
    BeginRenderPass {
        render_pass: GfxRenderPassId,
        framebuffer: GfxFramebufferHandle,
        extent: (u32, u32),
        clear_value_count: u32,
    },
    NextSubpass,
    EndRenderPass,
    BindPipeline {
        bind_point: vk::PipelineBindPoint,
        pipeline: u64,
    },
    BindDescriptorSets {
        bind_point: vk::PipelineBindPoint,
        first_set: u32,
        sets: Vec<u64>,
    },
    PushConstants {
        stages: vk::ShaderStageFlags,
        offset: u32,
        bytes: Vec<u8>,
    },
    Draw {
        vertex_count: u32,
        instance_count: u32,
    },
    Dispatch {
        group_count: (u32, u32, u32),
    },
    BeginLabel(String),
    EndLabel,
}

/// 录制好的命令流
///
/// 只负责承载命令，不做合法性校验；校验发生在录制方（PassHandle）。
#[derive(Default, Clone, Debug)]
pub struct GfxCommandList {
    commands: Vec<GfxCommand>,
}

// new & init
impl GfxCommandList {
    pub fn new() -> Self {
        Self::default()
    }
}

// 录制
impl GfxCommandList {
    #[inline]
    pub fn push(&mut self, cmd: GfxCommand) {
        self.commands.push(cmd);
    }

    /// 合并下发 barriers；空集合不会产生命令
    pub fn pipeline_barrier(&mut self, image_barriers: Vec<GfxImageBarrier>, buffer_barriers: Vec<GfxBufferBarrier>) {
        if image_barriers.is_empty() && buffer_barriers.is_empty() {
            return;
        }
        self.commands.push(GfxCommand::PipelineBarrier { image_barriers, buffer_barriers });
    }

    #[inline]
    pub fn begin_label(&mut self, name: &str) {
        self.commands.push(GfxCommand::BeginLabel(name.to_string()));
    }

    #[inline]
    pub fn end_label(&mut self) {
        self.commands.push(GfxCommand::EndLabel);
    }
}

// getters
impl GfxCommandList {
    #[inline]
    pub fn commands(&self) -> &[GfxCommand] {
        &self.commands
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.commands.is_empty()
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.commands.len()
    }
}
