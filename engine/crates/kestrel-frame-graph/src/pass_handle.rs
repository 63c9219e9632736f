//! Pass 执行句柄
//!
//! 声明式的 `FgPassNode` 在帧内由一个 PassHandle 实例承载：先 prepare
//! （可以把耗时工作抛给 worker），再 record 出命令流。附件缺失时录制
//! 空命令流，pass 退化为 no-op。

use ash::vk;
use kestrel_gfx::command::{GfxCommand, GfxCommandList, GfxImageBarrier};
use kestrel_gfx::device::GfxDevice;
use kestrel_gfx::handles::GfxFramebufferHandle;

use crate::graph::pass::{FgPassNode, PassKind};

/// prepare 的结果
pub enum FgPrepareOutcome {
    /// 立即完成（false 表示准备失败，帧失效）
    Ready(bool),
    /// 耗时工作，由引擎抛给 worker 执行
    Pending(Box<dyn FnOnce() -> bool + Send>),
}

/// 录制上下文
pub struct FgRecordContext<'a> {
    pub pass: &'a FgPassNode,
    pub pass_index: usize,
    pub extent: (u32, u32),
    /// 无 framebuffer 目标的 pass（纯计算等）为 None
    pub framebuffer: Option<GfxFramebufferHandle>,
    /// render pass 开始前合并下发的图像 barrier
    pub barriers: Vec<GfxImageBarrier>,
    pub clear_value_count: u32,
    /// 描述符脏或设备不支持 update-after-bind：绑 pipeline 后重绑描述符集
    pub bind_descriptors: bool,
}

/// Pass 执行句柄
pub trait FgPassHandle {
    /// 录制前的准备；默认无事可做
    fn prepare(&mut self, _device: &dyn GfxDevice) -> FgPrepareOutcome {
        FgPrepareOutcome::Ready(true)
    }

    /// 录制命令流
    fn record(&mut self, ctx: &FgRecordContext) -> GfxCommandList;

    /// 描述符是否需要在录制前重写
    fn is_descriptor_dirty(&self) -> bool {
        false
    }
}

/// 按 pass 类别构造默认句柄
pub fn make_pass_handle(pass: &FgPassNode) -> Box<dyn FgPassHandle> {
    match pass.kind {
        PassKind::Graphics => Box::new(GraphicsPassHandle::new()),
        PassKind::Compute => Box::new(ComputePassHandle::new()),
        PassKind::Transfer | PassKind::Generic => Box::new(GenericPassHandle::new()),
    }
}

/// 图形 pass 句柄
///
/// 按 subpass 录制绘制，末尾可附带投影阴影 subpass。
pub struct GraphicsPassHandle {
    descriptor_dirty: bool,
}

impl GraphicsPassHandle {
    pub fn new() -> Self {
        Self { descriptor_dirty: true }
    }
}

impl Default for GraphicsPassHandle {
    fn default() -> Self {
        Self::new()
    }
}

impl FgPassHandle for GraphicsPassHandle {
    fn record(&mut self, ctx: &FgRecordContext) -> GfxCommandList {
        let mut list = GfxCommandList::new();
        let Some(framebuffer) = ctx.framebuffer else {
            // 附件不可用，pass 退化为 no-op
            log::warn!("GraphicsPassHandle[{}]: no framebuffer, pass skipped", ctx.pass.name);
            return list;
        };

        list.pipeline_barrier(ctx.barriers.clone(), Vec::new());
        list.begin_label(&ctx.pass.name);
        list.push(GfxCommand::BeginRenderPass {
            render_pass: ctx.pass.render_pass_id,
            framebuffer,
            extent: ctx.extent,
            clear_value_count: ctx.clear_value_count,
        });

        let config = ctx.pass.graphics.clone().unwrap_or_default();
        for subpass in 0..ctx.pass.subpass_count {
            if subpass > 0 {
                list.push(GfxCommand::NextSubpass);
            }
            if let Some(pipeline) = ctx.pass.pipelines.get(subpass as usize) {
                list.push(GfxCommand::BindPipeline {
                    bind_point: pipeline.bind_point,
                    pipeline: pipeline.id,
                });
                if ctx.bind_descriptors && !pipeline.set_ids.is_empty() {
                    list.push(GfxCommand::BindDescriptorSets {
                        bind_point: pipeline.bind_point,
                        first_set: 0,
                        sets: pipeline.set_ids.clone(),
                    });
                }
            }
            for draw in config.draws_per_subpass.get(subpass as usize).into_iter().flatten() {
                list.push(GfxCommand::PushConstants {
                    stages: vk::ShaderStageFlags::VERTEX | vk::ShaderStageFlags::FRAGMENT,
                    offset: 0,
                    bytes: draw.material_index.to_le_bytes().into_iter().chain(draw.sampler_index.to_le_bytes()).collect(),
                });
                list.push(GfxCommand::Draw {
                    vertex_count: draw.vertex_count,
                    instance_count: draw.instance_count,
                });
            }
        }

        // 阴影收尾 subpass：有形状才录制
        if let Some(shapes) = config.shadow_post {
            if shapes.total() > 0 {
                list.push(GfxCommand::NextSubpass);
                if let Some(pipeline) = ctx.pass.pipelines.last() {
                    list.push(GfxCommand::BindPipeline {
                        bind_point: pipeline.bind_point,
                        pipeline: pipeline.id,
                    });
                }
                list.push(GfxCommand::Draw {
                    vertex_count: shapes.total() * 6,
                    instance_count: 1,
                });
            }
        }

        list.push(GfxCommand::EndRenderPass);
        list.end_label();
        self.descriptor_dirty = false;
        list
    }

    fn is_descriptor_dirty(&self) -> bool {
        self.descriptor_dirty
    }
}

/// 计算 pass 句柄
pub struct ComputePassHandle;

impl ComputePassHandle {
    pub fn new() -> Self {
        Self
    }
}

impl Default for ComputePassHandle {
    fn default() -> Self {
        Self::new()
    }
}

impl FgPassHandle for ComputePassHandle {
    fn record(&mut self, ctx: &FgRecordContext) -> GfxCommandList {
        let mut list = GfxCommandList::new();
        let Some(config) = ctx.pass.compute else {
            return list;
        };

        list.pipeline_barrier(ctx.barriers.clone(), Vec::new());
        list.begin_label(&ctx.pass.name);
        if let Some(pipeline) = ctx.pass.pipelines.first() {
            list.push(GfxCommand::BindPipeline {
                bind_point: pipeline.bind_point,
                pipeline: pipeline.id,
            });
            if ctx.bind_descriptors && !pipeline.set_ids.is_empty() {
                list.push(GfxCommand::BindDescriptorSets {
                    bind_point: pipeline.bind_point,
                    first_set: 0,
                    sets: pipeline.set_ids.clone(),
                });
            }
        }
        list.push(GfxCommand::Dispatch { group_count: config.group_count });
        list.end_label();
        list
    }
}

/// 通用句柄：录制与准备都可由调用方注入
pub struct GenericPassHandle {
    prepare_job: Option<Box<dyn FnOnce() -> bool + Send>>,
    record_fn: Option<Box<dyn FnMut(&FgRecordContext, &mut GfxCommandList)>>,
}

impl GenericPassHandle {
    pub fn new() -> Self {
        Self { prepare_job: None, record_fn: None }
    }

    /// 注入一次性的准备工作（在 worker 上执行）
    #[inline]
    pub fn with_prepare(mut self, job: Box<dyn FnOnce() -> bool + Send>) -> Self {
        self.prepare_job = Some(job);
        self
    }

    #[inline]
    pub fn with_record(mut self, record: Box<dyn FnMut(&FgRecordContext, &mut GfxCommandList)>) -> Self {
        self.record_fn = Some(record);
        self
    }
}

impl Default for GenericPassHandle {
    fn default() -> Self {
        Self::new()
    }
}

impl FgPassHandle for GenericPassHandle {
    fn prepare(&mut self, _device: &dyn GfxDevice) -> FgPrepareOutcome {
        match self.prepare_job.take() {
            Some(job) => FgPrepareOutcome::Pending(job),
            None => FgPrepareOutcome::Ready(true),
        }
    }

    fn record(&mut self, ctx: &FgRecordContext) -> GfxCommandList {
        let mut list = GfxCommandList::new();
        list.pipeline_barrier(ctx.barriers.clone(), Vec::new());
        if let Some(record) = self.record_fn.as_mut() {
            record(ctx, &mut list);
        }
        list
    }
}
