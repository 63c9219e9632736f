//! 帧内队列实例
//!
//! 编译好的 `FgQueue` 在每一帧被实例化为 `FgFrameQueue`：附件与 pass
//! 各自携带一个只能单调前进的状态机，`advance` 在 loop 线程上反复推进
//! 直到不动点。所有跨出本结构的副作用（抛 worker、看 fence、申请队列
//! 所有权）以 `FrameAction` 形式回传给引擎。

use std::rc::Rc;

use ash::vk;
use itertools::Itertools;
use kestrel_gfx::command::{GfxBufferBarrier, GfxImageBarrier};
use kestrel_gfx::device::{GfxDevice, GfxDeviceQueue};
use kestrel_gfx::handles::{GfxFenceHandle, GfxFramebufferHandle};
use kestrel_gfx::image_info::{GfxImageInfo, GfxImageViewInfo};
use kestrel_gfx::submit_info::GfxSubmitInfo;

use crate::frame_cache::FgFrameCache;
use crate::graph::attachment::{AttachmentKind, FgAttachmentInputData};
use crate::graph::FgQueue;
use crate::image_storage::FgImageStorageRef;
use crate::pass_handle::{make_pass_handle, FgPassHandle, FgPrepareOutcome, FgRecordContext};
use crate::request::FrameConstraints;
use crate::semaphore::FgSemaphore;
use crate::state::{FgAttachmentState, FgPassState};

/// advance 期间积累、由引擎消费的副作用
pub enum FrameAction {
    /// 把耗时准备工作抛给 worker，完成后经 `on_prepare_done` 回报
    SpawnPrepare {
        pass: usize,
        job: Box<dyn FnOnce() -> bool + Send>,
    },
    /// 提交已发生，引擎开始轮询 fence
    WatchFence { pass: usize, fence: GfxFenceHandle },
    /// 申请队列互斥所有权（引擎按帧序授予）
    RequestOwnership,
    /// 全部 pass 已提交或失效，归还所有权
    ReleaseOwnership,
    /// 全部非 async pass 已提交
    AllSubmitted,
    /// 帧失效
    FrameInvalidated,
    /// 本队列实例全部收尾
    QueueFinalized,
}

/// advance 所需的外部环境
pub struct FrameCtx<'a> {
    pub device: &'a dyn GfxDevice,
    pub device_queue: &'a mut GfxDeviceQueue,
    pub cache: &'a mut FgFrameCache,
    /// 帧是否已被放行提交
    pub ready_for_submit: bool,
    pub actions: Vec<FrameAction>,
}

/// 附件的帧内数据
pub struct FrameAttachmentData {
    pub state: FgAttachmentState,
    pub extent: (u32, u32),
    pub image: Option<FgImageStorageRef>,
    /// 一次性获取的哨兵
    pub acquired: bool,
    /// 外部持有（输入图像或外部渲染目标）
    pub external: bool,
    /// 等待外部结果（输入图像就绪）
    pub wait_for_result: bool,
    /// 输出投递前暂不归还缓存
    pub hold_for_delivery: bool,
    pub input: Option<FgAttachmentInputData>,
    pub view_override: Option<GfxImageViewInfo>,
}

/// pass 的帧内数据
pub struct FramePassData {
    pub state: FgPassState,
    pub extent: (u32, u32),
    /// (producer pass, producer 必须达到的状态)
    pub required: Vec<(usize, FgPassState)>,
    pub framebuffer: Option<GfxFramebufferHandle>,
    pub fence: Option<GfxFenceHandle>,
    /// 有 worker 上的准备工作在途
    pub wait_for_result: bool,
    pub handle: Box<dyn FgPassHandle>,
}

/// 帧内队列
pub struct FgFrameQueue {
    queue: Rc<FgQueue>,
    constraints: FrameConstraints,

    attachments: Vec<FrameAttachmentData>,
    passes: Vec<FramePassData>,

    /// 是否持有队列互斥所有权（引擎授予）
    owned: bool,
    ownership_requested: bool,
    ownership_released: bool,
    submitted_reported: bool,
    invalid_reported: bool,

    /// 首次提交前插入全局 barrier
    barrier_pending: bool,

    valid: bool,
    finalized: bool,
}

// new & init
impl FgFrameQueue {
    pub fn new(queue: Rc<FgQueue>, constraints: FrameConstraints) -> Self {
        let attachments = queue
            .attachments()
            .iter()
            .map(|_| FrameAttachmentData {
                state: FgAttachmentState::Initial,
                extent: constraints.extent,
                image: None,
                acquired: false,
                external: false,
                wait_for_result: false,
                hold_for_delivery: false,
                input: None,
                view_override: None,
            })
            .collect();

        let mut passes: Vec<FramePassData> = queue
            .passes()
            .iter()
            .map(|pass| FramePassData {
                state: FgPassState::Initial,
                extent: pass.extent.unwrap_or(constraints.extent),
                required: Vec::new(),
                framebuffer: None,
                fence: None,
                wait_for_result: false,
                handle: make_pass_handle(pass),
            })
            .collect();

        // 从描述符链建立 pass 之间的 required 边；链上每一对
        // (producer, consumer) 都建边，逐边的 required 状态不依赖传递性
        for attachment in queue.attachments() {
            for (producer, consumer) in attachment.descriptors.iter().tuple_combinations() {
                let mut state = producer.required_pass_state;
                for subpass_ref in &consumer.refs {
                    state = state.max(subpass_ref.dependency.required_pass_state);
                }
                passes[consumer.pass].required.push((producer.pass, state));
            }
        }

        Self {
            queue,
            constraints,
            attachments,
            passes,
            owned: false,
            ownership_requested: false,
            ownership_released: false,
            submitted_reported: false,
            invalid_reported: false,
            barrier_pending: false,
            valid: true,
            finalized: false,
        }
    }

    /// 绑定输入附件数据（来自帧请求）
    pub fn bind_input(&mut self, attachment: usize, data: FgAttachmentInputData) {
        if let Some(slot) = self.attachments.get_mut(attachment) {
            slot.input = Some(data);
        }
    }

    /// 外部渲染目标：附件直接使用给定载体，跳过缓存分配
    pub fn set_external_target(&mut self, attachment: usize, storage: FgImageStorageRef) {
        if let Some(slot) = self.attachments.get_mut(attachment) {
            slot.input = Some(FgAttachmentInputData::Image(storage));
        }
    }

    #[inline]
    pub fn override_view(&mut self, attachment: usize, view: GfxImageViewInfo) {
        if let Some(slot) = self.attachments.get_mut(attachment) {
            slot.view_override = Some(view);
        }
    }

    /// 输出投递前暂留图像
    #[inline]
    pub fn hold_output(&mut self, attachment: usize) {
        if let Some(slot) = self.attachments.get_mut(attachment) {
            slot.hold_for_delivery = true;
        }
    }

    #[inline]
    pub fn set_barrier_pending(&mut self, pending: bool) {
        self.barrier_pending = pending;
    }

    /// 引擎授予 / 收回队列所有权
    #[inline]
    pub fn set_owned(&mut self, owned: bool) {
        self.owned = owned;
    }

    /// 替换某个 pass 的执行句柄（注入录制 / 准备回调）
    #[inline]
    pub fn set_pass_handle(&mut self, pass: usize, handle: Box<dyn FgPassHandle>) {
        self.passes[pass].handle = handle;
    }
}

// getters
impl FgFrameQueue {
    #[inline]
    pub fn queue(&self) -> &Rc<FgQueue> {
        &self.queue
    }

    #[inline]
    pub fn is_valid(&self) -> bool {
        self.valid
    }

    #[inline]
    pub fn is_finalized(&self) -> bool {
        self.finalized
    }

    #[inline]
    pub fn pass_state(&self, pass: usize) -> FgPassState {
        self.passes[pass].state
    }

    #[inline]
    pub fn attachment_state(&self, attachment: usize) -> FgAttachmentState {
        self.attachments[attachment].state
    }

    /// 输出附件的图像（投递用）
    #[inline]
    pub fn output_image(&self, attachment: usize) -> Option<FgImageStorageRef> {
        self.attachments.get(attachment).and_then(|a| a.image.clone())
    }

    /// 全部非 async pass 是否已提交
    pub fn all_submitted(&self) -> bool {
        self.queue
            .passes()
            .iter()
            .zip(self.passes.iter())
            .all(|(node, data)| node.async_submit || data.state >= FgPassState::Submitted)
    }
}

// 推进
impl FgFrameQueue {
    /// 推进到不动点；返回是否有任何前进
    pub fn advance(&mut self, ctx: &mut FrameCtx) -> bool {
        let mut progressed_any = false;
        loop {
            let mut progressed = false;
            if self.valid {
                for index in 0..self.attachments.len() {
                    progressed |= self.advance_attachment(index, ctx);
                }
                for index in 0..self.passes.len() {
                    progressed |= self.advance_pass(index, ctx);
                }
            }
            progressed |= self.check_milestones(ctx);
            if !progressed {
                break;
            }
            progressed_any = true;
        }
        progressed_any
    }

    fn advance_attachment(&mut self, index: usize, ctx: &mut FrameCtx) -> bool {
        let declared = &self.queue.attachments()[index];
        let state = self.attachments[index].state;
        match state {
            FgAttachmentState::Initial => {
                let extent = declared.extent.unwrap_or(self.constraints.extent);
                let data = &mut self.attachments[index];
                data.extent = extent;
                data.state = FgAttachmentState::Setup;
                true
            }
            FgAttachmentState::Setup => {
                self.attachments[index].state = if declared.is_input {
                    FgAttachmentState::InputRequired
                } else {
                    FgAttachmentState::Ready
                };
                true
            }
            FgAttachmentState::InputRequired => {
                if self.attachments[index].input.is_none() {
                    if let Some(provider) = &declared.input_provider {
                        self.attachments[index].input = provider();
                    }
                }
                let data = &mut self.attachments[index];
                match &data.input {
                    None => false,
                    Some(FgAttachmentInputData::Image(storage)) => {
                        if storage.borrow().is_ready() {
                            data.wait_for_result = false;
                            data.state = FgAttachmentState::Ready;
                            true
                        } else {
                            data.wait_for_result = true;
                            false
                        }
                    }
                    Some(_) => {
                        data.state = FgAttachmentState::Ready;
                        true
                    }
                }
            }
            FgAttachmentState::Ready => {
                if declared.kind != AttachmentKind::Image {
                    self.attachments[index].state = FgAttachmentState::ResourcesAcquired;
                    return true;
                }
                // 有使用它的 pass 拿到所有权后才申请资源
                let wanted = self
                    .queue
                    .attachments()[index]
                    .descriptors
                    .iter()
                    .any(|d| self.passes[d.pass].state >= FgPassState::Owned);
                if wanted || declared.descriptors.is_empty() {
                    self.attachments[index].state = FgAttachmentState::ResourcesPending;
                    true
                } else {
                    false
                }
            }
            FgAttachmentState::ResourcesPending => self.acquire_attachment(index, ctx),
            FgAttachmentState::ResourcesAcquired => {
                // 末个使用者达到释放门槛后分支
                let done = declared
                    .terminal_descriptor()
                    .is_none_or(|d| self.passes[d.pass].state >= declared.final_release_state);
                if !done {
                    return false;
                }
                let external = self.attachments[index].external;
                self.attachments[index].state =
                    if external { FgAttachmentState::Detached } else { FgAttachmentState::Complete };
                true
            }
            FgAttachmentState::Detached => {
                self.attachments[index].state = FgAttachmentState::Finalized;
                true
            }
            FgAttachmentState::Complete => {
                if self.attachments[index].hold_for_delivery {
                    return false;
                }
                self.release_attachment(index, ctx);
                self.attachments[index].state = FgAttachmentState::ResourcesReleased;
                true
            }
            FgAttachmentState::ResourcesReleased => {
                self.attachments[index].state = FgAttachmentState::Finalized;
                true
            }
            FgAttachmentState::Finalized => false,
        }
    }

    /// 一次性的资源获取
    fn acquire_attachment(&mut self, index: usize, ctx: &mut FrameCtx) -> bool {
        let declared = &self.queue.attachments()[index];
        if self.attachments[index].acquired {
            log::error!("FgFrameQueue[{}]: attachment '{}' acquired twice", self.queue.name(), declared.name);
            return false;
        }

        let external_input = match &self.attachments[index].input {
            Some(FgAttachmentInputData::Image(storage)) => Some(storage.clone()),
            _ => None,
        };

        let storage = if let Some(storage) = external_input {
            self.attachments[index].external = true;
            storage
        } else {
            let extent = self.attachments[index].extent;
            let info = GfxImageInfo {
                width: extent.0,
                height: extent.1,
                format: declared.format,
                usage: declared.usage,
                samples: declared.samples,
                ..Default::default()
            };
            match ctx.cache.acquire_image(ctx.device, &info) {
                Some(storage) => storage,
                None => {
                    log::error!("FgFrameQueue[{}]: image allocation failed for '{}'", self.queue.name(), declared.name);
                    self.invalidate(ctx);
                    return true;
                }
            }
        };

        // extent 必须与帧约束一致，不一致即整帧失效
        let actual = storage.borrow().info().extent();
        if actual != self.attachments[index].extent {
            log::error!(
                "FgFrameQueue[{}]: attachment '{}' extent {:?} != expected {:?}",
                self.queue.name(),
                declared.name,
                actual,
                self.attachments[index].extent
            );
            self.invalidate(ctx);
            return true;
        }

        // 注册默认视图（或覆盖视图）
        let view_info = self.attachments[index]
            .view_override
            .unwrap_or_else(|| storage.borrow().info().infer_default_view());
        let Some(view) = storage.borrow_mut().make_view(ctx.device, &view_info) else {
            log::error!("FgFrameQueue[{}]: view creation failed for '{}'", self.queue.name(), declared.name);
            self.invalidate(ctx);
            return true;
        };
        ctx.cache.register_view(view);

        let data = &mut self.attachments[index];
        data.image = Some(storage);
        data.acquired = true;
        data.state = FgAttachmentState::ResourcesAcquired;
        true
    }

    /// 归还图像与视图
    fn release_attachment(&mut self, index: usize, ctx: &mut FrameCtx) {
        let data = &mut self.attachments[index];
        if data.external {
            data.image = None;
            return;
        }
        if let Some(storage) = data.image.take() {
            for view in storage.borrow().view_handles() {
                ctx.cache.remove_view(view);
            }
            ctx.cache.release_image(storage);
        }
    }

    fn advance_pass(&mut self, index: usize, ctx: &mut FrameCtx) -> bool {
        let state = self.passes[index].state;
        match state {
            FgPassState::Initial => {
                // 全部 producer 达到其要求状态、全部输入附件就绪后才进入 Ready
                let producers_ok = self.passes[index]
                    .required
                    .iter()
                    .all(|&(producer, needed)| self.passes[producer].state >= needed);
                if !producers_ok {
                    return false;
                }
                let inputs_ok = self.queue.attachments().iter().enumerate().all(|(a, declared)| {
                    !declared.is_input
                        || declared.descriptor_index_of_pass(index).is_none()
                        || self.attachments[a].state >= FgAttachmentState::Ready
                });
                if !inputs_ok {
                    return false;
                }
                self.passes[index].state = FgPassState::Ready;
                true
            }
            FgPassState::Ready => {
                if !self.owned {
                    if !self.ownership_requested {
                        self.ownership_requested = true;
                        ctx.actions.push(FrameAction::RequestOwnership);
                    }
                    return false;
                }
                self.passes[index].state = FgPassState::Owned;
                true
            }
            FgPassState::Owned => self.acquire_pass_resources(index, ctx),
            FgPassState::ResourcesAcquired => {
                if self.passes[index].wait_for_result {
                    return false;
                }
                match self.passes[index].handle.prepare(ctx.device) {
                    FgPrepareOutcome::Ready(true) => {
                        self.passes[index].state = FgPassState::Prepared;
                        true
                    }
                    FgPrepareOutcome::Ready(false) => {
                        log::error!("FgFrameQueue[{}]: pass {} preparation failed", self.queue.name(), index);
                        self.invalidate(ctx);
                        true
                    }
                    FgPrepareOutcome::Pending(job) => {
                        self.passes[index].wait_for_result = true;
                        ctx.actions.push(FrameAction::SpawnPrepare { pass: index, job });
                        false
                    }
                }
            }
            FgPassState::Prepared => {
                let async_submit = self.queue.passes()[index].async_submit;
                if !(ctx.ready_for_submit || async_submit) {
                    return false;
                }
                self.passes[index].state = FgPassState::Submission;
                true
            }
            FgPassState::Submission => self.submit_pass(index, ctx),
            // Submitted -> Complete 由 fence 驱动（on_fence_signaled）
            FgPassState::Submitted => false,
            FgPassState::Complete => {
                self.teardown_pass(index, ctx);
                self.passes[index].state = FgPassState::Finalized;
                true
            }
            FgPassState::Finalized => false,
        }
    }

    /// 附件齐备后取 framebuffer
    fn acquire_pass_resources(&mut self, index: usize, ctx: &mut FrameCtx) -> bool {
        let used: Vec<usize> = self
            .queue
            .attachments()
            .iter()
            .enumerate()
            .filter(|(_, a)| a.descriptor_index_of_pass(index).is_some())
            .map(|(i, _)| i)
            .collect();

        let all_acquired = used.iter().all(|&a| {
            self.attachments[a].state >= FgAttachmentState::ResourcesAcquired
                || self.queue.attachments()[a].kind != AttachmentKind::Image
        });
        if !all_acquired {
            return false;
        }

        let pass_extent = self.passes[index].extent;
        let mut views = Vec::new();
        for &a in &used {
            let declared = &self.queue.attachments()[a];
            if declared.kind != AttachmentKind::Image {
                continue;
            }
            let Some(di) = declared.descriptor_index_of_pass(index) else { continue };
            if !declared.descriptors[di].is_framebuffer_target() {
                continue;
            }
            if self.attachments[a].extent != pass_extent {
                log::error!(
                    "FgFrameQueue[{}]: pass {} extent {:?} != attachment '{}' extent {:?}",
                    self.queue.name(),
                    index,
                    pass_extent,
                    declared.name,
                    self.attachments[a].extent
                );
                self.invalidate(ctx);
                return true;
            }
            if let Some(storage) = &self.attachments[a].image {
                let view_info = self.attachments[a]
                    .view_override
                    .unwrap_or_else(|| storage.borrow().info().infer_default_view());
                if let Some(view) = storage.borrow().get_view(&view_info) {
                    views.push(view);
                }
            }
        }

        if !views.is_empty() {
            let render_pass = self.queue.passes()[index].render_pass_id;
            ctx.cache.register_render_pass(render_pass);
            match ctx.cache.acquire_framebuffer(ctx.device, render_pass, views, pass_extent) {
                Some(framebuffer) => self.passes[index].framebuffer = Some(framebuffer),
                None => {
                    log::error!("FgFrameQueue[{}]: framebuffer acquisition failed for pass {}", self.queue.name(), index);
                    self.invalidate(ctx);
                    return true;
                }
            }
        }
        self.passes[index].state = FgPassState::ResourcesAcquired;
        true
    }

    /// 录制并提交
    fn submit_pass(&mut self, index: usize, ctx: &mut FrameCtx) -> bool {
        let mut image_barriers = Vec::new();
        let mut buffer_barriers = Vec::new();
        let mut wait_handles = Vec::new();
        let mut signal_handles = Vec::new();
        let mut clear_value_count = 0u32;

        if self.barrier_pending {
            self.barrier_pending = false;
            buffer_barriers.push(GfxBufferBarrier::default());
        }

        for (a, declared) in self.queue.attachments().iter().enumerate() {
            let Some(di) = declared.descriptor_index_of_pass(index) else { continue };
            let desc = &declared.descriptors[di];
            if desc.load_op == vk::AttachmentLoadOp::CLEAR || desc.stencil_load_op == vk::AttachmentLoadOp::CLEAR {
                clear_value_count += 1;
            }
            let Some(storage) = &self.attachments[a].image else { continue };
            let mut inner = storage.borrow_mut();

            // 首个使用者 wait 载体的 wait 信号量
            if di == 0 {
                if let Some(sem) = inner.wait_sem_mut() {
                    if !sem.waited() {
                        sem.mark_waited();
                        wait_handles.push(sem.handle());
                    }
                }
            }
            // 末个使用者 signal 载体的 signal 信号量
            if di + 1 == declared.descriptors.len() {
                if inner.signal_sem().is_none() {
                    inner.set_signal_sem(FgSemaphore::new(ctx.device, "frame-signal"));
                }
                if let Some(sem) = inner.signal_sem_mut() {
                    sem.mark_signaled();
                    signal_handles.push(sem.handle());
                }
            }

            // 载体当前 layout 与描述符期望不一致时补 barrier
            if desc.initial_layout != vk::ImageLayout::UNDEFINED && inner.layout() != desc.initial_layout {
                image_barriers.push(
                    GfxImageBarrier::new(inner.image())
                        .layout_transfer(inner.layout(), desc.initial_layout)
                        .image_aspect_flag(GfxImageInfo::infer_aspect(declared.format)),
                );
            }
            inner.set_layout(desc.final_layout);
        }

        let node = &self.queue.passes()[index];
        // 句柄标脏、或设备不支持 update-after-bind 时，录制里重绑描述符集
        let update_after_bind = node
            .pipelines
            .iter()
            .flat_map(|p| p.set_layouts.iter())
            .flat_map(|l| l.bindings.iter())
            .all(|b| ctx.device.supports_update_after_bind(b.descriptor_type));
        let bind_descriptors = self.passes[index].handle.is_descriptor_dirty() || !update_after_bind;
        let record_ctx = FgRecordContext {
            pass: node,
            pass_index: index,
            extent: self.passes[index].extent,
            framebuffer: self.passes[index].framebuffer,
            barriers: image_barriers,
            clear_value_count,
            bind_descriptors,
        };
        let mut commands = self.passes[index].handle.record(&record_ctx);
        if !buffer_barriers.is_empty() {
            let mut with_barrier = kestrel_gfx::command::GfxCommandList::new();
            with_barrier.pipeline_barrier(Vec::new(), buffer_barriers);
            for cmd in commands.commands() {
                with_barrier.push(cmd.clone());
            }
            commands = with_barrier;
        }

        let Some(fence) = ctx.device.make_fence(false, &format!("pass-{}", node.name)) else {
            log::error!("FgFrameQueue[{}]: fence allocation failed", self.queue.name());
            self.invalidate(ctx);
            return true;
        };

        let mut info = GfxSubmitInfo::new(commands).with_fence(fence);
        for handle in wait_handles {
            info = info.wait(handle, vk::PipelineStageFlags2::TOP_OF_PIPE);
        }
        for handle in signal_handles {
            info = info.signal(handle, vk::PipelineStageFlags2::BOTTOM_OF_PIPE);
        }

        if !ctx.device_queue.submit(ctx.device, info) {
            ctx.device.destroy_fence(fence);
            self.invalidate(ctx);
            return true;
        }

        self.passes[index].fence = Some(fence);
        self.passes[index].state = FgPassState::Submitted;
        ctx.actions.push(FrameAction::WatchFence { pass: index, fence });
        true
    }

    /// fence / framebuffer 回收
    fn teardown_pass(&mut self, index: usize, ctx: &mut FrameCtx) {
        if let Some(fence) = self.passes[index].fence.take() {
            ctx.device.destroy_fence(fence);
        }
        if let Some(framebuffer) = self.passes[index].framebuffer.take() {
            ctx.cache.release_framebuffer(framebuffer);
        }
    }

    /// 里程碑：所有权归还、提交完成、整体收尾
    fn check_milestones(&mut self, ctx: &mut FrameCtx) -> bool {
        let mut progressed = false;

        if self.owned && !self.ownership_released {
            let done = !self.valid || self.all_submitted();
            if done {
                self.ownership_released = true;
                ctx.actions.push(FrameAction::ReleaseOwnership);
                progressed = true;
            }
        }

        if self.valid && !self.submitted_reported && self.all_submitted() {
            self.submitted_reported = true;
            ctx.actions.push(FrameAction::AllSubmitted);
            progressed = true;
        }

        if !self.finalized {
            let passes_done = self
                .passes
                .iter()
                .all(|p| p.state == FgPassState::Finalized || (!self.valid && !p.wait_for_result));
            let attachments_done = self
                .attachments
                .iter()
                .all(|a| a.state == FgAttachmentState::Finalized);
            if passes_done && attachments_done {
                self.finalized = true;
                ctx.actions.push(FrameAction::QueueFinalized);
                progressed = true;
            }
        }

        progressed
    }
}

// 外部事件
impl FgFrameQueue {
    /// worker 上的准备工作完成
    pub fn on_prepare_done(&mut self, pass: usize, success: bool, ctx: &mut FrameCtx) {
        self.passes[pass].wait_for_result = false;
        if !self.valid {
            // 失效帧的延迟收尾
            self.teardown_pass(pass, ctx);
            self.passes[pass].state = FgPassState::Finalized;
            self.advance(ctx);
            return;
        }
        if success {
            self.passes[pass].state = FgPassState::Prepared;
        } else {
            log::error!("FgFrameQueue[{}]: async preparation failed for pass {}", self.queue.name(), pass);
            self.invalidate(ctx);
        }
        self.advance(ctx);
    }

    /// pass 的 fence 已 signal
    pub fn on_fence_signaled(&mut self, pass: usize, ctx: &mut FrameCtx) {
        if self.passes[pass].state == FgPassState::Submitted {
            self.passes[pass].state = FgPassState::Complete;
        }
        self.advance(ctx);
    }

    /// 输出已投递，归还暂留的图像
    pub fn release_held_output(&mut self, attachment: usize, ctx: &mut FrameCtx) {
        if let Some(slot) = self.attachments.get_mut(attachment) {
            slot.hold_for_delivery = false;
        }
        self.advance(ctx);
    }

    /// 整帧失效：立即收尾没有在途工作的部分，其余推迟到结果到达
    pub fn invalidate(&mut self, ctx: &mut FrameCtx) {
        if !self.valid {
            return;
        }
        self.valid = false;

        for index in 0..self.passes.len() {
            if self.passes[index].wait_for_result {
                continue;
            }
            self.teardown_pass(index, ctx);
            self.passes[index].state = FgPassState::Finalized;
        }
        for index in 0..self.attachments.len() {
            if self.attachments[index].state < FgAttachmentState::Finalized {
                if let Some(storage) = &self.attachments[index].image {
                    storage.borrow_mut().fail_waiters();
                }
                self.release_attachment(index, ctx);
                self.attachments[index].state = FgAttachmentState::Finalized;
            }
        }

        if !self.invalid_reported {
            self.invalid_reported = true;
            ctx.actions.push(FrameAction::FrameInvalidated);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::graph::attachment::{AttachmentUsage, FgAttachment, FgSubpassRef};
    use crate::graph::pass::{DescriptorBindingDesc, DescriptorSetLayoutDesc, FgPassNode, FgPipelineDesc, PassKind};
    use crate::graph::FgQueueBuilder;
    use kestrel_gfx::command::GfxCommand;
    use kestrel_gfx::virtual_device::VirtualDevice;

    struct Harness {
        device: VirtualDevice,
        device_queue: GfxDeviceQueue,
        cache: FgFrameCache,
    }

    impl Harness {
        fn new() -> Self {
            Self {
                device: VirtualDevice::new(),
                device_queue: GfxDeviceQueue::new(),
                cache: FgFrameCache::new(),
            }
        }

        fn ctx(&mut self, ready_for_submit: bool) -> FrameCtx<'_> {
            FrameCtx {
                device: &self.device,
                device_queue: &mut self.device_queue,
                cache: &mut self.cache,
                ready_for_submit,
                actions: Vec::new(),
            }
        }
    }

    fn two_pass_queue(device: &VirtualDevice) -> Rc<FgQueue> {
        let mut builder = FgQueueBuilder::new("chain");
        let draw = builder.add_pass(FgPassNode::new("draw", PassKind::Graphics, 0));
        let post = builder.add_pass(FgPassNode::new("post", PassKind::Graphics, 1));
        let color = builder.add_attachment(
            FgAttachment::new_image("color", vk::Format::B8G8R8A8_UNORM)
                .with_clear()
                .as_output(vk::ImageLayout::PRESENT_SRC_KHR),
        );
        let target = builder.add_attachment(
            FgAttachment::new_image("final", vk::Format::B8G8R8A8_UNORM).with_clear(),
        );
        builder.add_usage(color, draw, vec![FgSubpassRef::new(0, AttachmentUsage::Output)]);
        builder.add_usage(color, post, vec![FgSubpassRef::new(0, AttachmentUsage::Input)]);
        builder.add_usage(target, post, vec![FgSubpassRef::new(0, AttachmentUsage::Output)]);
        builder.prepare(device)
    }

    fn drive(frame: &mut FgFrameQueue, harness: &mut Harness, ready: bool) -> Vec<FrameAction> {
        let mut ctx = harness.ctx(ready);
        frame.advance(&mut ctx);
        ctx.actions
    }

    #[test]
    fn test_passes_blocked_until_ownership() {
        let mut harness = Harness::new();
        let queue = two_pass_queue(&harness.device);
        let mut frame = FgFrameQueue::new(queue, FrameConstraints::new((32, 32)));

        let actions = drive(&mut frame, &mut harness, true);
        assert!(actions.iter().any(|a| matches!(a, FrameAction::RequestOwnership)));
        assert_eq!(frame.pass_state(0), FgPassState::Ready);
        assert_eq!(harness.device_queue.submit_count(), 0);
    }

    #[test]
    fn test_full_run_to_completion() {
        let mut harness = Harness::new();
        let queue = two_pass_queue(&harness.device);
        let mut frame = FgFrameQueue::new(queue, FrameConstraints::new((32, 32)));

        frame.set_owned(true);
        let actions = drive(&mut frame, &mut harness, true);

        // 两个 pass 都已提交
        assert_eq!(frame.pass_state(0), FgPassState::Submitted);
        assert_eq!(frame.pass_state(1), FgPassState::Submitted);
        assert!(frame.all_submitted());
        assert!(actions.iter().any(|a| matches!(a, FrameAction::AllSubmitted)));
        assert!(actions.iter().any(|a| matches!(a, FrameAction::ReleaseOwnership)));
        assert_eq!(harness.device_queue.submit_count(), 2);

        // fence 依次到达后收尾
        harness.device.complete_all_submits();
        let mut ctx = harness.ctx(true);
        frame.on_fence_signaled(0, &mut ctx);
        frame.on_fence_signaled(1, &mut ctx);
        assert!(ctx.actions.iter().any(|a| matches!(a, FrameAction::QueueFinalized)));
        assert!(frame.is_finalized());
        assert!(frame.is_valid());
        // 图像与 framebuffer 回到缓存
        assert_eq!(harness.cache.free_image_count(), 2);
    }

    #[test]
    fn test_submission_gated_until_release() {
        let mut harness = Harness::new();
        let queue = two_pass_queue(&harness.device);
        let mut frame = FgFrameQueue::new(queue, FrameConstraints::new((32, 32)));
        frame.set_owned(true);

        // 未放行：停在 Prepared
        drive(&mut frame, &mut harness, false);
        assert_eq!(frame.pass_state(0), FgPassState::Prepared);
        assert_eq!(harness.device_queue.submit_count(), 0);

        // 放行后提交
        drive(&mut frame, &mut harness, true);
        assert_eq!(frame.pass_state(0), FgPassState::Submitted);
    }

    #[test]
    fn test_async_pass_submits_without_release() {
        let mut harness = Harness::new();
        let mut builder = FgQueueBuilder::new("async");
        let pass = builder.add_pass(FgPassNode::new("async", PassKind::Graphics, 0).with_async_submit());
        let color = builder.add_attachment(FgAttachment::new_image("c", vk::Format::B8G8R8A8_UNORM).with_clear());
        builder.add_usage(color, pass, vec![FgSubpassRef::new(0, AttachmentUsage::Output)]);
        let queue = builder.prepare(&harness.device);

        let mut frame = FgFrameQueue::new(queue, FrameConstraints::new((32, 32)));
        frame.set_owned(true);
        drive(&mut frame, &mut harness, false);
        assert_eq!(frame.pass_state(0), FgPassState::Submitted);
    }

    #[test]
    fn test_external_target_extent_mismatch_invalidates() {
        let mut harness = Harness::new();
        let queue = two_pass_queue(&harness.device);
        let mut frame = FgFrameQueue::new(queue, FrameConstraints::new((32, 32)));
        frame.set_owned(true);

        // 外部目标尺寸与帧约束不一致
        let info = GfxImageInfo::new_2d(16, 16, vk::Format::B8G8R8A8_UNORM, vk::ImageUsageFlags::COLOR_ATTACHMENT);
        let image = harness.device.make_image(&info, "ext").unwrap();
        let storage = crate::image_storage::FgImageStorage::new_ref(image, info);
        frame.set_external_target(1, storage);

        let actions = drive(&mut frame, &mut harness, true);
        assert!(actions.iter().any(|a| matches!(a, FrameAction::FrameInvalidated)));
        assert!(!frame.is_valid());
        assert!(frame.is_finalized());
    }

    #[test]
    fn test_submit_failure_invalidates_frame() {
        let mut harness = Harness::new();
        harness.device.fail_next_submit(vk::Result::ERROR_OUT_OF_DEVICE_MEMORY);
        let queue = two_pass_queue(&harness.device);
        let mut frame = FgFrameQueue::new(queue, FrameConstraints::new((32, 32)));
        frame.set_owned(true);

        let actions = drive(&mut frame, &mut harness, true);
        assert!(actions.iter().any(|a| matches!(a, FrameAction::FrameInvalidated)));
        assert!(!frame.is_valid());
    }

    #[test]
    fn test_invalidation_defers_pending_prepare() {
        let mut harness = Harness::new();
        let mut builder = FgQueueBuilder::new("pending");
        let pass = builder.add_pass(FgPassNode::new("slow", PassKind::Generic, 0));
        let _ = pass;
        let queue = builder.prepare(&harness.device);

        let mut frame = FgFrameQueue::new(queue, FrameConstraints::new((32, 32)));
        // 替换句柄注入在途的准备工作
        frame.passes[0].handle = Box::new(
            crate::pass_handle::GenericPassHandle::new().with_prepare(Box::new(|| true)),
        );
        frame.set_owned(true);

        let actions = drive(&mut frame, &mut harness, true);
        let has_spawn = actions.iter().any(|a| matches!(a, FrameAction::SpawnPrepare { .. }));
        assert!(has_spawn);

        // 准备在途时失效：pass 收尾被推迟
        let mut ctx = harness.ctx(true);
        frame.invalidate(&mut ctx);
        assert!(!frame.is_finalized());

        // 结果到达后才收尾
        let mut ctx = harness.ctx(true);
        frame.on_prepare_done(0, true, &mut ctx);
        assert!(frame.is_finalized());
    }

    #[test]
    fn test_consumer_waits_for_producer_state() {
        let mut harness = Harness::new();
        let queue = two_pass_queue(&harness.device);
        let frame = FgFrameQueue::new(queue, FrameConstraints::new((32, 32)));

        // post 对 draw 建立了 Submitted 级别的边
        assert_eq!(frame.passes[1].required, vec![(0, FgPassState::Submitted)]);
    }

    #[test]
    fn test_consumer_stays_initial_until_producer_submitted() {
        let mut harness = Harness::new();
        let queue = two_pass_queue(&harness.device);
        let mut frame = FgFrameQueue::new(queue, FrameConstraints::new((32, 32)));

        // 无所有权：draw 停在 Ready，post 的 producer 未提交，不离开 Initial
        drive(&mut frame, &mut harness, true);
        assert_eq!(frame.pass_state(0), FgPassState::Ready);
        assert_eq!(frame.pass_state(1), FgPassState::Initial);

        frame.set_owned(true);
        drive(&mut frame, &mut harness, true);
        assert_eq!(frame.pass_state(0), FgPassState::Submitted);
        assert_eq!(frame.pass_state(1), FgPassState::Submitted);
    }

    #[test]
    fn test_pass_blocked_until_input_attachment_ready() {
        let mut harness = Harness::new();
        let mut builder = FgQueueBuilder::new("blit");
        let draw = builder.add_pass(FgPassNode::new("draw", PassKind::Graphics, 0));
        let src = builder.add_attachment(
            FgAttachment::new_image("src", vk::Format::R8G8B8A8_UNORM).as_input(),
        );
        let color = builder.add_attachment(
            FgAttachment::new_image("color", vk::Format::B8G8R8A8_UNORM).with_clear(),
        );
        builder.add_usage(src, draw, vec![FgSubpassRef::new(0, AttachmentUsage::Input)]);
        builder.add_usage(color, draw, vec![FgSubpassRef::new(0, AttachmentUsage::Output)]);
        let queue = builder.prepare(&harness.device);

        let mut frame = FgFrameQueue::new(queue, FrameConstraints::new((32, 32)));
        frame.set_owned(true);

        // 输入未绑定：pass 不离开 Initial，没有任何提交
        drive(&mut frame, &mut harness, true);
        assert_eq!(frame.pass_state(0), FgPassState::Initial);
        assert_eq!(harness.device_queue.submit_count(), 0);

        // 绑定就绪的输入图像后才走到提交
        let info = GfxImageInfo::new_2d(32, 32, vk::Format::R8G8B8A8_UNORM, vk::ImageUsageFlags::SAMPLED);
        let image = harness.device.make_image(&info, "src").unwrap();
        frame.bind_input(0, FgAttachmentInputData::Image(crate::image_storage::FgImageStorage::new_ref(image, info)));
        drive(&mut frame, &mut harness, true);
        assert_eq!(frame.pass_state(0), FgPassState::Submitted);
    }

    #[test]
    fn test_required_edges_cover_all_earlier_users() {
        let harness = Harness::new();
        let mut builder = FgQueueBuilder::new("triple");
        let a = builder.add_pass(FgPassNode::new("a", PassKind::Graphics, 0));
        let b = builder.add_pass(FgPassNode::new("b", PassKind::Graphics, 1));
        let c = builder.add_pass(FgPassNode::new("c", PassKind::Graphics, 2));
        let color = builder.add_attachment(
            FgAttachment::new_image("color", vk::Format::B8G8R8A8_UNORM).with_clear(),
        );
        builder.add_usage(color, a, vec![FgSubpassRef::new(0, AttachmentUsage::Output)]);
        builder.add_usage(color, b, vec![FgSubpassRef::new(0, AttachmentUsage::Input)]);
        builder.add_usage(color, c, vec![FgSubpassRef::new(0, AttachmentUsage::Input)]);
        let queue = builder.prepare(&harness.device);

        let frame = FgFrameQueue::new(queue, FrameConstraints::new((32, 32)));
        // 末个消费者对链上全部 producer 都有边，不止相邻的那个
        assert_eq!(frame.passes[1].required, vec![(0, FgPassState::Submitted)]);
        assert_eq!(
            frame.passes[2].required,
            vec![(0, FgPassState::Submitted), (1, FgPassState::Submitted)]
        );
    }

    #[test]
    fn test_dirty_descriptors_rebound_on_submit() {
        let mut harness = Harness::new();
        let mut builder = FgQueueBuilder::new("desc");
        let pipeline = FgPipelineDesc::new("pl", vk::PipelineBindPoint::GRAPHICS).with_set_layout(
            DescriptorSetLayoutDesc {
                bindings: vec![DescriptorBindingDesc {
                    binding: 0,
                    descriptor_type: vk::DescriptorType::COMBINED_IMAGE_SAMPLER,
                    count: 1,
                }],
            },
        );
        let draw = builder.add_pass(FgPassNode::new("draw", PassKind::Graphics, 0).with_pipeline(pipeline));
        let color = builder.add_attachment(
            FgAttachment::new_image("color", vk::Format::B8G8R8A8_UNORM).with_clear(),
        );
        builder.add_usage(color, draw, vec![FgSubpassRef::new(0, AttachmentUsage::Output)]);
        let queue = builder.prepare(&harness.device);

        let mut frame = FgFrameQueue::new(queue, FrameConstraints::new((32, 32)));
        frame.set_owned(true);
        drive(&mut frame, &mut harness, true);
        assert_eq!(frame.pass_state(0), FgPassState::Submitted);

        // 首次录制时句柄标脏：提交的命令流里重绑了编译期分配的描述符集
        let submit = harness.device.pending_submit(0).unwrap();
        assert!(submit.info.commands.commands().iter().any(|c| matches!(
            c,
            GfxCommand::BindDescriptorSets { first_set: 0, sets, .. } if !sets.is_empty()
        )));
    }

    #[test]
    fn test_invalidation_restores_device_objects() {
        let mut harness = Harness::new();
        let baseline = (
            harness.device.image_count(),
            harness.device.image_view_count(),
            harness.device.framebuffer_count(),
            harness.device.semaphore_count(),
            harness.device.fence_count(),
        );

        let mut builder = FgQueueBuilder::new("cleanup");
        let pass = builder.add_pass(FgPassNode::new("slow", PassKind::Generic, 0));
        let color = builder.add_attachment(
            FgAttachment::new_image("color", vk::Format::B8G8R8A8_UNORM).with_clear(),
        );
        builder.add_usage(color, pass, vec![FgSubpassRef::new(0, AttachmentUsage::Output)]);
        let queue = builder.prepare(&harness.device);

        let mut frame = FgFrameQueue::new(queue, FrameConstraints::new((32, 32)));
        frame.set_pass_handle(
            0,
            Box::new(crate::pass_handle::GenericPassHandle::new().with_prepare(Box::new(|| true))),
        );
        frame.set_owned(true);

        // 图像 / framebuffer 已获取，准备在 worker 上悬停
        let actions = drive(&mut frame, &mut harness, true);
        assert!(actions.iter().any(|a| matches!(a, FrameAction::SpawnPrepare { .. })));
        assert!(harness.device.image_count() > baseline.0);
        assert!(harness.device.framebuffer_count() > baseline.2);

        // 失效：收尾推迟到结果回报
        let mut ctx = harness.ctx(true);
        frame.invalidate(&mut ctx);
        assert!(!frame.is_finalized());
        let mut ctx = harness.ctx(true);
        frame.on_prepare_done(0, true, &mut ctx);
        assert!(frame.is_finalized());

        // 缓存排空后设备对象数量回到起点
        harness.cache.destroy(&harness.device);
        assert_eq!(harness.device.image_count(), baseline.0);
        assert_eq!(harness.device.image_view_count(), baseline.1);
        assert_eq!(harness.device.framebuffer_count(), baseline.2);
        assert_eq!(harness.device.semaphore_count(), baseline.3);
        assert_eq!(harness.device.fence_count(), baseline.4);
    }

    #[test]
    fn test_first_user_waits_last_user_signals() {
        let mut harness = Harness::new();
        let queue = two_pass_queue(&harness.device);
        let mut frame = FgFrameQueue::new(queue, FrameConstraints::new((32, 32)));
        frame.set_owned(true);
        drive(&mut frame, &mut harness, true);

        // color 的末个使用者（post）signal 其 signal 信号量；draw 不 signal
        let first = harness.device.pending_submit(0).unwrap();
        let second = harness.device.pending_submit(1).unwrap();
        assert!(first.info.signals.is_empty());
        assert!(!second.info.signals.is_empty());
        let sem = frame.attachments[0].image.as_ref().unwrap().borrow().signal_sem().unwrap().handle();
        assert_eq!(second.info.signals[0].semaphore, sem);
    }
}
