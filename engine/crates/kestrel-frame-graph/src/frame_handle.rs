//! 帧句柄
//!
//! 一次帧请求被受理后的运行时身份：持有请求本身、主 Queue 与全部链接
//! Queue 的帧内实例，以及完成回调。帧序（order）在创建时从 Queue 的
//! 序号分配器取得，队列所有权按帧序授予。

use std::sync::atomic::Ordering;

use slotmap::new_key_type;

use crate::counters::COUNTERS;
use crate::frame_queue::FgFrameQueue;
use crate::request::FgFrameRequest;

new_key_type! {
    /// 帧在引擎 SlotMap 里的 key
    pub struct FrameId;
}

/// 帧句柄
pub struct FgFrameHandle {
    id: FrameId,
    order: u64,
    generation: u64,

    request: FgFrameRequest,
    /// 下标 0 是主 Queue，其余为链接 Queue
    queues: Vec<FgFrameQueue>,

    valid: bool,
    finalized: bool,
    submitted: bool,
    ready_for_submit: bool,

    completion: Option<Box<dyn FnOnce(bool)>>,
}

// new & init
impl FgFrameHandle {
    pub fn new(mut request: FgFrameRequest, generation: u64) -> Self {
        let order = request.queue().next_order();
        let constraints = *request.constraints();
        let completion = request.take_completion();

        let mut main = FgFrameQueue::new(request.queue().clone(), constraints);
        for &attachment in request.queue().input_attachments() {
            if let Some(data) = request.input(attachment) {
                main.bind_input(attachment, data.clone());
            }
        }
        for (&attachment, _) in request.outputs() {
            main.hold_output(attachment);
            if let Some(view) = request.view_override(attachment) {
                main.override_view(attachment, *view);
            }
        }
        if let Some(target) = request.render_target() {
            if let Some(&primary) = request.queue().output_attachments().first() {
                main.set_external_target(primary, target.clone());
            }
        }
        main.set_barrier_pending(request.enable_barrier());

        let mut queues = vec![main];
        for linked in request.queue().linked_queues() {
            queues.push(FgFrameQueue::new(linked.clone(), constraints));
        }

        COUNTERS.live_frames.fetch_add(1, Ordering::Relaxed);

        Self {
            id: FrameId::default(),
            order,
            generation,
            request,
            queues,
            valid: true,
            finalized: false,
            submitted: false,
            ready_for_submit: false,
            completion,
        }
    }

    /// 插入引擎 SlotMap 后回填
    #[inline]
    pub fn set_id(&mut self, id: FrameId) {
        self.id = id;
    }
}

// getters
impl FgFrameHandle {
    #[inline]
    pub fn id(&self) -> FrameId {
        self.id
    }

    #[inline]
    pub fn order(&self) -> u64 {
        self.order
    }

    #[inline]
    pub fn generation(&self) -> u64 {
        self.generation
    }

    #[inline]
    pub fn request(&self) -> &FgFrameRequest {
        &self.request
    }

    #[inline]
    pub fn is_valid(&self) -> bool {
        self.valid && self.queues.iter().all(FgFrameQueue::is_valid)
    }

    #[inline]
    pub fn is_finalized(&self) -> bool {
        self.finalized
    }

    #[inline]
    pub fn is_submitted(&self) -> bool {
        self.submitted
    }

    #[inline]
    pub fn ready_for_submit(&self) -> bool {
        self.ready_for_submit
    }

    #[inline]
    pub fn queues(&self) -> &[FgFrameQueue] {
        &self.queues
    }

    #[inline]
    pub fn queues_mut(&mut self) -> &mut [FgFrameQueue] {
        &mut self.queues
    }

    #[inline]
    pub fn main_queue(&self) -> &FgFrameQueue {
        &self.queues[0]
    }

    #[inline]
    pub fn main_queue_mut(&mut self) -> &mut FgFrameQueue {
        &mut self.queues[0]
    }

    /// 全部帧内队列都已收尾
    #[inline]
    pub fn all_queues_finalized(&self) -> bool {
        self.queues.iter().all(FgFrameQueue::is_finalized)
    }
}

// 生命周期
impl FgFrameHandle {
    /// 放行提交
    #[inline]
    pub fn set_ready_for_submit(&mut self) {
        self.ready_for_submit = true;
    }

    /// 全部非 async pass 已提交
    pub fn mark_submitted(&mut self) {
        if self.submitted {
            return;
        }
        self.submitted = true;
        COUNTERS.submitted_frames.fetch_add(1, Ordering::Relaxed);
    }

    #[inline]
    pub fn mark_invalid(&mut self) {
        self.valid = false;
    }

    /// 帧结束（成功或失败）：回调恰好触发一次，计数器落账
    pub fn finish(&mut self, success: bool) {
        if self.finalized {
            return;
        }
        self.finalized = true;
        COUNTERS.completed_frames.fetch_add(1, Ordering::Relaxed);
        COUNTERS.live_frames.fetch_sub(1, Ordering::Relaxed);
        if let Some(cb) = self.completion.take() {
            cb(success);
        }
        log::debug!("FgFrameHandle[order={}]: finished, success={}", self.order, success);
    }
}
