//! 帧图引擎
//!
//! loop 线程的所有者：帧的受理、节奏放行、队列所有权仲裁、fence 轮询、
//! 输出投递与完成回报都发生在这里。worker 线程只执行无副作用的准备
//! 工作，结果以任务形式回投 loop 线程。
//!
//! 借用约定：帧在被驱动时从 SlotMap 槽位里整体取出（槽位留 None），
//! 这样 `FrameCtx` 可以同时可变借用引擎的其余部分。

use std::collections::{HashMap, VecDeque};
use std::rc::Rc;
use std::time::{Duration, Instant};

use crossbeam_channel::{Receiver, Sender};
use kestrel_gfx::device::{GfxDevice, GfxDeviceQueue};
use kestrel_gfx::handles::GfxFenceHandle;
use slotmap::SlotMap;

use crate::emitter::FgFrameEmitter;
use crate::frame_cache::FgFrameCache;
use crate::frame_handle::{FgFrameHandle, FrameId};
use crate::frame_queue::{FrameAction, FrameCtx};
use crate::request::FgFrameRequest;

/// 回投 loop 线程的任务
pub type EngineTask = Box<dyn FnOnce(&mut FgEngine) + Send>;
/// loop 线程内部排队的任务（允许非 Send）
type LocalTask = Box<dyn FnOnce(&mut FgEngine)>;

/// 跨线程句柄：worker 或外部线程经由它把任务投回 loop 线程
#[derive(Clone)]
pub struct FgEngineRemote {
    tx: Sender<EngineTask>,
}

impl FgEngineRemote {
    /// 投递任务；引擎已关闭时返回 false
    pub fn perform(&self, task: EngineTask) -> bool {
        self.tx.send(task).is_ok()
    }
}

/// worker 线程池
struct TaskPool {
    tx: Option<Sender<Box<dyn FnOnce() + Send>>>,
    handles: Vec<std::thread::JoinHandle<()>>,
}

impl TaskPool {
    fn new(threads: usize) -> Self {
        let (tx, rx) = crossbeam_channel::unbounded::<Box<dyn FnOnce() + Send>>();
        let handles = (0..threads.max(1))
            .map(|index| {
                let rx: Receiver<Box<dyn FnOnce() + Send>> = rx.clone();
                std::thread::Builder::new()
                    .name(format!("fg-worker-{index}"))
                    .spawn(move || {
                        while let Ok(job) = rx.recv() {
                            job();
                        }
                    })
                    .unwrap_or_else(|e| panic!("worker thread spawn failed: {e}"))
            })
            .collect();
        Self { tx: Some(tx), handles }
    }

    fn spawn(&self, job: Box<dyn FnOnce() + Send>) {
        if let Some(tx) = &self.tx {
            let _ = tx.send(job);
        }
    }
}

impl Drop for TaskPool {
    fn drop(&mut self) {
        self.tx = None;
        for handle in self.handles.drain(..) {
            let _ = handle.join();
        }
    }
}

/// 每个编译 Queue 的运行时：帧之间的互斥所有权
#[derive(Default)]
struct QueueRuntime {
    owner: Option<FrameId>,
    /// (帧序, 帧) —— 按帧序授予
    waiters: Vec<(u64, FrameId)>,
}

struct WatchedFence {
    frame: FrameId,
    queue_index: usize,
    pass: usize,
    fence: GfxFenceHandle,
}

/// 引擎配置
pub struct FgEngineConfig {
    pub frame_interval: Duration,
    pub safety_offset: Duration,
    pub worker_threads: usize,
}

impl Default for FgEngineConfig {
    fn default() -> Self {
        Self {
            frame_interval: Duration::from_millis(16),
            safety_offset: Duration::from_millis(2),
            worker_threads: 2,
        }
    }
}

/// 帧图引擎
pub struct FgEngine {
    device: Rc<dyn GfxDevice>,
    device_queue: GfxDeviceQueue,
    cache: FgFrameCache,
    emitter: FgFrameEmitter,

    frames: SlotMap<FrameId, Option<FgFrameHandle>>,
    queue_runtimes: HashMap<u64, QueueRuntime>,

    /// 等待依赖事件的帧（尚未进入发射器）
    awaiting_deps: Vec<FrameId>,
    watched_fences: Vec<WatchedFence>,
    /// 在 worker 上执行中的任务数
    outstanding_jobs: usize,
    /// device-lost 只触发一次整体失效
    device_lost_handled: bool,

    tasks_tx: Sender<EngineTask>,
    tasks_rx: Receiver<EngineTask>,
    local_tasks: VecDeque<LocalTask>,
    workers: TaskPool,
}

// new & init
impl FgEngine {
    pub fn new(device: Rc<dyn GfxDevice>, config: FgEngineConfig) -> Self {
        let (tasks_tx, tasks_rx) = crossbeam_channel::unbounded();
        Self {
            device,
            device_queue: GfxDeviceQueue::new(),
            cache: FgFrameCache::new(),
            emitter: FgFrameEmitter::new(config.frame_interval).with_safety_offset(config.safety_offset),
            frames: SlotMap::with_key(),
            queue_runtimes: HashMap::new(),
            awaiting_deps: Vec::new(),
            watched_fences: Vec::new(),
            outstanding_jobs: 0,
            device_lost_handled: false,
            tasks_tx,
            tasks_rx,
            local_tasks: VecDeque::new(),
            workers: TaskPool::new(config.worker_threads),
        }
    }

    /// 跨线程句柄
    pub fn remote(&self) -> FgEngineRemote {
        FgEngineRemote { tx: self.tasks_tx.clone() }
    }

    /// loop 线程内排队一个任务（下一次 update 执行）
    #[inline]
    pub fn schedule(&mut self, task: LocalTask) {
        self.local_tasks.push_back(task);
    }

    #[inline]
    pub fn emitter_mut(&mut self) -> &mut FgFrameEmitter {
        &mut self.emitter
    }

    #[inline]
    pub fn device(&self) -> &Rc<dyn GfxDevice> {
        &self.device
    }

    #[inline]
    pub fn live_frame_count(&self) -> usize {
        self.frames.len()
    }
}

// 帧受理
impl FgEngine {
    /// 受理一个帧请求
    ///
    /// 帧立即开始准备（附件、pass 资源），但提交放行要等依赖事件
    /// 与发射器节奏。
    pub fn submit_frame(&mut self, request: FgFrameRequest) -> FrameId {
        for event in request.signal_dependencies() {
            event.submit();
        }
        let frame = FgFrameHandle::new(request, self.emitter.generation());
        let id = self.frames.insert(Some(frame));
        if let Some(Some(frame)) = self.frames.get_mut(id) {
            frame.set_id(id);
        }
        self.awaiting_deps.push(id);
        self.drive_frame(id);
        id
    }

    /// 使某帧失效（例如宿主窗口尺寸变化）
    pub fn invalidate_frame(&mut self, id: FrameId) {
        let Some(mut frame) = self.take_frame(id) else { return };
        frame.mark_invalid();
        let mut collected = Vec::new();
        for qi in 0..frame.queues().len() {
            let device = self.device.clone();
            let mut ctx = FrameCtx {
                device: device.as_ref(),
                device_queue: &mut self.device_queue,
                cache: &mut self.cache,
                ready_for_submit: false,
                actions: Vec::new(),
            };
            frame.queues_mut()[qi].invalidate(&mut ctx);
            frame.queues_mut()[qi].advance(&mut ctx);
            collected.extend(ctx.actions.into_iter().map(|a| (qi, a)));
        }
        self.put_frame(id, frame);
        for (qi, action) in collected {
            self.handle_action(id, qi, action);
        }
        self.try_complete(id);
    }

    /// 整体失效：设备丢失等不可恢复错误
    pub fn invalidate_all(&mut self) {
        let affected: Vec<FrameId> = self.frames.keys().collect();
        let _ = self.emitter.invalidate();
        for id in affected {
            self.invalidate_frame(id);
        }
    }
}

// 主循环
impl FgEngine {
    /// 推进一轮；返回是否有任何前进
    pub fn update(&mut self) -> bool {
        let mut progressed = false;
        if self.device_queue.device_lost() && !self.device_lost_handled {
            self.device_lost_handled = true;
            log::error!("FgEngine: device lost, all frames invalidated");
            self.invalidate_all();
            progressed = true;
        }
        progressed |= self.drain_tasks();
        progressed |= self.poll_fences();
        progressed |= self.pump_dependencies();
        progressed |= self.pump_emitter();
        progressed |= self.drive_all();
        progressed
    }

    /// 反复 update 直到没有前进（测试与 headless 用）
    ///
    /// 这是宿主循环的空转点：worker 在途时在这里等待回投，
    /// `update` 本身从不阻塞。
    pub fn run_until_settled(&mut self) {
        for _ in 0..256 {
            if self.update() {
                continue;
            }
            if self.outstanding_jobs > 0 {
                if let Ok(task) = self.tasks_rx.recv_timeout(Duration::from_millis(100)) {
                    task(self);
                }
                continue;
            }
            return;
        }
        log::warn!("FgEngine: run_until_settled hit iteration cap");
    }

    /// 宿主事件循环的下一次唤醒时刻
    pub fn next_wakeup(&self) -> Option<Instant> {
        self.emitter.next_deadline()
    }

    fn drain_tasks(&mut self) -> bool {
        let mut progressed = false;
        while let Some(task) = self.local_tasks.pop_front() {
            task(self);
            progressed = true;
        }
        while let Ok(task) = self.tasks_rx.try_recv() {
            task(self);
            progressed = true;
        }
        progressed
    }

    /// 依赖事件满足的帧进入发射器
    fn pump_dependencies(&mut self) -> bool {
        let mut progressed = false;
        let ids = std::mem::take(&mut self.awaiting_deps);
        for id in ids {
            let Some(Some(frame)) = self.frames.get(id) else { continue };
            let deps = frame.request().wait_dependencies();
            if deps.iter().any(|e| e.is_signaled() && e.is_failed()) {
                log::warn!("FgEngine: frame dependency failed, frame invalidated");
                self.invalidate_frame(id);
                progressed = true;
                continue;
            }
            if !deps.iter().all(|e| e.is_signaled()) {
                self.awaiting_deps.push(id);
                continue;
            }
            if self.emitter.enqueue(id) {
                progressed = true;
            } else {
                // 发射器已满，帧以失败结束
                self.invalidate_frame(id);
                progressed = true;
            }
        }
        progressed
    }

    /// 发射器放行 -> 帧获得提交许可
    fn pump_emitter(&mut self) -> bool {
        let mut progressed = false;
        let now = Instant::now();
        while let Some(id) = self.emitter.start_next(now) {
            if let Some(Some(frame)) = self.frames.get_mut(id) {
                frame.set_ready_for_submit();
            }
            self.drive_frame(id);
            // 纯 async 队列可能在放行前就已全部提交
            if let Some(Some(frame)) = self.frames.get(id) {
                if frame.is_submitted() {
                    self.emitter.set_frame_submitted(id, now);
                }
            }
            progressed = true;
        }
        progressed
    }

    fn poll_fences(&mut self) -> bool {
        let mut signaled = Vec::new();
        self.watched_fences.retain(|watch| {
            if self.device.fence_signaled(watch.fence) {
                signaled.push((watch.frame, watch.queue_index, watch.pass));
                false
            } else {
                true
            }
        });
        let progressed = !signaled.is_empty();
        for (id, qi, pass) in signaled {
            let Some(mut frame) = self.take_frame(id) else { continue };
            let ready = frame.ready_for_submit();
            let mut collected = Vec::new();
            {
                let device = self.device.clone();
                let mut ctx = FrameCtx {
                    device: device.as_ref(),
                    device_queue: &mut self.device_queue,
                    cache: &mut self.cache,
                    ready_for_submit: ready,
                    actions: Vec::new(),
                };
                frame.queues_mut()[qi].on_fence_signaled(pass, &mut ctx);
                collected.extend(ctx.actions.into_iter().map(|a| (qi, a)));
            }
            self.put_frame(id, frame);
            for (qi, action) in collected {
                self.handle_action(id, qi, action);
            }
            self.deliver_outputs(id);
            self.try_complete(id);
        }
        progressed
    }

    fn drive_all(&mut self) -> bool {
        let mut progressed = false;
        let ids: Vec<FrameId> = self.frames.keys().collect();
        for id in ids {
            progressed |= self.drive_frame(id);
            self.deliver_outputs(id);
            self.try_complete(id);
        }
        progressed
    }
}

// 帧驱动
impl FgEngine {
    fn take_frame(&mut self, id: FrameId) -> Option<FgFrameHandle> {
        self.frames.get_mut(id).and_then(Option::take)
    }

    fn put_frame(&mut self, id: FrameId, frame: FgFrameHandle) {
        if let Some(slot) = self.frames.get_mut(id) {
            *slot = Some(frame);
        }
    }

    fn drive_frame(&mut self, id: FrameId) -> bool {
        let Some(mut frame) = self.take_frame(id) else { return false };
        let ready = frame.ready_for_submit();
        let mut progressed = false;
        let mut collected = Vec::new();
        for qi in 0..frame.queues().len() {
            let device = self.device.clone();
            let mut ctx = FrameCtx {
                device: device.as_ref(),
                device_queue: &mut self.device_queue,
                cache: &mut self.cache,
                ready_for_submit: ready,
                actions: Vec::new(),
            };
            progressed |= frame.queues_mut()[qi].advance(&mut ctx);
            collected.extend(ctx.actions.into_iter().map(|a| (qi, a)));
        }
        self.put_frame(id, frame);
        for (qi, action) in collected {
            self.handle_action(id, qi, action);
        }
        progressed
    }

    fn handle_action(&mut self, id: FrameId, queue_index: usize, action: FrameAction) {
        match action {
            FrameAction::SpawnPrepare { pass, job } => {
                self.outstanding_jobs += 1;
                let remote = self.remote();
                self.workers.spawn(Box::new(move || {
                    let success = job();
                    remote.perform(Box::new(move |engine| {
                        engine.outstanding_jobs = engine.outstanding_jobs.saturating_sub(1);
                        engine.on_prepare_done(id, queue_index, pass, success);
                    }));
                }));
            }
            FrameAction::WatchFence { pass, fence } => {
                self.watched_fences.push(WatchedFence { frame: id, queue_index, pass, fence });
            }
            FrameAction::RequestOwnership => self.request_ownership(id, queue_index),
            FrameAction::ReleaseOwnership => self.release_ownership(id, queue_index),
            FrameAction::AllSubmitted => {
                if let Some(Some(frame)) = self.frames.get_mut(id) {
                    frame.mark_submitted();
                }
                self.emitter.set_frame_submitted(id, Instant::now());
            }
            FrameAction::FrameInvalidated => {
                if let Some(Some(frame)) = self.frames.get_mut(id) {
                    frame.mark_invalid();
                }
            }
            FrameAction::QueueFinalized => {
                // try_complete 由调用方在 action 处理后统一执行
            }
        }
    }

    fn on_prepare_done(&mut self, id: FrameId, queue_index: usize, pass: usize, success: bool) {
        let Some(mut frame) = self.take_frame(id) else { return };
        let ready = frame.ready_for_submit();
        let mut collected = Vec::new();
        {
            let device = self.device.clone();
            let mut ctx = FrameCtx {
                device: device.as_ref(),
                device_queue: &mut self.device_queue,
                cache: &mut self.cache,
                ready_for_submit: ready,
                actions: Vec::new(),
            };
            frame.queues_mut()[queue_index].on_prepare_done(pass, success, &mut ctx);
            collected.extend(ctx.actions.into_iter().map(|a| (queue_index, a)));
        }
        self.put_frame(id, frame);
        for (qi, action) in collected {
            self.handle_action(id, qi, action);
        }
        self.try_complete(id);
    }
}

// 队列所有权仲裁
impl FgEngine {
    fn frame_order(&self, id: FrameId) -> Option<u64> {
        match self.frames.get(id) {
            Some(Some(frame)) => Some(frame.order()),
            _ => None,
        }
    }

    fn queue_id_of(&self, id: FrameId, queue_index: usize) -> Option<u64> {
        match self.frames.get(id) {
            Some(Some(frame)) => Some(frame.queues()[queue_index].queue().id()),
            _ => None,
        }
    }

    fn request_ownership(&mut self, id: FrameId, queue_index: usize) {
        let (Some(queue_id), Some(order)) = (self.queue_id_of(id, queue_index), self.frame_order(id)) else {
            return;
        };
        let runtime = self.queue_runtimes.entry(queue_id).or_default();
        match runtime.owner {
            None => {
                runtime.owner = Some(id);
                if let Some(Some(frame)) = self.frames.get_mut(id) {
                    frame.queues_mut()[queue_index].set_owned(true);
                }
                self.drive_frame(id);
            }
            Some(owner) if owner == id => {}
            Some(_) => {
                if !runtime.waiters.iter().any(|&(_, w)| w == id) {
                    runtime.waiters.push((order, id));
                    runtime.waiters.sort_by_key(|&(order, _)| order);
                }
            }
        }
    }

    fn release_ownership(&mut self, id: FrameId, queue_index: usize) {
        let Some(queue_id) = self.queue_id_of(id, queue_index) else { return };
        if let Some(Some(frame)) = self.frames.get_mut(id) {
            frame.queues_mut()[queue_index].set_owned(false);
        }
        let next = {
            let Some(runtime) = self.queue_runtimes.get_mut(&queue_id) else { return };
            if runtime.owner != Some(id) {
                return;
            }
            runtime.owner = None;
            if runtime.waiters.is_empty() {
                None
            } else {
                let (_, next) = runtime.waiters.remove(0);
                runtime.owner = Some(next);
                Some(next)
            }
        };
        if let Some(next) = next {
            // 下一位等待者拿到所有权；它的帧内队列下标与本队列一致
            if let Some(Some(frame)) = self.frames.get_mut(next) {
                for qi in 0..frame.queues().len() {
                    if frame.queues()[qi].queue().id() == queue_id {
                        frame.queues_mut()[qi].set_owned(true);
                    }
                }
            }
            self.drive_frame(next);
        }
    }
}

// 输出投递与完成
impl FgEngine {
    /// 尝试投递已到达暂留点的输出；未消费的下轮重试
    fn deliver_outputs(&mut self, id: FrameId) {
        let outputs: Vec<(usize, crate::request::FgOutputBinding)> = match self.frames.get(id) {
            Some(Some(frame)) if frame.is_valid() => frame
                .request()
                .outputs()
                .iter()
                .map(|(&att, binding)| (att, binding.clone()))
                .collect(),
            _ => return,
        };
        if outputs.is_empty() {
            return;
        }

        for (attachment, binding) in outputs {
            let storage = {
                let Some(Some(frame)) = self.frames.get(id) else { return };
                let queue = frame.main_queue();
                if queue.attachment_state(attachment) != crate::state::FgAttachmentState::Complete {
                    continue;
                }
                match queue.output_image(attachment) {
                    Some(storage) => storage,
                    None => continue,
                }
            };
            if !storage.borrow().is_ready() {
                continue;
            }
            if binding.deliver(Some(&storage), true) {
                let Some(mut frame) = self.take_frame(id) else { return };
                let device = self.device.clone();
                let mut ctx = FrameCtx {
                    device: device.as_ref(),
                    device_queue: &mut self.device_queue,
                    cache: &mut self.cache,
                    ready_for_submit: true,
                    actions: Vec::new(),
                };
                frame.main_queue_mut().release_held_output(attachment, &mut ctx);
                let actions = std::mem::take(&mut ctx.actions);
                self.put_frame(id, frame);
                for action in actions {
                    self.handle_action(id, 0, action);
                }
            }
        }
    }

    /// 全部队列收尾后结束帧
    fn try_complete(&mut self, id: FrameId) {
        let done = match self.frames.get(id) {
            Some(Some(frame)) => frame.all_queues_finalized(),
            _ => false,
        };
        if !done {
            return;
        }

        let Some(mut frame) = self.take_frame(id) else { return };
        self.frames.remove(id);
        self.watched_fences.retain(|w| w.frame != id);

        let success = frame.is_valid();
        // 失败的帧也要通知每个输出绑定，载体此时可能已被回收
        if !success {
            for (&attachment, binding) in frame.request().outputs() {
                let storage = frame.main_queue().output_image(attachment);
                binding.deliver(storage.as_ref(), false);
            }
        }
        for event in frame.request().signal_dependencies() {
            event.signal(success);
        }
        frame.finish(success);
        self.emitter.on_frame_complete(id, Instant::now());
        self.awaiting_deps.retain(|&a| a != id);

        // 两段式回收的第二段
        self.cache.clear(self.device.as_ref());
    }
}

impl Drop for FgEngine {
    fn drop(&mut self) {
        let ids: Vec<FrameId> = self.frames.keys().collect();
        for id in ids {
            self.invalidate_frame(id);
        }
        self.cache.destroy(self.device.as_ref());
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dependency_event::FgDependencyEvent;
    use crate::graph::attachment::{AttachmentUsage, FgAttachment, FgSubpassRef};
    use crate::graph::pass::{FgPassNode, PassKind};
    use crate::graph::{FgQueue, FgQueueBuilder};
    use crate::request::{FgFrameRequest, FgOutputBinding, FrameConstraints};
    use ash::vk;
    use kestrel_gfx::virtual_device::VirtualDevice;
    use std::cell::RefCell;

    fn test_engine() -> (Rc<VirtualDevice>, FgEngine) {
        kestrel_crate_tools::init_log::init_log();
        let device = Rc::new(VirtualDevice::new());
        let config = FgEngineConfig {
            frame_interval: Duration::ZERO,
            safety_offset: Duration::ZERO,
            worker_threads: 1,
        };
        let engine = FgEngine::new(device.clone(), config);
        (device, engine)
    }

    fn simple_queue(device: &VirtualDevice) -> Rc<FgQueue> {
        let mut builder = FgQueueBuilder::new("main");
        let draw = builder.add_pass(FgPassNode::new("draw", PassKind::Graphics, 0));
        let color = builder.add_attachment(
            FgAttachment::new_image("color", vk::Format::B8G8R8A8_UNORM)
                .with_clear()
                .as_output(vk::ImageLayout::PRESENT_SRC_KHR),
        );
        builder.add_usage(color, draw, vec![FgSubpassRef::new(0, AttachmentUsage::Output)]);
        builder.prepare(device)
    }

    fn pump(device: &VirtualDevice, engine: &mut FgEngine) {
        for _ in 0..8 {
            engine.run_until_settled();
            device.complete_all_submits();
            engine.run_until_settled();
        }
    }

    #[test]
    fn test_frame_runs_to_successful_completion() {
        let (device, mut engine) = test_engine();
        let queue = simple_queue(&device);

        let delivered = Rc::new(RefCell::new(0));
        let completed = Rc::new(RefCell::new(None));
        let mut request = FgFrameRequest::new(queue, FrameConstraints::new((32, 32)));
        let d = delivered.clone();
        request.bind_output(0, FgOutputBinding::Callback(Rc::new(move |storage, ok| {
            assert!(storage.is_some() && ok);
            *d.borrow_mut() += 1;
            true
        })));
        let c = completed.clone();
        request.on_complete(Box::new(move |ok| *c.borrow_mut() = Some(ok)));

        engine.submit_frame(request);
        pump(&device, &mut engine);

        assert_eq!(*delivered.borrow(), 1);
        assert_eq!(*completed.borrow(), Some(true));
        assert_eq!(engine.live_frame_count(), 0);
        // 图像回到缓存而非销毁
        assert_eq!(device.image_count(), 1);
    }

    #[test]
    fn test_unconsumed_output_retried() {
        let (device, mut engine) = test_engine();
        let queue = simple_queue(&device);

        let attempts = Rc::new(RefCell::new(0));
        let mut request = FgFrameRequest::new(queue, FrameConstraints::new((32, 32)));
        let a = attempts.clone();
        request.bind_output(0, FgOutputBinding::Callback(Rc::new(move |_, _| {
            *a.borrow_mut() += 1;
            // 第一次拒绝，第二次接受
            *a.borrow() >= 2
        })));

        engine.submit_frame(request);
        pump(&device, &mut engine);

        assert!(*attempts.borrow() >= 2);
        assert_eq!(engine.live_frame_count(), 0);
    }

    #[test]
    fn test_frame_waits_for_dependency_event() {
        let (device, mut engine) = test_engine();
        let queue = simple_queue(&device);

        let event = FgDependencyEvent::new();
        let mut request = FgFrameRequest::new(queue, FrameConstraints::new((32, 32)));
        request.wait_dependency(event.clone());
        let id = engine.submit_frame(request);

        pump(&device, &mut engine);
        // 依赖未 signal：帧保持存活且未提交
        assert_eq!(engine.live_frame_count(), 1);
        assert!(engine.frames.get(id).is_some());

        event.signal(true);
        pump(&device, &mut engine);
        assert_eq!(engine.live_frame_count(), 0);
    }

    #[test]
    fn test_failed_dependency_fails_frame() {
        let (device, mut engine) = test_engine();
        let queue = simple_queue(&device);

        let event = FgDependencyEvent::new();
        let completed = Rc::new(RefCell::new(None));
        let mut request = FgFrameRequest::new(queue, FrameConstraints::new((32, 32)));
        request.wait_dependency(event.clone());
        let c = completed.clone();
        request.on_complete(Box::new(move |ok| *c.borrow_mut() = Some(ok)));
        engine.submit_frame(request);

        event.signal(false);
        pump(&device, &mut engine);
        assert_eq!(*completed.borrow(), Some(false));
        assert_eq!(engine.live_frame_count(), 0);
    }

    #[test]
    fn test_frame_signals_dependency_on_completion() {
        let (device, mut engine) = test_engine();
        let queue = simple_queue(&device);

        let event = FgDependencyEvent::new();
        let mut request = FgFrameRequest::new(queue, FrameConstraints::new((32, 32)));
        request.signal_dependency(event.clone());
        engine.submit_frame(request);
        assert!(event.is_submitted());

        pump(&device, &mut engine);
        assert!(event.is_signaled());
        assert!(!event.is_failed());
    }

    #[test]
    fn test_ownership_serializes_frames_by_order() {
        let (device, mut engine) = test_engine();
        let queue = simple_queue(&device);

        let order: Rc<RefCell<Vec<u32>>> = Rc::new(RefCell::new(Vec::new()));
        for tag in 0..2u32 {
            let mut request = FgFrameRequest::new(queue.clone(), FrameConstraints::new((32, 32)));
            let o = order.clone();
            request.on_complete(Box::new(move |_| o.borrow_mut().push(tag)));
            engine.submit_frame(request);
        }
        pump(&device, &mut engine);

        assert_eq!(*order.borrow(), vec![0, 1]);
        // 两帧在飞期间各自持有图像
        assert_eq!(device.image_count(), 2);
    }

    #[test]
    fn test_async_prepare_round_trip() {
        let (device, mut engine) = test_engine();
        let mut builder = FgQueueBuilder::new("generic");
        builder.add_pass(FgPassNode::new("job", PassKind::Generic, 0));
        let queue = builder.prepare(device.as_ref());
        let queue_id = queue.id();

        // 先占住所有权，帧会停在 Ready，准备句柄可在此时替换
        engine.queue_runtimes.insert(
            queue_id,
            QueueRuntime { owner: Some(FrameId::default()), waiters: Vec::new() },
        );

        let completed = Rc::new(RefCell::new(None));
        let mut request = FgFrameRequest::new(queue, FrameConstraints::new((8, 8)));
        let c = completed.clone();
        request.on_complete(Box::new(move |ok| *c.borrow_mut() = Some(ok)));
        let id = engine.submit_frame(request);

        // 注入一个 worker 上的准备任务
        if let Some(Some(frame)) = engine.frames.get_mut(id) {
            frame.queues_mut()[0].set_pass_handle(
                0,
                Box::new(crate::pass_handle::GenericPassHandle::new().with_prepare(Box::new(|| true))),
            );
        }

        // 移交所有权
        if let Some(runtime) = engine.queue_runtimes.get_mut(&queue_id) {
            runtime.owner = Some(id);
            runtime.waiters.clear();
        }
        if let Some(Some(frame)) = engine.frames.get_mut(id) {
            frame.queues_mut()[0].set_owned(true);
        }

        pump(&device, &mut engine);
        assert_eq!(*completed.borrow(), Some(true));
    }

    #[test]
    fn test_failed_frame_notifies_output_binding() {
        let (device, mut engine) = test_engine();
        let queue = simple_queue(&device);
        device.fail_next_submit(vk::Result::ERROR_OUT_OF_DEVICE_MEMORY);

        let outcomes: Rc<RefCell<Vec<(bool, bool)>>> = Rc::new(RefCell::new(Vec::new()));
        let mut request = FgFrameRequest::new(queue, FrameConstraints::new((32, 32)));
        let o = outcomes.clone();
        request.bind_output(0, FgOutputBinding::Callback(Rc::new(move |storage, ok| {
            o.borrow_mut().push((storage.is_some(), ok));
            true
        })));
        engine.submit_frame(request);
        pump(&device, &mut engine);

        // 绑定被通知恰好一次：success=false，载体已被回收
        assert_eq!(engine.live_frame_count(), 0);
        assert_eq!(outcomes.borrow().as_slice(), &[(false, false)]);
    }

    #[test]
    fn test_update_nonblocking_with_outstanding_prepare() {
        let (device, mut engine) = test_engine();
        let mut builder = FgQueueBuilder::new("gate");
        builder.add_pass(FgPassNode::new("job", PassKind::Generic, 0));
        let queue = builder.prepare(device.as_ref());
        let queue_id = queue.id();

        // 先占住所有权，准备句柄可在帧停在 Ready 时替换
        engine.queue_runtimes.insert(
            queue_id,
            QueueRuntime { owner: Some(FrameId::default()), waiters: Vec::new() },
        );

        let completed = Rc::new(RefCell::new(None));
        let mut request = FgFrameRequest::new(queue, FrameConstraints::new((8, 8)));
        let c = completed.clone();
        request.on_complete(Box::new(move |ok| *c.borrow_mut() = Some(ok)));
        let id = engine.submit_frame(request);

        // worker 上的准备任务阻塞在 gate 上
        let (gate_tx, gate_rx) = crossbeam_channel::bounded::<()>(1);
        if let Some(Some(frame)) = engine.frames.get_mut(id) {
            frame.queues_mut()[0].set_pass_handle(
                0,
                Box::new(
                    crate::pass_handle::GenericPassHandle::new()
                        .with_prepare(Box::new(move || gate_rx.recv().is_ok())),
                ),
            );
        }
        if let Some(runtime) = engine.queue_runtimes.get_mut(&queue_id) {
            runtime.owner = Some(id);
            runtime.waiters.clear();
        }
        if let Some(Some(frame)) = engine.frames.get_mut(id) {
            frame.queues_mut()[0].set_owned(true);
        }
        engine.update();

        // 准备在途：update 立即返回而不是等待 worker
        let started = Instant::now();
        engine.update();
        assert!(started.elapsed() < Duration::from_millis(50));

        gate_tx.send(()).ok();
        pump(&device, &mut engine);
        assert_eq!(*completed.borrow(), Some(true));
    }

    #[test]
    fn test_device_submit_failure_fails_frame() {
        let (device, mut engine) = test_engine();
        let queue = simple_queue(&device);
        device.fail_next_submit(vk::Result::ERROR_OUT_OF_DEVICE_MEMORY);

        let completed = Rc::new(RefCell::new(None));
        let mut request = FgFrameRequest::new(queue, FrameConstraints::new((32, 32)));
        let c = completed.clone();
        request.on_complete(Box::new(move |ok| *c.borrow_mut() = Some(ok)));
        engine.submit_frame(request);

        pump(&device, &mut engine);
        assert_eq!(*completed.borrow(), Some(false));
        assert_eq!(engine.live_frame_count(), 0);
    }

    #[test]
    fn test_device_lost_invalidates_generation() {
        let (device, mut engine) = test_engine();
        let queue = simple_queue(&device);
        device.fail_next_submit(vk::Result::ERROR_DEVICE_LOST);

        let completed = Rc::new(RefCell::new(None));
        let mut request = FgFrameRequest::new(queue, FrameConstraints::new((32, 32)));
        let c = completed.clone();
        request.on_complete(Box::new(move |ok| *c.borrow_mut() = Some(ok)));
        engine.submit_frame(request);

        let generation = engine.emitter_mut().generation();
        pump(&device, &mut engine);

        assert_eq!(*completed.borrow(), Some(false));
        assert_eq!(engine.emitter_mut().generation(), generation + 1);
    }

    #[test]
    fn test_invalidate_all_fails_live_frames() {
        let (device, mut engine) = test_engine();
        let queue = simple_queue(&device);

        let completed = Rc::new(RefCell::new(None));
        let mut request = FgFrameRequest::new(queue, FrameConstraints::new((32, 32)));
        let c = completed.clone();
        request.on_complete(Box::new(move |ok| *c.borrow_mut() = Some(ok)));
        engine.submit_frame(request);
        engine.run_until_settled();

        let generation = engine.emitter_mut().generation();
        engine.invalidate_all();
        pump(&device, &mut engine);

        assert_eq!(*completed.borrow(), Some(false));
        assert_eq!(engine.emitter_mut().generation(), generation + 1);
        assert_eq!(engine.live_frame_count(), 0);
    }
}
