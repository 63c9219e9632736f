//! 逐帧图像载体
//!
//! 一个设备图像 + 它派生出的视图 + 当前 layout + 一对 wait/signal 信号量槽。
//! 归属要么是某个 FrameHandle，要么是 FgFrameCache；所有权转移只发生在
//! loop 线程上。

use std::cell::RefCell;
use std::collections::HashMap;
use std::rc::Rc;

use ash::vk;
use kestrel_gfx::device::GfxDevice;
use kestrel_gfx::handles::{GfxImageHandle, GfxImageViewHandle};
use kestrel_gfx::image_info::{GfxImageInfo, GfxImageViewInfo};

use crate::semaphore::FgSemaphore;

/// loop 线程内共享的图像载体
pub type FgImageStorageRef = Rc<RefCell<FgImageStorage>>;

/// 图像载体
///
/// 不变量：
/// - `wait_sem` 被设置时，下一个读者在提交里 wait 它
/// - `signal_sem` 被设置时，下一个写者在提交里 signal 它
/// - 新获取的图像 `layout == UNDEFINED`
pub struct FgImageStorage {
    image: GfxImageHandle,
    info: GfxImageInfo,
    views: HashMap<GfxImageViewInfo, GfxImageViewHandle>,
    layout: vk::ImageLayout,

    wait_sem: Option<FgSemaphore>,
    signal_sem: Option<FgSemaphore>,

    ready: bool,
    ready_waiters: Vec<Box<dyn FnOnce(bool)>>,

    /// 绑定到 swapchain 的图像不可进入缓存
    swapchain_bound: bool,
}

// new & init
impl FgImageStorage {
    pub fn new(image: GfxImageHandle, info: GfxImageInfo) -> Self {
        Self {
            image,
            info,
            views: HashMap::new(),
            layout: vk::ImageLayout::UNDEFINED,
            wait_sem: None,
            signal_sem: None,
            ready: true,
            ready_waiters: Vec::new(),
            swapchain_bound: false,
        }
    }

    /// 外部 swapchain 图像的载体（不可缓存）
    pub fn new_swapchain(image: GfxImageHandle, info: GfxImageInfo) -> Self {
        let mut storage = Self::new(image, info);
        storage.swapchain_bound = true;
        storage
    }

    pub fn new_ref(image: GfxImageHandle, info: GfxImageInfo) -> FgImageStorageRef {
        Rc::new(RefCell::new(Self::new(image, info)))
    }
}

// getters
impl FgImageStorage {
    #[inline]
    pub fn image(&self) -> GfxImageHandle {
        self.image
    }

    #[inline]
    pub fn info(&self) -> &GfxImageInfo {
        &self.info
    }

    #[inline]
    pub fn layout(&self) -> vk::ImageLayout {
        self.layout
    }

    #[inline]
    pub fn is_ready(&self) -> bool {
        self.ready
    }

    #[inline]
    pub fn swapchain_bound(&self) -> bool {
        self.swapchain_bound
    }

    #[inline]
    pub fn wait_sem(&self) -> Option<&FgSemaphore> {
        self.wait_sem.as_ref()
    }

    #[inline]
    pub fn wait_sem_mut(&mut self) -> Option<&mut FgSemaphore> {
        self.wait_sem.as_mut()
    }

    #[inline]
    pub fn signal_sem(&self) -> Option<&FgSemaphore> {
        self.signal_sem.as_ref()
    }

    #[inline]
    pub fn signal_sem_mut(&mut self) -> Option<&mut FgSemaphore> {
        self.signal_sem.as_mut()
    }
}

// 视图
impl FgImageStorage {
    /// 已缓存的视图
    #[inline]
    pub fn get_view(&self, info: &GfxImageViewInfo) -> Option<GfxImageViewHandle> {
        self.views.get(info).copied()
    }

    /// 获取或创建视图（创建推迟到设备）
    pub fn make_view(&mut self, device: &dyn GfxDevice, info: &GfxImageViewInfo) -> Option<GfxImageViewHandle> {
        if let Some(view) = self.views.get(info) {
            return Some(*view);
        }
        let view = device.make_image_view(self.image, info, "storage-view")?;
        self.views.insert(*info, view);
        Some(view)
    }

    /// 当前全部视图句柄
    pub fn view_handles(&self) -> Vec<GfxImageViewHandle> {
        self.views.values().copied().collect()
    }
}

// layout 与就绪
impl FgImageStorage {
    #[inline]
    pub fn set_layout(&mut self, layout: vk::ImageLayout) {
        self.layout = layout;
    }

    /// 标记就绪与否；就绪时逐个唤醒等待者
    pub fn set_ready(&mut self, ready: bool) {
        self.ready = ready;
        if ready {
            for waiter in self.ready_waiters.drain(..) {
                waiter(true);
            }
        }
    }

    /// 就绪则立即回调，否则挂起
    pub fn wait_ready(&mut self, cb: Box<dyn FnOnce(bool)>) {
        if self.ready {
            cb(true);
        } else {
            self.ready_waiters.push(cb);
        }
    }

    /// 失败路径：以 success=false 唤醒全部等待者
    pub fn fail_waiters(&mut self) {
        for waiter in self.ready_waiters.drain(..) {
            waiter(false);
        }
    }
}

// 信号量槽
impl FgImageStorage {
    #[inline]
    pub fn set_wait_sem(&mut self, sem: Option<FgSemaphore>) {
        debug_assert!(self.wait_sem.is_none());
        self.wait_sem = sem;
    }

    #[inline]
    pub fn set_signal_sem(&mut self, sem: Option<FgSemaphore>) {
        debug_assert!(self.signal_sem.is_none());
        self.signal_sem = sem;
    }

    /// 释放两个信号量槽（不再轮换时）
    pub fn release_semaphores(&mut self, device: &dyn GfxDevice) {
        if let Some(sem) = self.wait_sem.take() {
            sem.destroy(device);
        }
        if let Some(sem) = self.signal_sem.take() {
            sem.destroy(device);
        }
    }

    /// 帧结束后的信号量轮换
    ///
    /// 设 W = wait_sem，S = signal_sem：
    /// - W 在本帧被 wait 过：新 S := W（重置）；旧 S 若 signaled 且未被 wait，
    ///   新 W := 旧 S，否则新 W := 空
    /// - W 为空且旧 S signaled 未 wait：W := 旧 S，S := 新建
    /// - 其余情况：S := 新建
    pub fn rearm_semaphores(&mut self, device: &dyn GfxDevice) {
        let wait = self.wait_sem.take();
        let signal = self.signal_sem.take();

        match wait {
            Some(mut w) if w.waited() => {
                w.reset();
                match signal {
                    Some(s) if s.signaled_unwaited() => self.wait_sem = Some(s),
                    Some(s) => s.destroy(device),
                    None => {}
                }
                self.signal_sem = Some(w);
            }
            None if signal.as_ref().is_some_and(|s| s.signaled_unwaited()) => {
                self.wait_sem = signal;
                self.signal_sem = FgSemaphore::new(device, "storage-signal");
            }
            wait => {
                self.wait_sem = wait;
                if let Some(s) = signal {
                    s.destroy(device);
                }
                self.signal_sem = FgSemaphore::new(device, "storage-signal");
            }
        }
    }

    /// 缓存回收时的整体销毁
    pub fn destroy(&mut self, device: &dyn GfxDevice) {
        self.release_semaphores(device);
        for (_, view) in self.views.drain() {
            device.destroy_image_view(view);
        }
        device.destroy_image(self.image);
    }
}
