//! 带逻辑状态的信号量包装
//!
//! 设备只负责分配句柄；signaled / waited 的记账在这里。
//! `FgImageStorage` 的轮换规则依赖这两个标记。

use kestrel_gfx::device::GfxDevice;
use kestrel_gfx::handles::GfxSemaphoreHandle;

/// 逻辑信号量
///
/// 不变量：一帧内同一个信号量不会既被 signal 又被 wait。
#[derive(Debug)]
pub struct FgSemaphore {
    handle: GfxSemaphoreHandle,
    signaled: bool,
    waited: bool,
}

// new & destroy
impl FgSemaphore {
    pub fn new(device: &dyn GfxDevice, debug_name: &str) -> Option<Self> {
        let handle = device.make_semaphore(debug_name)?;
        Some(Self { handle, signaled: false, waited: false })
    }

    #[inline]
    pub fn destroy(self, device: &dyn GfxDevice) {
        device.destroy_semaphore(self.handle);
    }
}

// getters
impl FgSemaphore {
    #[inline]
    pub fn handle(&self) -> GfxSemaphoreHandle {
        self.handle
    }

    #[inline]
    pub fn signaled(&self) -> bool {
        self.signaled
    }

    #[inline]
    pub fn waited(&self) -> bool {
        self.waited
    }

    /// 已 signal 但尚未被 wait
    #[inline]
    pub fn signaled_unwaited(&self) -> bool {
        self.signaled && !self.waited
    }
}

// 状态记账
impl FgSemaphore {
    #[inline]
    pub fn mark_signaled(&mut self) {
        self.signaled = true;
    }

    #[inline]
    pub fn mark_waited(&mut self) {
        self.waited = true;
    }

    /// 轮换时复用：清掉两个标记
    #[inline]
    pub fn reset(&mut self) {
        self.signaled = false;
        self.waited = false;
    }
}
