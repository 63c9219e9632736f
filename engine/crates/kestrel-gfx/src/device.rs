//! 设备能力面
//!
//! 帧图引擎消费的全部设备能力都在 [`GfxDevice`] 上：创建/销毁资源、
//! fence 查询、descriptor 能力查询、队列提交。实现方可以是真实驱动的
//! 封装，也可以是 `virtual_device::VirtualDevice` 这样的纯软件实现。
//!
//! 所有方法只允许在 loop 线程调用。

use ash::vk;

use crate::handles::{
    GfxFenceHandle, GfxFramebufferHandle, GfxImageHandle, GfxImageViewHandle, GfxRenderPassId, GfxSemaphoreHandle,
};
use crate::image_info::{GfxImageInfo, GfxImageViewInfo};
use crate::submit_info::GfxSubmitInfo;

/// 设备能力 trait
///
/// 失败以 `None`（创建类）或非 SUCCESS 的 `vk::Result`（提交类）表达，
/// 实现方不得 panic。
pub trait GfxDevice {
    // ============ 资源创建与销毁 ============

    fn make_image(&self, info: &GfxImageInfo, debug_name: &str) -> Option<GfxImageHandle>;
    fn destroy_image(&self, image: GfxImageHandle);

    fn make_image_view(
        &self,
        image: GfxImageHandle,
        info: &GfxImageViewInfo,
        debug_name: &str,
    ) -> Option<GfxImageViewHandle>;
    fn destroy_image_view(&self, view: GfxImageViewHandle);

    fn make_framebuffer(
        &self,
        render_pass: GfxRenderPassId,
        views: &[GfxImageViewHandle],
        extent: (u32, u32),
        debug_name: &str,
    ) -> Option<GfxFramebufferHandle>;
    fn destroy_framebuffer(&self, framebuffer: GfxFramebufferHandle);

    fn make_semaphore(&self, debug_name: &str) -> Option<GfxSemaphoreHandle>;
    fn destroy_semaphore(&self, semaphore: GfxSemaphoreHandle);

    /// # param
    /// * signaled - 是否创建时就 signaled
    fn make_fence(&self, signaled: bool, debug_name: &str) -> Option<GfxFenceHandle>;
    fn destroy_fence(&self, fence: GfxFenceHandle);

    // ============ 查询 ============

    fn fence_signaled(&self, fence: GfxFenceHandle) -> bool;
    fn reset_fence(&self, fence: GfxFenceHandle);

    /// 视图所属图像的尺寸（用于 pass extent 校验）
    fn image_view_extent(&self, view: GfxImageViewHandle) -> Option<(u32, u32)>;

    fn supports_update_after_bind(&self, descriptor_type: vk::DescriptorType) -> bool;

    /// 设备支持的 depth-stencil 格式集合
    fn supported_depth_stencil_formats(&self) -> Vec<vk::Format>;

    // ============ 提交 ============

    fn submit(&self, info: GfxSubmitInfo) -> vk::Result;

    // ============ 默认实现 ============

    /// 从候选列表中选出第一个设备支持的 depth-stencil 格式
    fn pick_depth_stencil_format(&self, candidates: &[vk::Format]) -> Option<vk::Format> {
        let supported = self.supported_depth_stencil_formats();
        candidates.iter().copied().find(|f| supported.contains(f))
    }
}

/// 设备队列
///
/// 串行化所有提交并缓存最近一次结果；device-lost 一经发现即被记住，
/// 由上层（Emitter）决定是否整体失效。
pub struct GfxDeviceQueue {
    last_result: vk::Result,
    device_lost: bool,
    submit_count: u64,
}

impl Default for GfxDeviceQueue {
    fn default() -> Self {
        Self::new()
    }
}

// new & init
impl GfxDeviceQueue {
    pub fn new() -> Self {
        Self {
            last_result: vk::Result::SUCCESS,
            device_lost: false,
            submit_count: 0,
        }
    }
}

// 提交
impl GfxDeviceQueue {
    /// 提交一个命令流
    ///
    /// 返回 false 表示提交失败；失败的结果码会被缓存，调用方据此使当前帧失效。
    pub fn submit(&mut self, device: &dyn GfxDevice, info: GfxSubmitInfo) -> bool {
        if self.device_lost {
            log::error!("GfxDeviceQueue: submit after device lost");
            return false;
        }

        let result = device.submit(info);
        self.last_result = result;
        self.submit_count += 1;

        match result {
            vk::Result::SUCCESS => true,
            vk::Result::ERROR_DEVICE_LOST => {
                self.device_lost = true;
                log::error!("GfxDeviceQueue: device lost");
                false
            }
            err => {
                log::error!("GfxDeviceQueue: submit failed: {:?}", err);
                false
            }
        }
    }
}

// getters
impl GfxDeviceQueue {
    #[inline]
    pub fn last_result(&self) -> vk::Result {
        self.last_result
    }

    #[inline]
    pub fn device_lost(&self) -> bool {
        self.device_lost
    }

    #[inline]
    pub fn submit_count(&self) -> u64 {
        self.submit_count
    }
}
