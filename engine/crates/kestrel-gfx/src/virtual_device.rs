//! 纯软件设备
//!
//! `VirtualDevice` 用 slotmap 池模拟全部设备对象，提交进入一个待完成队列，
//! 由调用方手动推进（`complete_next_submit` / `complete_all_submits`）。
//! 测试和 headless 运行都使用它；不涉及任何驱动。

use std::cell::RefCell;
use std::collections::VecDeque;

use ash::vk;
use slotmap::SlotMap;

use crate::device::GfxDevice;
use crate::handles::{
    GfxFenceHandle, GfxFramebufferHandle, GfxImageHandle, GfxImageViewHandle, GfxRenderPassId, GfxSemaphoreHandle,
};
use crate::image_info::{GfxImageInfo, GfxImageViewInfo};
use crate::submit_info::GfxSubmitInfo;

/// 虚拟图像对象
struct VirtualImage {
    info: GfxImageInfo,
    #[allow(dead_code)]
    name: String,
}

/// 虚拟视图对象
struct VirtualImageView {
    image: GfxImageHandle,
    #[allow(dead_code)]
    info: GfxImageViewInfo,
}

/// 虚拟 framebuffer 对象
struct VirtualFramebuffer {
    #[allow(dead_code)]
    render_pass: GfxRenderPassId,
    #[allow(dead_code)]
    views: Vec<GfxImageViewHandle>,
    #[allow(dead_code)]
    extent: (u32, u32),
}

/// 已受理、尚未"执行完"的提交
#[derive(Clone)]
pub struct PendingSubmit {
    pub info: GfxSubmitInfo,
}

#[derive(Default)]
struct VirtualDeviceState {
    images: SlotMap<GfxImageHandle, VirtualImage>,
    image_views: SlotMap<GfxImageViewHandle, VirtualImageView>,
    framebuffers: SlotMap<GfxFramebufferHandle, VirtualFramebuffer>,
    semaphores: SlotMap<GfxSemaphoreHandle, ()>,
    fences: SlotMap<GfxFenceHandle, bool>,

    pending_submits: VecDeque<PendingSubmit>,
    completed_submits: Vec<PendingSubmit>,

    // 故障注入
    fail_next_submit: Option<vk::Result>,
    fail_allocations: bool,
}

/// 软件设备
#[derive(Default)]
pub struct VirtualDevice {
    state: RefCell<VirtualDeviceState>,
}

// new & init
impl VirtualDevice {
    pub fn new() -> Self {
        Self::default()
    }
}

// 测试驱动：推进提交、故障注入
impl VirtualDevice {
    /// 完成最早的一个待完成提交，signal 它的 fence
    ///
    /// 返回 false 表示没有待完成的提交。
    pub fn complete_next_submit(&self) -> bool {
        let mut state = self.state.borrow_mut();
        let Some(submit) = state.pending_submits.pop_front() else {
            return false;
        };
        if let Some(fence) = submit.info.fence {
            if let Some(signaled) = state.fences.get_mut(fence) {
                *signaled = true;
            }
        }
        state.completed_submits.push(submit);
        true
    }

    /// 完成全部待完成提交
    pub fn complete_all_submits(&self) {
        while self.complete_next_submit() {}
    }

    /// 下一次 submit 返回给定错误码
    pub fn fail_next_submit(&self, result: vk::Result) {
        self.state.borrow_mut().fail_next_submit = Some(result);
    }

    /// 令后续所有资源创建失败（模拟资源耗尽）
    pub fn set_fail_allocations(&self, fail: bool) {
        self.state.borrow_mut().fail_allocations = fail;
    }
}

// 测试观察：对象计数、提交记录
impl VirtualDevice {
    pub fn image_count(&self) -> usize {
        self.state.borrow().images.len()
    }
    pub fn image_view_count(&self) -> usize {
        self.state.borrow().image_views.len()
    }
    pub fn framebuffer_count(&self) -> usize {
        self.state.borrow().framebuffers.len()
    }
    pub fn semaphore_count(&self) -> usize {
        self.state.borrow().semaphores.len()
    }
    pub fn fence_count(&self) -> usize {
        self.state.borrow().fences.len()
    }
    pub fn pending_submit_count(&self) -> usize {
        self.state.borrow().pending_submits.len()
    }
    pub fn completed_submit_count(&self) -> usize {
        self.state.borrow().completed_submits.len()
    }

    /// 第 index 个已完成提交的拷贝
    pub fn completed_submit(&self, index: usize) -> Option<PendingSubmit> {
        self.state.borrow().completed_submits.get(index).cloned()
    }

    /// 第 index 个待完成提交的拷贝
    pub fn pending_submit(&self, index: usize) -> Option<PendingSubmit> {
        self.state.borrow().pending_submits.get(index).cloned()
    }
}

impl GfxDevice for VirtualDevice {
    fn make_image(&self, info: &GfxImageInfo, name: &str) -> Option<GfxImageHandle> {
        let mut state = self.state.borrow_mut();
        if state.fail_allocations {
            log::error!("VirtualDevice: image allocation failed ({name})");
            return None;
        }
        Some(state.images.insert(VirtualImage { info: *info, name: name.to_string() }))
    }

    fn destroy_image(&self, image: GfxImageHandle) {
        if self.state.borrow_mut().images.remove(image).is_none() {
            log::error!("VirtualDevice: destroy of unknown image {image:?}");
        }
    }

    fn make_image_view(
        &self,
        image: GfxImageHandle,
        info: &GfxImageViewInfo,
        name: &str,
    ) -> Option<GfxImageViewHandle> {
        let mut state = self.state.borrow_mut();
        if state.fail_allocations {
            log::error!("VirtualDevice: image view allocation failed ({name})");
            return None;
        }
        if !state.images.contains_key(image) {
            log::error!("VirtualDevice: view of unknown image {image:?} ({name})");
            return None;
        }
        Some(state.image_views.insert(VirtualImageView { image, info: *info }))
    }

    fn destroy_image_view(&self, view: GfxImageViewHandle) {
        if self.state.borrow_mut().image_views.remove(view).is_none() {
            log::error!("VirtualDevice: destroy of unknown image view {view:?}");
        }
    }

    fn make_framebuffer(
        &self,
        render_pass: GfxRenderPassId,
        views: &[GfxImageViewHandle],
        extent: (u32, u32),
        name: &str,
    ) -> Option<GfxFramebufferHandle> {
        let mut state = self.state.borrow_mut();
        if state.fail_allocations {
            log::error!("VirtualDevice: framebuffer allocation failed ({name})");
            return None;
        }
        for view in views {
            if !state.image_views.contains_key(*view) {
                log::error!("VirtualDevice: framebuffer references unknown view {view:?} ({name})");
                return None;
            }
        }
        Some(state.framebuffers.insert(VirtualFramebuffer {
            render_pass,
            views: views.to_vec(),
            extent,
        }))
    }

    fn destroy_framebuffer(&self, framebuffer: GfxFramebufferHandle) {
        if self.state.borrow_mut().framebuffers.remove(framebuffer).is_none() {
            log::error!("VirtualDevice: destroy of unknown framebuffer {framebuffer:?}");
        }
    }

    fn make_semaphore(&self, _name: &str) -> Option<GfxSemaphoreHandle> {
        let mut state = self.state.borrow_mut();
        if state.fail_allocations {
            return None;
        }
        Some(state.semaphores.insert(()))
    }

    fn destroy_semaphore(&self, semaphore: GfxSemaphoreHandle) {
        if self.state.borrow_mut().semaphores.remove(semaphore).is_none() {
            log::error!("VirtualDevice: destroy of unknown semaphore {semaphore:?}");
        }
    }

    fn make_fence(&self, signaled: bool, _name: &str) -> Option<GfxFenceHandle> {
        let mut state = self.state.borrow_mut();
        if state.fail_allocations {
            return None;
        }
        Some(state.fences.insert(signaled))
    }

    fn destroy_fence(&self, fence: GfxFenceHandle) {
        if self.state.borrow_mut().fences.remove(fence).is_none() {
            log::error!("VirtualDevice: destroy of unknown fence {fence:?}");
        }
    }

    fn fence_signaled(&self, fence: GfxFenceHandle) -> bool {
        self.state.borrow().fences.get(fence).copied().unwrap_or(false)
    }

    fn reset_fence(&self, fence: GfxFenceHandle) {
        if let Some(signaled) = self.state.borrow_mut().fences.get_mut(fence) {
            *signaled = false;
        }
    }

    fn image_view_extent(&self, view: GfxImageViewHandle) -> Option<(u32, u32)> {
        let state = self.state.borrow();
        let view = state.image_views.get(view)?;
        state.images.get(view.image).map(|img| img.info.extent())
    }

    fn supports_update_after_bind(&self, descriptor_type: vk::DescriptorType) -> bool {
        // 软件设备宣称支持常见的 bindless 更新路径
        matches!(
            descriptor_type,
            vk::DescriptorType::SAMPLED_IMAGE
                | vk::DescriptorType::COMBINED_IMAGE_SAMPLER
                | vk::DescriptorType::STORAGE_IMAGE
                | vk::DescriptorType::STORAGE_BUFFER
        )
    }

    fn supported_depth_stencil_formats(&self) -> Vec<vk::Format> {
        vec![vk::Format::D32_SFLOAT, vk::Format::D24_UNORM_S8_UINT, vk::Format::D32_SFLOAT_S8_UINT]
    }

    fn submit(&self, info: GfxSubmitInfo) -> vk::Result {
        let mut state = self.state.borrow_mut();
        if let Some(result) = state.fail_next_submit.take() {
            return result;
        }
        state.pending_submits.push_back(PendingSubmit { info });
        vk::Result::SUCCESS
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::command::GfxCommandList;

    #[test]
    fn test_submit_completion_signals_fence() {
        let device = VirtualDevice::new();
        let fence = device.make_fence(false, "t").unwrap();

        let info = GfxSubmitInfo::new(GfxCommandList::new()).with_fence(fence);
        assert_eq!(device.submit(info), vk::Result::SUCCESS);
        assert!(!device.fence_signaled(fence));

        assert!(device.complete_next_submit());
        assert!(device.fence_signaled(fence));
        assert!(!device.complete_next_submit());
    }

    #[test]
    fn test_allocation_failure_injection() {
        let device = VirtualDevice::new();
        device.set_fail_allocations(true);
        assert!(device.make_image(&GfxImageInfo::default(), "t").is_none());
        device.set_fail_allocations(false);
        assert!(device.make_image(&GfxImageInfo::default(), "t").is_some());
    }

    #[test]
    fn test_pick_depth_stencil_format() {
        let device = VirtualDevice::new();
        let picked = device.pick_depth_stencil_format(&[vk::Format::D16_UNORM, vk::Format::D24_UNORM_S8_UINT]);
        assert_eq!(picked, Some(vk::Format::D24_UNORM_S8_UINT));
    }
}
