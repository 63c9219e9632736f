//! 帧缓存
//!
//! 帧与帧之间复用三类对象：framebuffer、图像载体、以及它们的可达性
//! 记账。framebuffer 只有在其 render pass 与全部视图都仍然存活时才可
//! 获取（可达性）；任何一方被移除，引用它的 framebuffer 进入两段式
//! autorelease，在下一次 `clear` 时真正销毁。

use std::collections::{HashMap, HashSet};

use ash::vk;
use kestrel_gfx::device::GfxDevice;
use kestrel_gfx::handles::{GfxFramebufferHandle, GfxImageViewHandle, GfxRenderPassId};
use kestrel_gfx::image_info::GfxImageInfo;

use crate::image_storage::{FgImageStorage, FgImageStorageRef};

/// framebuffer 的复用 key
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct FramebufferKey {
    pub render_pass: GfxRenderPassId,
    pub views: Vec<GfxImageViewHandle>,
    pub extent: (u32, u32),
}

/// 帧缓存
pub struct FgFrameCache {
    live_views: HashSet<GfxImageViewHandle>,
    live_render_passes: HashSet<GfxRenderPassId>,

    free_framebuffers: HashMap<FramebufferKey, Vec<GfxFramebufferHandle>>,
    framebuffer_keys: HashMap<GfxFramebufferHandle, FramebufferKey>,
    /// 已不可达、等待 `clear` 销毁的 framebuffer
    autorelease: Vec<GfxFramebufferHandle>,

    free_images: HashMap<GfxImageInfo, Vec<FgImageStorageRef>>,
}

// new & init
impl FgFrameCache {
    pub fn new() -> Self {
        Self {
            live_views: HashSet::new(),
            live_render_passes: HashSet::new(),
            free_framebuffers: HashMap::new(),
            framebuffer_keys: HashMap::new(),
            autorelease: Vec::new(),
            free_images: HashMap::new(),
        }
    }
}

impl Default for FgFrameCache {
    fn default() -> Self {
        Self::new()
    }
}

// 可达性记账
impl FgFrameCache {
    #[inline]
    pub fn register_view(&mut self, view: GfxImageViewHandle) {
        self.live_views.insert(view);
    }

    #[inline]
    pub fn register_render_pass(&mut self, render_pass: GfxRenderPassId) {
        self.live_render_passes.insert(render_pass);
    }

    /// 移除视图；引用它的空闲 framebuffer 转入 autorelease
    pub fn remove_view(&mut self, view: GfxImageViewHandle) {
        self.live_views.remove(&view);
        self.defer_unreachable();
    }

    /// 移除 render pass；引用它的空闲 framebuffer 转入 autorelease
    pub fn remove_render_pass(&mut self, render_pass: GfxRenderPassId) {
        self.live_render_passes.remove(&render_pass);
        self.defer_unreachable();
    }

    fn is_reachable(&self, key: &FramebufferKey) -> bool {
        self.live_render_passes.contains(&key.render_pass) && key.views.iter().all(|v| self.live_views.contains(v))
    }

    /// 把空闲列表中不可达的 framebuffer 移入 autorelease
    fn defer_unreachable(&mut self) {
        let mut dead_keys = Vec::new();
        for (key, handles) in &self.free_framebuffers {
            if !self.is_reachable(key) {
                dead_keys.push((key.clone(), handles.clone()));
            }
        }
        for (key, handles) in dead_keys {
            self.free_framebuffers.remove(&key);
            for handle in handles {
                self.framebuffer_keys.remove(&handle);
                self.autorelease.push(handle);
            }
        }
    }
}

// framebuffer
impl FgFrameCache {
    /// 获取（或创建）framebuffer
    ///
    /// render pass 或任一视图不可达时拒绝并返回 None。
    pub fn acquire_framebuffer(
        &mut self,
        device: &dyn GfxDevice,
        render_pass: GfxRenderPassId,
        views: Vec<GfxImageViewHandle>,
        extent: (u32, u32),
    ) -> Option<GfxFramebufferHandle> {
        let key = FramebufferKey { render_pass, views, extent };
        if !self.is_reachable(&key) {
            log::error!("FgFrameCache: acquire_framebuffer with unreachable render pass or views");
            return None;
        }

        if let Some(handle) = self.free_framebuffers.get_mut(&key).and_then(Vec::pop) {
            return Some(handle);
        }

        let handle = device.make_framebuffer(key.render_pass, &key.views, key.extent, "cache-framebuffer")?;
        self.framebuffer_keys.insert(handle, key);
        Some(handle)
    }

    /// 归还 framebuffer；key 已不可达则直接进 autorelease
    pub fn release_framebuffer(&mut self, framebuffer: GfxFramebufferHandle) {
        let Some(key) = self.framebuffer_keys.get(&framebuffer).cloned() else {
            log::error!("FgFrameCache: release of unknown framebuffer");
            return;
        };
        if !self.is_reachable(&key) {
            self.framebuffer_keys.remove(&framebuffer);
            self.autorelease.push(framebuffer);
            return;
        }
        let list = self.free_framebuffers.entry(key).or_default();
        if list.contains(&framebuffer) {
            log::error!("FgFrameCache: double release of framebuffer");
            return;
        }
        list.push(framebuffer);
    }

    /// 第二段：销毁全部 autorelease 中的 framebuffer
    pub fn clear(&mut self, device: &dyn GfxDevice) {
        for handle in self.autorelease.drain(..) {
            device.destroy_framebuffer(handle);
        }
    }

    #[inline]
    pub fn autorelease_count(&self) -> usize {
        self.autorelease.len()
    }

    #[inline]
    pub fn free_framebuffer_count(&self) -> usize {
        self.free_framebuffers.values().map(Vec::len).sum()
    }
}

// 图像载体
impl FgFrameCache {
    /// 按描述获取兼容的图像载体；无空闲则新建
    ///
    /// 复用的载体会轮换信号量并把 layout 重置为 UNDEFINED。
    pub fn acquire_image(&mut self, device: &dyn GfxDevice, info: &GfxImageInfo) -> Option<FgImageStorageRef> {
        if let Some(storage) = self.free_images.get_mut(info).and_then(Vec::pop) {
            {
                let mut inner = storage.borrow_mut();
                inner.rearm_semaphores(device);
                inner.set_layout(vk::ImageLayout::UNDEFINED);
                inner.set_ready(true);
                for view in inner.view_handles() {
                    self.live_views.insert(view);
                }
            }
            return Some(storage);
        }

        let image = device.make_image(info, "cache-image")?;
        Some(FgImageStorage::new_ref(image, *info))
    }

    /// 归还图像载体
    ///
    /// swapchain 绑定的载体不进缓存；重复归还被拒绝。
    pub fn release_image(&mut self, storage: FgImageStorageRef) {
        let info = {
            let inner = storage.borrow();
            if inner.swapchain_bound() {
                return;
            }
            *inner.info()
        };

        let list = self.free_images.entry(info).or_default();
        if list.iter().any(|s| std::rc::Rc::ptr_eq(s, &storage)) {
            log::error!("FgFrameCache: double release of image storage");
            return;
        }
        list.push(storage);
    }

    #[inline]
    pub fn free_image_count(&self) -> usize {
        self.free_images.values().map(Vec::len).sum()
    }

    /// 整体销毁（引擎关闭）
    pub fn destroy(&mut self, device: &dyn GfxDevice) {
        self.clear(device);
        for (_, handles) in self.free_framebuffers.drain() {
            for handle in handles {
                self.framebuffer_keys.remove(&handle);
                device.destroy_framebuffer(handle);
            }
        }
        for (_, storages) in self.free_images.drain() {
            for storage in storages {
                storage.borrow_mut().destroy(device);
            }
        }
        self.live_views.clear();
        self.live_render_passes.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use kestrel_gfx::virtual_device::VirtualDevice;

    fn setup() -> (VirtualDevice, FgFrameCache) {
        (VirtualDevice::new(), FgFrameCache::new())
    }

    fn make_view(device: &VirtualDevice, cache: &mut FgFrameCache) -> GfxImageViewHandle {
        let info = GfxImageInfo::new_2d(8, 8, vk::Format::R8G8B8A8_UNORM, vk::ImageUsageFlags::COLOR_ATTACHMENT);
        let image = device.make_image(&info, "t").unwrap();
        let view = device.make_image_view(image, &info.infer_default_view(), "tv").unwrap();
        cache.register_view(view);
        view
    }

    #[test]
    fn test_unreachable_framebuffer_rejected() {
        let (device, mut cache) = setup();
        let view = make_view(&device, &mut cache);
        let rp = GfxRenderPassId(1);
        // render pass 未注册
        assert!(cache.acquire_framebuffer(&device, rp, vec![view], (8, 8)).is_none());

        cache.register_render_pass(rp);
        assert!(cache.acquire_framebuffer(&device, rp, vec![view], (8, 8)).is_some());
    }

    #[test]
    fn test_framebuffer_reuse() {
        let (device, mut cache) = setup();
        let view = make_view(&device, &mut cache);
        let rp = GfxRenderPassId(1);
        cache.register_render_pass(rp);

        let fb = cache.acquire_framebuffer(&device, rp, vec![view], (8, 8)).unwrap();
        cache.release_framebuffer(fb);
        let fb2 = cache.acquire_framebuffer(&device, rp, vec![view], (8, 8)).unwrap();
        assert_eq!(fb, fb2);
        assert_eq!(device.framebuffer_count(), 1);
    }

    #[test]
    fn test_removed_view_defers_framebuffer() {
        let (device, mut cache) = setup();
        let view = make_view(&device, &mut cache);
        let rp = GfxRenderPassId(1);
        cache.register_render_pass(rp);

        let fb = cache.acquire_framebuffer(&device, rp, vec![view], (8, 8)).unwrap();
        cache.release_framebuffer(fb);
        cache.remove_view(view);

        // 第一段：只转入 autorelease，不销毁
        assert_eq!(cache.free_framebuffer_count(), 0);
        assert_eq!(cache.autorelease_count(), 1);
        assert_eq!(device.framebuffer_count(), 1);

        // 第二段：clear 时销毁
        cache.clear(&device);
        assert_eq!(cache.autorelease_count(), 0);
        assert_eq!(device.framebuffer_count(), 0);
    }

    #[test]
    fn test_release_to_unreachable_key_goes_to_autorelease() {
        let (device, mut cache) = setup();
        let view = make_view(&device, &mut cache);
        let rp = GfxRenderPassId(1);
        cache.register_render_pass(rp);

        let fb = cache.acquire_framebuffer(&device, rp, vec![view], (8, 8)).unwrap();
        cache.remove_render_pass(rp);
        cache.release_framebuffer(fb);
        assert_eq!(cache.autorelease_count(), 1);
    }

    #[test]
    fn test_image_reuse_resets_layout() {
        let (device, mut cache) = setup();
        let info = GfxImageInfo::new_2d(8, 8, vk::Format::R8G8B8A8_UNORM, vk::ImageUsageFlags::COLOR_ATTACHMENT);

        let storage = cache.acquire_image(&device, &info).unwrap();
        storage.borrow_mut().set_layout(vk::ImageLayout::PRESENT_SRC_KHR);
        cache.release_image(storage);
        assert_eq!(cache.free_image_count(), 1);

        let storage = cache.acquire_image(&device, &info).unwrap();
        assert_eq!(storage.borrow().layout(), vk::ImageLayout::UNDEFINED);
        assert!(storage.borrow().signal_sem().is_some());
        assert_eq!(device.image_count(), 1);
    }

    #[test]
    fn test_double_release_image_rejected() {
        let (device, mut cache) = setup();
        let info = GfxImageInfo::new_2d(8, 8, vk::Format::R8G8B8A8_UNORM, vk::ImageUsageFlags::COLOR_ATTACHMENT);
        let storage = cache.acquire_image(&device, &info).unwrap();
        cache.release_image(storage.clone());
        cache.release_image(storage);
        assert_eq!(cache.free_image_count(), 1);
    }

    #[test]
    fn test_swapchain_image_not_cached() {
        let (device, mut cache) = setup();
        let info = GfxImageInfo::new_2d(8, 8, vk::Format::B8G8R8A8_UNORM, vk::ImageUsageFlags::COLOR_ATTACHMENT);
        let image = device.make_image(&info, "sc").unwrap();
        let storage = std::rc::Rc::new(std::cell::RefCell::new(FgImageStorage::new_swapchain(image, info)));
        cache.release_image(storage);
        assert_eq!(cache.free_image_count(), 0);
    }
}
