use slotmap::new_key_type;

new_key_type! {
    /// Image Handle
    ///
    /// 指向一个设备 Image 资源。
    pub struct GfxImageHandle;
    /// ImageView Handle
    ///
    /// 指向一个设备 ImageView 资源。
    pub struct GfxImageViewHandle;
    /// Framebuffer Handle
    pub struct GfxFramebufferHandle;
    /// Buffer Handle
    pub struct GfxBufferHandle;
    /// Semaphore Handle
    pub struct GfxSemaphoreHandle;
    /// Fence Handle
    pub struct GfxFenceHandle;
}

/// RenderPass 标识
///
/// 编译后的帧图为每个 graphics pass 分配一个进程内单调递增的标识，
/// framebuffer 缓存用它作为兼容性 key 的一部分。
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct GfxRenderPassId(pub u64);
