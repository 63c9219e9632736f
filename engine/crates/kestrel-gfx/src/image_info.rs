//! 图像与视图描述
//!
//! `GfxImageInfo` / `GfxImageViewInfo` 既是创建参数，也是帧缓存的兼容性 key，
//! 因此两者都实现了 `Hash + Eq`。

use ash::vk;

/// 图像描述（用于创建图像，同时充当缓存 key）
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct GfxImageInfo {
    /// 图像宽度
    pub width: u32,
    /// 图像高度
    pub height: u32,
    /// Mip 级别数
    pub mip_levels: u32,
    /// 数组层数
    pub array_layers: u32,
    /// 图像格式
    pub format: vk::Format,
    /// 图像用途
    pub usage: vk::ImageUsageFlags,
    /// 采样数
    pub samples: vk::SampleCountFlags,
    /// 图像类型
    pub image_type: vk::ImageType,
}

impl Default for GfxImageInfo {
    fn default() -> Self {
        Self {
            width: 1,
            height: 1,
            mip_levels: 1,
            array_layers: 1,
            format: vk::Format::R8G8B8A8_UNORM,
            usage: vk::ImageUsageFlags::SAMPLED,
            samples: vk::SampleCountFlags::TYPE_1,
            image_type: vk::ImageType::TYPE_2D,
        }
    }
}

// new & init & builder
impl GfxImageInfo {
    /// 创建 2D 图像描述
    #[inline]
    pub fn new_2d(width: u32, height: u32, format: vk::Format, usage: vk::ImageUsageFlags) -> Self {
        Self { width, height, format, usage, ..Default::default() }
    }

    /// 设置用途（链式调用）
    #[inline]
    pub fn with_usage(mut self, usage: vk::ImageUsageFlags) -> Self {
        self.usage = usage;
        self
    }

    /// 追加用途
    #[inline]
    pub fn add_usage(&mut self, usage: vk::ImageUsageFlags) {
        self.usage |= usage;
    }
}

// getters & tools
impl GfxImageInfo {
    #[inline]
    pub fn extent(&self) -> (u32, u32) {
        (self.width, self.height)
    }

    /// 自动推断并生成默认视图描述
    pub fn infer_default_view(&self) -> GfxImageViewInfo {
        GfxImageViewInfo {
            format: self.format,
            view_type: Self::infer_view_type(self.image_type, self.array_layers),
            aspect: Self::infer_aspect(self.format),
            base_mip: 0,
            mip_count: self.mip_levels,
            base_layer: 0,
            layer_count: self.array_layers,
        }
    }

    /// 从格式推断 aspect
    pub fn infer_aspect(format: vk::Format) -> vk::ImageAspectFlags {
        match format {
            vk::Format::D16_UNORM | vk::Format::D32_SFLOAT | vk::Format::X8_D24_UNORM_PACK32 => {
                vk::ImageAspectFlags::DEPTH
            }
            vk::Format::S8_UINT => vk::ImageAspectFlags::STENCIL,
            vk::Format::D16_UNORM_S8_UINT | vk::Format::D24_UNORM_S8_UINT | vk::Format::D32_SFLOAT_S8_UINT => {
                vk::ImageAspectFlags::DEPTH | vk::ImageAspectFlags::STENCIL
            }
            _ => vk::ImageAspectFlags::COLOR,
        }
    }

    /// 格式是否含深度分量
    #[inline]
    pub fn format_has_depth(format: vk::Format) -> bool {
        Self::infer_aspect(format).contains(vk::ImageAspectFlags::DEPTH)
    }

    /// 格式是否含模板分量
    #[inline]
    pub fn format_has_stencil(format: vk::Format) -> bool {
        Self::infer_aspect(format).contains(vk::ImageAspectFlags::STENCIL)
    }

    /// 从图像类型推断视图类型
    fn infer_view_type(image_type: vk::ImageType, array_layers: u32) -> vk::ImageViewType {
        match image_type {
            vk::ImageType::TYPE_1D => {
                if array_layers > 1 {
                    vk::ImageViewType::TYPE_1D_ARRAY
                } else {
                    vk::ImageViewType::TYPE_1D
                }
            }
            vk::ImageType::TYPE_2D => {
                if array_layers > 1 {
                    vk::ImageViewType::TYPE_2D_ARRAY
                } else {
                    vk::ImageViewType::TYPE_2D
                }
            }
            vk::ImageType::TYPE_3D => vk::ImageViewType::TYPE_3D,
            _ => vk::ImageViewType::TYPE_2D,
        }
    }
}

/// 视图描述
///
/// 同一个图像可以派生多个视图，`FgImageStorage` 以本结构为 key 缓存视图。
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct GfxImageViewInfo {
    /// 视图格式
    pub format: vk::Format,
    /// 视图类型
    pub view_type: vk::ImageViewType,
    /// Aspect
    pub aspect: vk::ImageAspectFlags,
    /// 起始 mip
    pub base_mip: u32,
    /// mip 数量
    pub mip_count: u32,
    /// 起始 layer
    pub base_layer: u32,
    /// layer 数量
    pub layer_count: u32,
}

impl GfxImageViewInfo {
    /// 创建 2D 单 mip 视图描述
    #[inline]
    pub fn new_2d(format: vk::Format, aspect: vk::ImageAspectFlags) -> Self {
        Self {
            format,
            view_type: vk::ImageViewType::TYPE_2D,
            aspect,
            base_mip: 0,
            mip_count: 1,
            base_layer: 0,
            layer_count: 1,
        }
    }
}

/// 缓冲区描述
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct GfxBufferInfo {
    /// 字节大小
    pub size: u64,
    /// 缓冲区用途
    pub usage: vk::BufferUsageFlags,
}

impl GfxBufferInfo {
    #[inline]
    pub fn new(size: u64, usage: vk::BufferUsageFlags) -> Self {
        Self { size, usage }
    }
}
