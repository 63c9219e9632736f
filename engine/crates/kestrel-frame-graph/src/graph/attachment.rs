//! 附件及其逐 pass 描述符
//!
//! 一个附件携带按 `RenderOrdering` 严格递增排序的描述符链；
//! 每个描述符又携带若干逐 subpass 引用。load/store、layout 链和
//! 聚合 usage 都由编译器（`compiler`）填充。

use std::any::Any;
use std::rc::Rc;

use ash::vk;

use crate::image_storage::FgImageStorageRef;
use crate::state::FgPassState;

/// Pass 在附件链上的排序 key，编译后严格递增
pub type RenderOrdering = u32;

/// 附件类别
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum AttachmentKind {
    Image,
    Buffer,
    Generic,
}

/// 附件在某个 subpass 内的用法
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum AttachmentUsage {
    Input,
    Output,
    Resolve,
    DepthStencil,
    InputDepthStencil,
}

impl AttachmentUsage {
    /// 是否写主通道（color 或 depth）
    #[inline]
    pub fn writes_main(&self) -> bool {
        matches!(self, Self::Output | Self::Resolve | Self::DepthStencil)
    }

    /// 是否读主通道
    #[inline]
    pub fn reads_main(&self) -> bool {
        matches!(self, Self::Input | Self::InputDepthStencil | Self::DepthStencil)
    }

    /// 是否写 stencil 通道
    #[inline]
    pub fn writes_stencil(&self) -> bool {
        matches!(self, Self::DepthStencil)
    }

    /// 是否读 stencil 通道
    #[inline]
    pub fn reads_stencil(&self) -> bool {
        matches!(self, Self::DepthStencil | Self::InputDepthStencil)
    }
}

/// 引用上的依赖记录
///
/// `required_pass_state` 是上一个 producer 必须达到的最小状态，
/// FrameQueue 以此建立 pass 之间的 required 边。
#[derive(Clone, Copy, Debug)]
pub struct FgRefDependency {
    pub stage: vk::PipelineStageFlags2,
    pub access: vk::AccessFlags2,
    pub required_pass_state: FgPassState,
}

impl Default for FgRefDependency {
    fn default() -> Self {
        Self {
            stage: vk::PipelineStageFlags2::ALL_COMMANDS,
            access: vk::AccessFlags2::NONE,
            required_pass_state: FgPassState::Submitted,
        }
    }
}

/// 逐 subpass 引用
#[derive(Clone, Copy, Debug)]
pub struct FgSubpassRef {
    pub subpass: u32,
    pub usage: AttachmentUsage,
    /// `UNDEFINED` 表示 Ignored，编译器会解析为该用法的规范 layout
    pub layout: vk::ImageLayout,
    pub dependency: FgRefDependency,
}

impl FgSubpassRef {
    pub fn new(subpass: u32, usage: AttachmentUsage) -> Self {
        Self {
            subpass,
            usage,
            layout: vk::ImageLayout::UNDEFINED,
            dependency: FgRefDependency::default(),
        }
    }

    #[inline]
    pub fn with_layout(mut self, layout: vk::ImageLayout) -> Self {
        self.layout = layout;
        self
    }

    #[inline]
    pub fn with_dependency(mut self, dependency: FgRefDependency) -> Self {
        self.dependency = dependency;
        self
    }
}

/// 附件的逐 pass 描述符
///
/// load/store、layout 链以及 `transient` 由编译器填充。
#[derive(Clone, Debug)]
pub struct FgAttachmentDescriptor {
    /// 所属 pass 在 Queue 内的下标
    pub pass: usize,
    pub ordering: RenderOrdering,
    pub refs: Vec<FgSubpassRef>,

    /// 此 pass（作为 producer）必须达到的状态，消费方据此推进
    pub required_pass_state: FgPassState,

    pub load_op: vk::AttachmentLoadOp,
    pub store_op: vk::AttachmentStoreOp,
    pub stencil_load_op: vk::AttachmentLoadOp,
    pub stencil_store_op: vk::AttachmentStoreOp,
    pub initial_layout: vk::ImageLayout,
    pub final_layout: vk::ImageLayout,
    pub transient: bool,
}

impl FgAttachmentDescriptor {
    pub fn new(pass: usize, ordering: RenderOrdering, refs: Vec<FgSubpassRef>) -> Self {
        Self {
            pass,
            ordering,
            refs,
            required_pass_state: FgPassState::Submitted,
            load_op: vk::AttachmentLoadOp::DONT_CARE,
            store_op: vk::AttachmentStoreOp::DONT_CARE,
            stencil_load_op: vk::AttachmentLoadOp::DONT_CARE,
            stencil_store_op: vk::AttachmentStoreOp::DONT_CARE,
            initial_layout: vk::ImageLayout::UNDEFINED,
            final_layout: vk::ImageLayout::UNDEFINED,
            transient: false,
        }
    }

    /// 本描述符是否写主通道
    #[inline]
    pub fn writes_main(&self) -> bool {
        self.refs.iter().any(|r| r.usage.writes_main())
    }

    /// 本描述符是否读主通道
    #[inline]
    pub fn reads_main(&self) -> bool {
        self.refs.iter().any(|r| r.usage.reads_main())
    }

    #[inline]
    pub fn writes_stencil(&self) -> bool {
        self.refs.iter().any(|r| r.usage.writes_stencil())
    }

    #[inline]
    pub fn reads_stencil(&self) -> bool {
        self.refs.iter().any(|r| r.usage.reads_stencil())
    }

    /// 作为 framebuffer 目标使用（而非采样输入）
    #[inline]
    pub fn is_framebuffer_target(&self) -> bool {
        self.refs.iter().any(|r| {
            matches!(r.usage, AttachmentUsage::Output | AttachmentUsage::Resolve | AttachmentUsage::DepthStencil)
        })
    }
}

/// 附件的外部输入载荷
///
/// 附件在接受前校验载荷类别（`validate_input`）。
#[derive(Clone)]
pub enum FgAttachmentInputData {
    Image(FgImageStorageRef),
    Buffer(Rc<Vec<u8>>),
    Generic(Rc<dyn Any>),
}

/// 附件
pub struct FgAttachment {
    pub name: String,
    pub kind: AttachmentKind,
    pub format: vk::Format,
    pub samples: vk::SampleCountFlags,

    /// 首个消费者使用 Clear（否则 DontCare）
    pub clear_on_load: bool,
    /// 声明为外部输入
    pub is_input: bool,
    /// 最终对外可见（被 present / callback 消费）
    pub is_output: bool,

    /// 全局初始 layout；`UNDEFINED` 表示 Ignored
    pub initial_layout: vk::ImageLayout,
    /// 全局最终 layout；`UNDEFINED` 表示未设置
    pub final_layout: vk::ImageLayout,

    /// 聚合 usage，编译器按将进入的 layout 逐项增补
    pub usage: vk::ImageUsageFlags,

    /// 不设置则取帧约束的 extent
    pub extent: Option<(u32, u32)>,

    /// 附件释放所需的末 pass 状态
    pub final_release_state: FgPassState,

    /// 可选的输入提供者（request 输入缺失时的回退）
    pub input_provider: Option<Rc<dyn Fn() -> Option<FgAttachmentInputData>>>,

    /// 按 `ordering` 严格递增排序（编译后）
    pub descriptors: Vec<FgAttachmentDescriptor>,
}

// new & builder
impl FgAttachment {
    pub fn new_image(name: impl Into<String>, format: vk::Format) -> Self {
        Self {
            name: name.into(),
            kind: AttachmentKind::Image,
            format,
            samples: vk::SampleCountFlags::TYPE_1,
            clear_on_load: false,
            is_input: false,
            is_output: false,
            initial_layout: vk::ImageLayout::UNDEFINED,
            final_layout: vk::ImageLayout::UNDEFINED,
            usage: vk::ImageUsageFlags::empty(),
            extent: None,
            final_release_state: FgPassState::Complete,
            input_provider: None,
            descriptors: Vec::new(),
        }
    }

    pub fn new_buffer(name: impl Into<String>) -> Self {
        Self { kind: AttachmentKind::Buffer, ..Self::new_image(name, vk::Format::UNDEFINED) }
    }

    pub fn new_generic(name: impl Into<String>) -> Self {
        Self { kind: AttachmentKind::Generic, ..Self::new_image(name, vk::Format::UNDEFINED) }
    }

    #[inline]
    pub fn with_clear(mut self) -> Self {
        self.clear_on_load = true;
        self
    }

    #[inline]
    pub fn as_input(mut self) -> Self {
        self.is_input = true;
        self
    }

    #[inline]
    pub fn as_output(mut self, final_layout: vk::ImageLayout) -> Self {
        self.is_output = true;
        self.final_layout = final_layout;
        self
    }

    #[inline]
    pub fn with_extent(mut self, width: u32, height: u32) -> Self {
        self.extent = Some((width, height));
        self
    }

    #[inline]
    pub fn with_input_provider(mut self, provider: Rc<dyn Fn() -> Option<FgAttachmentInputData>>) -> Self {
        self.is_input = true;
        self.input_provider = Some(provider);
        self
    }
}

// 校验与查询
impl FgAttachment {
    /// 输入载荷类别校验
    pub fn validate_input(&self, input: &FgAttachmentInputData) -> bool {
        let ok = match (self.kind, input) {
            (AttachmentKind::Image, FgAttachmentInputData::Image(_)) => true,
            (AttachmentKind::Buffer, FgAttachmentInputData::Buffer(_)) => true,
            (AttachmentKind::Generic, FgAttachmentInputData::Generic(_)) => true,
            _ => false,
        };
        if !ok {
            log::error!("FgAttachment[{}]: input payload does not match kind {:?}", self.name, self.kind);
        }
        ok
    }

    /// 某 pass 在此附件上的描述符下标
    pub fn descriptor_index_of_pass(&self, pass: usize) -> Option<usize> {
        self.descriptors.iter().position(|d| d.pass == pass)
    }

    /// 末端描述符
    #[inline]
    pub fn terminal_descriptor(&self) -> Option<&FgAttachmentDescriptor> {
        self.descriptors.last()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_validate_input_kind() {
        let attachment = FgAttachment::new_buffer("buf");
        let wrong = FgAttachmentInputData::Generic(Rc::new(42u32));
        assert!(!attachment.validate_input(&wrong));
        let right = FgAttachmentInputData::Buffer(Rc::new(vec![0u8; 4]));
        assert!(attachment.validate_input(&right));
    }

    #[test]
    fn test_usage_channels() {
        assert!(AttachmentUsage::Output.writes_main());
        assert!(!AttachmentUsage::Output.reads_main());
        assert!(AttachmentUsage::Input.reads_main());
        assert!(AttachmentUsage::DepthStencil.writes_main());
        assert!(AttachmentUsage::DepthStencil.reads_stencil());
        assert!(!AttachmentUsage::Input.reads_stencil());
    }
}
