//! 帧请求
//!
//! 一次性的声明：渲染哪个 Queue、约束是什么、输入输出怎么接、
//! 要等待 / 通知哪些依赖事件。请求在 loop 线程上构建并消费，
//! 提交给引擎后即归 FrameHandle 所有。

use std::collections::HashMap;
use std::rc::Rc;

use kestrel_gfx::image_info::GfxImageViewInfo;

use crate::dependency_event::FgDependencyEvent;
use crate::graph::attachment::FgAttachmentInputData;
use crate::graph::FgQueue;
use crate::image_storage::FgImageStorageRef;

/// 帧约束
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct FrameConstraints {
    /// 渲染尺寸
    pub extent: (u32, u32),
    /// 像素密度
    pub density: f32,
    /// 屏幕尺寸（供 pass 录制参考）
    pub screen_size: (u32, u32),
}

impl FrameConstraints {
    pub fn new(extent: (u32, u32)) -> Self {
        Self { extent, density: 1.0, screen_size: extent }
    }
}

/// 呈现目标
pub trait FgPresentTarget {
    /// 把输出图像交给呈现方；返回是否接受
    ///
    /// 帧失败时也会被调用一次（`success = false`），此时载体可能已被回收。
    fn present(&self, storage: Option<&FgImageStorageRef>, success: bool) -> bool;
}

/// 输出绑定
///
/// Callback 返回 false 表示暂未消费，输出会在图像下次就绪时重试。
#[derive(Clone)]
pub enum FgOutputBinding {
    Present(Rc<dyn FgPresentTarget>),
    Callback(Rc<dyn Fn(Option<&FgImageStorageRef>, bool) -> bool>),
}

impl FgOutputBinding {
    /// 尝试投递输出，返回是否已消费
    ///
    /// 失败帧以 `success = false` 通知一次，不重试，返回值被忽略。
    pub fn deliver(&self, storage: Option<&FgImageStorageRef>, success: bool) -> bool {
        match self {
            Self::Present(target) => target.present(storage, success),
            Self::Callback(cb) => cb(storage, success),
        }
    }
}

/// 帧请求
pub struct FgFrameRequest {
    queue: Rc<FgQueue>,
    constraints: FrameConstraints,

    inputs: HashMap<usize, FgAttachmentInputData>,
    outputs: HashMap<usize, FgOutputBinding>,

    wait_dependencies: Vec<FgDependencyEvent>,
    signal_dependencies: Vec<FgDependencyEvent>,

    /// 外部渲染目标：主输出直接画进这里，跳过缓存分配
    render_target: Option<FgImageStorageRef>,
    /// 逐附件的视图覆盖
    view_overrides: HashMap<usize, GfxImageViewInfo>,

    /// 提交前插入一次全局 barrier
    enable_barrier: bool,

    /// 帧完成（成功或失败）时的回调
    completion: Option<Box<dyn FnOnce(bool)>>,
}

// new & builder
impl FgFrameRequest {
    pub fn new(queue: Rc<FgQueue>, constraints: FrameConstraints) -> Self {
        Self {
            queue,
            constraints,
            inputs: HashMap::new(),
            outputs: HashMap::new(),
            wait_dependencies: Vec::new(),
            signal_dependencies: Vec::new(),
            render_target: None,
            view_overrides: HashMap::new(),
            enable_barrier: false,
            completion: None,
        }
    }

    /// 绑定输入附件的数据
    ///
    /// 附件必须声明为输入且载荷类别匹配，否则拒绝且不留痕迹。
    pub fn add_input(&mut self, attachment: usize, data: FgAttachmentInputData) -> bool {
        if !self.queue.input_attachments().contains(&attachment) {
            log::error!("FgFrameRequest: attachment {} is not an input of queue '{}'", attachment, self.queue.name());
            return false;
        }
        // input_attachments 里的下标一定有效
        let declared = &self.queue.attachments()[attachment];
        if !declared.validate_input(&data) {
            return false;
        }
        self.inputs.insert(attachment, data);
        true
    }

    /// 绑定输出附件的去向
    pub fn bind_output(&mut self, attachment: usize, binding: FgOutputBinding) -> bool {
        if !self.queue.output_attachments().contains(&attachment) {
            log::error!(
                "FgFrameRequest: attachment {} is not an output of queue '{}'",
                attachment,
                self.queue.name()
            );
            return false;
        }
        self.outputs.insert(attachment, binding);
        true
    }

    /// 本帧提交前必须 signal 的事件
    #[inline]
    pub fn wait_dependency(&mut self, event: FgDependencyEvent) {
        self.wait_dependencies.push(event);
    }

    /// 本帧完成时 signal 的事件
    #[inline]
    pub fn signal_dependency(&mut self, event: FgDependencyEvent) {
        self.signal_dependencies.push(event);
    }

    #[inline]
    pub fn set_render_target(&mut self, target: FgImageStorageRef) {
        self.render_target = Some(target);
    }

    #[inline]
    pub fn override_view(&mut self, attachment: usize, view: GfxImageViewInfo) {
        self.view_overrides.insert(attachment, view);
    }

    #[inline]
    pub fn set_enable_barrier(&mut self, enable: bool) {
        self.enable_barrier = enable;
    }

    #[inline]
    pub fn on_complete(&mut self, cb: Box<dyn FnOnce(bool)>) {
        self.completion = Some(cb);
    }
}

// getters
impl FgFrameRequest {
    #[inline]
    pub fn queue(&self) -> &Rc<FgQueue> {
        &self.queue
    }

    #[inline]
    pub fn constraints(&self) -> &FrameConstraints {
        &self.constraints
    }

    #[inline]
    pub fn input(&self, attachment: usize) -> Option<&FgAttachmentInputData> {
        self.inputs.get(&attachment)
    }

    #[inline]
    pub fn output(&self, attachment: usize) -> Option<&FgOutputBinding> {
        self.outputs.get(&attachment)
    }

    #[inline]
    pub fn outputs(&self) -> &HashMap<usize, FgOutputBinding> {
        &self.outputs
    }

    #[inline]
    pub fn wait_dependencies(&self) -> &[FgDependencyEvent] {
        &self.wait_dependencies
    }

    #[inline]
    pub fn signal_dependencies(&self) -> &[FgDependencyEvent] {
        &self.signal_dependencies
    }

    #[inline]
    pub fn render_target(&self) -> Option<&FgImageStorageRef> {
        self.render_target.as_ref()
    }

    #[inline]
    pub fn view_override(&self, attachment: usize) -> Option<&GfxImageViewInfo> {
        self.view_overrides.get(&attachment)
    }

    #[inline]
    pub fn enable_barrier(&self) -> bool {
        self.enable_barrier
    }

    #[inline]
    pub fn take_completion(&mut self) -> Option<Box<dyn FnOnce(bool)>> {
        self.completion.take()
    }
}
