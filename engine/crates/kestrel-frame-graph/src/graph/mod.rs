//! 声明式渲染队列
//!
//! `FgQueueBuilder` 收集附件、pass 与资源引用，`prepare` 一次性编译为
//! 不可变的 `FgQueue`。编译后的 Queue 可被任意多的帧请求复用，也可以
//! 作为子图被其他 Queue 链接。

pub mod attachment;
pub mod compiler;
pub mod pass;

use std::rc::Rc;
use std::sync::atomic::{AtomicU64, Ordering};

use itertools::Itertools;
use kestrel_gfx::device::GfxDevice;

use crate::counters::COUNTERS;
use crate::graph::attachment::{FgAttachment, FgAttachmentDescriptor, FgSubpassRef};
use crate::graph::pass::FgPassNode;
use crate::resource::{FgResource, FgResourceOwnership};

/// 编译后的渲染队列
///
/// 除 `order`（帧序分配）外全部只读。
pub struct FgQueue {
    id: u64,
    name: String,
    attachments: Vec<FgAttachment>,
    passes: Vec<FgPassNode>,

    /// 自有资源（prepare 时已编译）
    resources: Vec<FgResource>,
    /// 链接的共享资源（链接时必须已编译）
    linked_resources: Vec<Rc<FgResource>>,
    /// 链接的子 Queue
    linked_queues: Vec<Rc<FgQueue>>,

    input_attachments: Vec<usize>,
    output_attachments: Vec<usize>,

    /// 帧序分配器，每个帧请求取一个递增值
    order: AtomicU64,
}

// getters
impl FgQueue {
    #[inline]
    pub fn id(&self) -> u64 {
        self.id
    }

    #[inline]
    pub fn name(&self) -> &str {
        &self.name
    }

    #[inline]
    pub fn attachments(&self) -> &[FgAttachment] {
        &self.attachments
    }

    #[inline]
    pub fn passes(&self) -> &[FgPassNode] {
        &self.passes
    }

    #[inline]
    pub fn linked_queues(&self) -> &[Rc<FgQueue>] {
        &self.linked_queues
    }

    #[inline]
    pub fn resources(&self) -> &[FgResource] {
        &self.resources
    }

    #[inline]
    pub fn linked_resources(&self) -> &[Rc<FgResource>] {
        &self.linked_resources
    }

    /// 输入附件下标
    #[inline]
    pub fn input_attachments(&self) -> &[usize] {
        &self.input_attachments
    }

    /// 输出附件下标
    #[inline]
    pub fn output_attachments(&self) -> &[usize] {
        &self.output_attachments
    }

    /// 取下一个帧序号
    #[inline]
    pub fn next_order(&self) -> u64 {
        self.order.fetch_add(1, Ordering::Relaxed)
    }
}

/// Queue 构建器
pub struct FgQueueBuilder {
    name: String,
    attachments: Vec<FgAttachment>,
    passes: Vec<FgPassNode>,
    resources: Vec<FgResource>,
    linked_resources: Vec<Rc<FgResource>>,
    linked_queues: Vec<Rc<FgQueue>>,
}

// new & 注册
impl FgQueueBuilder {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            attachments: Vec::new(),
            passes: Vec::new(),
            resources: Vec::new(),
            linked_resources: Vec::new(),
            linked_queues: Vec::new(),
        }
    }

    /// 注册 pass，返回下标
    pub fn add_pass(&mut self, pass: FgPassNode) -> usize {
        self.passes.push(pass);
        self.passes.len() - 1
    }

    /// 注册附件，返回下标
    pub fn add_attachment(&mut self, attachment: FgAttachment) -> usize {
        self.attachments.push(attachment);
        self.attachments.len() - 1
    }

    /// 声明某 pass 使用某附件（一个 pass 对一个附件至多声明一次）
    pub fn add_usage(&mut self, attachment: usize, pass: usize, refs: Vec<FgSubpassRef>) -> bool {
        let Some(node) = self.passes.get(pass) else {
            log::error!("FgQueueBuilder[{}]: add_usage with unknown pass {}", self.name, pass);
            return false;
        };
        let ordering = node.ordering;
        let Some(att) = self.attachments.get_mut(attachment) else {
            log::error!("FgQueueBuilder[{}]: add_usage with unknown attachment {}", self.name, attachment);
            return false;
        };
        if att.descriptors.iter().any(|d| d.pass == pass) {
            log::error!("FgQueueBuilder[{}]: pass {} already uses attachment '{}'", self.name, pass, att.name);
            return false;
        }
        att.descriptors.push(FgAttachmentDescriptor::new(pass, ordering, refs));
        true
    }

    /// 托管自有资源，prepare 时编译
    pub fn own_resource(&mut self, resource: FgResource) {
        self.resources.push(resource);
    }

    /// 链接共享资源，必须已编译
    pub fn link_resource(&mut self, resource: Rc<FgResource>) -> bool {
        if resource.ownership() != FgResourceOwnership::Linked {
            log::error!("FgQueueBuilder[{}]: resource '{}' is not linkable", self.name, resource.name());
            return false;
        }
        if !resource.compiled() {
            log::error!("FgQueueBuilder[{}]: linked resource '{}' is not compiled", self.name, resource.name());
            return false;
        }
        self.linked_resources.push(resource);
        true
    }

    /// 链接子 Queue（其输出可作为本 Queue 的输入）
    pub fn link_queue(&mut self, queue: Rc<FgQueue>) {
        self.linked_queues.push(queue);
    }

    #[inline]
    pub fn pass_mut(&mut self, index: usize) -> Option<&mut FgPassNode> {
        self.passes.get_mut(index)
    }

    #[inline]
    pub fn attachment_mut(&mut self, index: usize) -> Option<&mut FgAttachment> {
        self.attachments.get_mut(index)
    }
}

// 编译
impl FgQueueBuilder {
    /// 编译为不可变 Queue
    ///
    /// 自有资源在这里编译；编译失败的资源被丢弃（已记录错误）。
    /// 图本身的编译从不失败，无效声明产生告警和尽力而为的结果。
    pub fn prepare(mut self, _device: &dyn GfxDevice) -> Rc<FgQueue> {
        for resource in &mut self.resources {
            if !resource.compile() {
                log::error!("FgQueueBuilder[{}]: resource '{}' failed to compile", self.name, resource.name());
            }
        }
        self.resources.retain(|r| r.compiled());

        compiler::compile(&mut self.attachments, &mut self.passes);

        let input_attachments = self.attachments.iter().positions(|a| a.is_input).collect();
        let output_attachments = self.attachments.iter().positions(|a| a.is_output).collect();

        let queue = FgQueue {
            id: COUNTERS.next_queue_id(),
            name: self.name,
            attachments: self.attachments,
            passes: self.passes,
            resources: self.resources,
            linked_resources: self.linked_resources,
            linked_queues: self.linked_queues,
            input_attachments,
            output_attachments,
            order: AtomicU64::new(0),
        };
        log::debug!(
            "FgQueue[{}]: prepared, {} attachments, {} passes",
            queue.name,
            queue.attachments.len(),
            queue.passes.len()
        );
        Rc::new(queue)
    }
}
