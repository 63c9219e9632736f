//! Queue 编译
//!
//! 从声明式的附件 / pass 出发，推导每个附件描述符的 load/store、
//! layout 链和聚合 usage。编译从不中止：无效输入记录告警后做尽力
//! 而为的推导，结果对相同输入是确定且可重复的。

use ash::vk;
use kestrel_gfx::handles::GfxRenderPassId;
use kestrel_gfx::image_info::GfxImageInfo;

use crate::counters::COUNTERS;
use crate::graph::attachment::{AttachmentKind, AttachmentUsage, FgAttachment};
use crate::graph::pass::FgPassNode;

/// 就地编译附件链与 pass 节点
pub(crate) fn compile(attachments: &mut [FgAttachment], passes: &mut [FgPassNode]) {
    assign_ids(passes);
    for attachment in attachments.iter_mut() {
        if attachment.kind != AttachmentKind::Image {
            continue;
        }
        sort_descriptors(attachment);
        derive_load_store(attachment);
        resolve_layouts(attachment);
        propagate_usage(attachment);
    }
    for pass in passes.iter() {
        for pipeline in &pass.pipelines {
            pipeline.validate_bindings();
        }
    }
}

/// 分配 render pass id、pipeline id 与描述符集 id
fn assign_ids(passes: &mut [FgPassNode]) {
    for pass in passes.iter_mut() {
        if pass.render_pass_id.0 == 0 {
            pass.render_pass_id = GfxRenderPassId(COUNTERS.next_render_pass_id());
        }
        for pipeline in &mut pass.pipelines {
            if pipeline.id == 0 {
                pipeline.id = COUNTERS.next_pipeline_id();
            }
            if pipeline.set_ids.len() != pipeline.set_layouts.len() {
                pipeline.set_ids =
                    pipeline.set_layouts.iter().map(|_| COUNTERS.next_descriptor_set_id()).collect();
            }
        }
    }
}

/// 描述符按 ordering 稳定排序；重复 ordering 只告警
fn sort_descriptors(attachment: &mut FgAttachment) {
    attachment.descriptors.sort_by_key(|d| d.ordering);
    for pair in attachment.descriptors.windows(2) {
        if pair[0].ordering == pair[1].ordering {
            log::warn!(
                "FgAttachment[{}]: passes {} and {} share ordering {}",
                attachment.name,
                pair[0].pass,
                pair[1].pass,
                pair[0].ordering
            );
        }
    }
}

/// load/store 推导
///
/// - load：之前有写且本描述符读 => Load；否则 clear_on_load => Clear；否则 DontCare
/// - store：本描述符写且之后有读（或是链尾且附件对外输出）=> Store；否则 DontCare
/// - 单 pass 单 ref、既非输入也非输出 => transient，全部 DontCare
fn derive_load_store(attachment: &mut FgAttachment) {
    let transient = attachment.descriptors.len() == 1
        && attachment.descriptors[0].refs.len() == 1
        && !attachment.is_input
        && !attachment.is_output;
    let has_stencil = GfxImageInfo::format_has_stencil(attachment.format);
    let count = attachment.descriptors.len();

    for k in 0..count {
        let written_before = attachment.descriptors[..k].iter().any(|d| d.writes_main()) || attachment.is_input;
        let read_after = attachment.descriptors[k + 1..].iter().any(|d| d.reads_main())
            || (k + 1 == count && attachment.is_output);
        let stencil_written_before = attachment.descriptors[..k].iter().any(|d| d.writes_stencil());
        let stencil_read_after = attachment.descriptors[k + 1..].iter().any(|d| d.reads_stencil());

        let desc = &mut attachment.descriptors[k];
        desc.transient = transient;
        if transient {
            desc.load_op = vk::AttachmentLoadOp::DONT_CARE;
            desc.store_op = vk::AttachmentStoreOp::DONT_CARE;
            desc.stencil_load_op = vk::AttachmentLoadOp::DONT_CARE;
            desc.stencil_store_op = vk::AttachmentStoreOp::DONT_CARE;
            continue;
        }

        desc.load_op = if written_before && desc.reads_main() {
            vk::AttachmentLoadOp::LOAD
        } else if attachment.clear_on_load {
            vk::AttachmentLoadOp::CLEAR
        } else {
            vk::AttachmentLoadOp::DONT_CARE
        };
        desc.store_op = if desc.writes_main() && read_after {
            vk::AttachmentStoreOp::STORE
        } else {
            vk::AttachmentStoreOp::DONT_CARE
        };

        if has_stencil {
            desc.stencil_load_op = if stencil_written_before && desc.reads_stencil() {
                vk::AttachmentLoadOp::LOAD
            } else if attachment.clear_on_load {
                vk::AttachmentLoadOp::CLEAR
            } else {
                vk::AttachmentLoadOp::DONT_CARE
            };
            desc.stencil_store_op = if desc.writes_stencil() && stencil_read_after {
                vk::AttachmentStoreOp::STORE
            } else {
                vk::AttachmentStoreOp::DONT_CARE
            };
        } else {
            desc.stencil_load_op = vk::AttachmentLoadOp::DONT_CARE;
            desc.stencil_store_op = vk::AttachmentStoreOp::DONT_CARE;
        }
    }
}

/// 某用法在此格式上的规范 layout
fn canonical_layout(usage: AttachmentUsage, format: vk::Format) -> vk::ImageLayout {
    let depth = GfxImageInfo::format_has_depth(format) || GfxImageInfo::format_has_stencil(format);
    match usage {
        AttachmentUsage::Input => {
            if depth {
                vk::ImageLayout::DEPTH_STENCIL_READ_ONLY_OPTIMAL
            } else {
                vk::ImageLayout::SHADER_READ_ONLY_OPTIMAL
            }
        }
        AttachmentUsage::Output | AttachmentUsage::Resolve => vk::ImageLayout::COLOR_ATTACHMENT_OPTIMAL,
        AttachmentUsage::DepthStencil => vk::ImageLayout::DEPTH_STENCIL_ATTACHMENT_OPTIMAL,
        AttachmentUsage::InputDepthStencil => vk::ImageLayout::DEPTH_STENCIL_READ_ONLY_OPTIMAL,
    }
}

/// layout 解析与链化
///
/// 1. 未指定（UNDEFINED）的 ref layout 解析为规范 layout
/// 2. 描述符 final = 末 ref 的 layout；链尾 final 被附件全局 final 覆盖（若设置）
/// 3. 描述符 k+1 的 initial = 描述符 k 的 final；链头 initial = 附件全局 initial
fn resolve_layouts(attachment: &mut FgAttachment) {
    let depth_format = GfxImageInfo::format_has_depth(attachment.format);
    for desc in &mut attachment.descriptors {
        for subpass_ref in &mut desc.refs {
            if subpass_ref.layout == vk::ImageLayout::UNDEFINED {
                subpass_ref.layout = canonical_layout(subpass_ref.usage, attachment.format);
            } else if !layout_compatible(subpass_ref.usage, subpass_ref.layout, depth_format) {
                log::error!(
                    "FgAttachment[{}]: usage {:?} incompatible with layout {:?} in pass {}",
                    attachment.name,
                    subpass_ref.usage,
                    subpass_ref.layout,
                    desc.pass
                );
            }
        }
        if depth_format && desc.refs.iter().any(|r| r.usage == AttachmentUsage::Output) {
            log::error!("FgAttachment[{}]: depth format used as color output", attachment.name);
        }
    }

    let mut previous = attachment.initial_layout;
    let count = attachment.descriptors.len();
    for k in 0..count {
        let desc = &mut attachment.descriptors[k];
        desc.initial_layout = previous;
        desc.final_layout = desc.refs.last().map_or(previous, |r| r.layout);
        if k + 1 == count && attachment.final_layout != vk::ImageLayout::UNDEFINED {
            desc.final_layout = attachment.final_layout;
        }
        previous = desc.final_layout;
    }
}

fn layout_compatible(usage: AttachmentUsage, layout: vk::ImageLayout, depth_format: bool) -> bool {
    match usage {
        AttachmentUsage::Output | AttachmentUsage::Resolve => {
            layout == vk::ImageLayout::COLOR_ATTACHMENT_OPTIMAL || layout == vk::ImageLayout::GENERAL
        }
        AttachmentUsage::DepthStencil => matches!(
            layout,
            vk::ImageLayout::DEPTH_STENCIL_ATTACHMENT_OPTIMAL | vk::ImageLayout::GENERAL
        ),
        AttachmentUsage::Input => {
            if depth_format {
                matches!(
                    layout,
                    vk::ImageLayout::DEPTH_STENCIL_READ_ONLY_OPTIMAL
                        | vk::ImageLayout::SHADER_READ_ONLY_OPTIMAL
                        | vk::ImageLayout::GENERAL
                )
            } else {
                matches!(layout, vk::ImageLayout::SHADER_READ_ONLY_OPTIMAL | vk::ImageLayout::GENERAL)
            }
        }
        AttachmentUsage::InputDepthStencil => matches!(
            layout,
            vk::ImageLayout::DEPTH_STENCIL_READ_ONLY_OPTIMAL | vk::ImageLayout::GENERAL
        ),
    }
}

/// 按将进入的每个 layout 增补聚合 usage
fn propagate_usage(attachment: &mut FgAttachment) {
    let mut layouts: Vec<vk::ImageLayout> = Vec::new();
    for desc in &attachment.descriptors {
        layouts.extend(desc.refs.iter().map(|r| r.layout));
        layouts.push(desc.final_layout);
    }
    for layout in layouts {
        attachment.usage |= usage_for_layout(layout);
    }
}

fn usage_for_layout(layout: vk::ImageLayout) -> vk::ImageUsageFlags {
    match layout {
        vk::ImageLayout::COLOR_ATTACHMENT_OPTIMAL => vk::ImageUsageFlags::COLOR_ATTACHMENT,
        vk::ImageLayout::DEPTH_STENCIL_ATTACHMENT_OPTIMAL | vk::ImageLayout::DEPTH_STENCIL_READ_ONLY_OPTIMAL => {
            vk::ImageUsageFlags::DEPTH_STENCIL_ATTACHMENT
        }
        vk::ImageLayout::SHADER_READ_ONLY_OPTIMAL => {
            vk::ImageUsageFlags::SAMPLED | vk::ImageUsageFlags::INPUT_ATTACHMENT
        }
        vk::ImageLayout::TRANSFER_SRC_OPTIMAL => vk::ImageUsageFlags::TRANSFER_SRC,
        vk::ImageLayout::TRANSFER_DST_OPTIMAL => vk::ImageUsageFlags::TRANSFER_DST,
        vk::ImageLayout::GENERAL => vk::ImageUsageFlags::STORAGE,
        _ => vk::ImageUsageFlags::empty(),
    }
}
