//! Pass 节点与 pipeline 描述
//!
//! Pass 节点是纯声明：几个 subpass、subpass 之间的依赖、用到的 pipeline。
//! render pass id 与 pipeline id 在 Queue 编译时由全局计数器分配。

use ash::vk;
use kestrel_gfx::handles::GfxRenderPassId;

use crate::graph::attachment::RenderOrdering;

/// Pass 类别
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum PassKind {
    Graphics,
    Compute,
    Transfer,
    Generic,
}

/// Subpass 之间的执行依赖
#[derive(Clone, Copy, Debug)]
pub struct FgSubpassDependency {
    pub src_subpass: u32,
    pub dst_subpass: u32,
    pub src_stage: vk::PipelineStageFlags2,
    pub src_access: vk::AccessFlags2,
    pub dst_stage: vk::PipelineStageFlags2,
    pub dst_access: vk::AccessFlags2,
}

/// 描述符绑定声明
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct DescriptorBindingDesc {
    pub binding: u32,
    pub descriptor_type: vk::DescriptorType,
    pub count: u32,
}

/// 描述符集布局声明
#[derive(Clone, Debug, Default)]
pub struct DescriptorSetLayoutDesc {
    pub bindings: Vec<DescriptorBindingDesc>,
}

/// shader 反射出的绑定，用于对照声明
#[derive(Clone, Copy, Debug)]
pub struct ReflectedBinding {
    pub set: u32,
    pub binding: u32,
    pub descriptor_type: vk::DescriptorType,
    pub count: u32,
}

/// Pipeline 描述
///
/// id 在 Queue 编译时分配，进程内全局递增。
#[derive(Clone, Debug)]
pub struct FgPipelineDesc {
    pub name: String,
    pub bind_point: vk::PipelineBindPoint,
    pub set_layouts: Vec<DescriptorSetLayoutDesc>,
    pub reflected: Vec<ReflectedBinding>,
    pub id: u64,
    /// 逐 set 的描述符集 id，编译时按 set_layouts 分配
    pub set_ids: Vec<u64>,
}

impl FgPipelineDesc {
    pub fn new(name: impl Into<String>, bind_point: vk::PipelineBindPoint) -> Self {
        Self {
            name: name.into(),
            bind_point,
            set_layouts: Vec::new(),
            reflected: Vec::new(),
            id: 0,
            set_ids: Vec::new(),
        }
    }

    #[inline]
    pub fn with_set_layout(mut self, layout: DescriptorSetLayoutDesc) -> Self {
        self.set_layouts.push(layout);
        self
    }

    #[inline]
    pub fn with_reflected(mut self, binding: ReflectedBinding) -> Self {
        self.reflected.push(binding);
        self
    }

    /// 反射绑定与声明布局对照，不一致只告警不失败
    pub fn validate_bindings(&self) {
        for reflected in &self.reflected {
            let declared = self
                .set_layouts
                .get(reflected.set as usize)
                .and_then(|layout| layout.bindings.iter().find(|b| b.binding == reflected.binding));
            match declared {
                None => {
                    log::warn!(
                        "FgPipelineDesc[{}]: reflected binding (set={}, binding={}) not declared",
                        self.name,
                        reflected.set,
                        reflected.binding
                    );
                }
                Some(declared) => {
                    if declared.descriptor_type != reflected.descriptor_type || declared.count < reflected.count {
                        log::warn!(
                            "FgPipelineDesc[{}]: binding (set={}, binding={}) declared {:?}x{} vs reflected {:?}x{}",
                            self.name,
                            reflected.set,
                            reflected.binding,
                            declared.descriptor_type,
                            declared.count,
                            reflected.descriptor_type,
                            reflected.count
                        );
                    }
                }
            }
        }
    }
}

/// 单个绘制项
#[derive(Clone, Copy, Debug)]
pub struct FgDrawItem {
    pub vertex_count: u32,
    pub instance_count: u32,
    pub material_index: u32,
    pub sampler_index: u32,
}

/// 投影阴影的形状统计（可选的收尾 subpass）
#[derive(Clone, Copy, Debug, Default)]
pub struct FgShadowShapes {
    pub circles: u32,
    pub rects: u32,
    pub rounded_rects: u32,
    pub polygons: u32,
    pub triangles: u32,
}

impl FgShadowShapes {
    #[inline]
    pub fn total(&self) -> u32 {
        self.circles + self.rects + self.rounded_rects + self.polygons + self.triangles
    }
}

/// 图形 pass 的录制配置
#[derive(Clone, Debug, Default)]
pub struct GraphicsPassConfig {
    /// 逐 subpass 的绘制列表
    pub draws_per_subpass: Vec<Vec<FgDrawItem>>,
    /// 末尾的阴影 subpass（有形状时才录制）
    pub shadow_post: Option<FgShadowShapes>,
}

/// 计算 pass 的录制配置
#[derive(Clone, Copy, Debug)]
pub struct ComputePassConfig {
    pub group_count: (u32, u32, u32),
}

/// Pass 节点
pub struct FgPassNode {
    pub name: String,
    pub kind: PassKind,
    pub ordering: RenderOrdering,
    pub subpass_count: u32,
    pub dependencies: Vec<FgSubpassDependency>,
    pub pipelines: Vec<FgPipelineDesc>,

    /// 编译时分配
    pub render_pass_id: GfxRenderPassId,

    /// 不等待帧整体放行，Prepared 后立即提交
    pub async_submit: bool,
    /// 不设置则取帧约束的 extent
    pub extent: Option<(u32, u32)>,

    pub graphics: Option<GraphicsPassConfig>,
    pub compute: Option<ComputePassConfig>,
}

// new & builder
impl FgPassNode {
    pub fn new(name: impl Into<String>, kind: PassKind, ordering: RenderOrdering) -> Self {
        Self {
            name: name.into(),
            kind,
            ordering,
            subpass_count: 1,
            dependencies: Vec::new(),
            pipelines: Vec::new(),
            render_pass_id: GfxRenderPassId(0),
            async_submit: false,
            extent: None,
            graphics: None,
            compute: None,
        }
    }

    #[inline]
    pub fn with_subpass_count(mut self, count: u32) -> Self {
        self.subpass_count = count.max(1);
        self
    }

    #[inline]
    pub fn with_dependency(mut self, dependency: FgSubpassDependency) -> Self {
        self.dependencies.push(dependency);
        self
    }

    #[inline]
    pub fn with_pipeline(mut self, pipeline: FgPipelineDesc) -> Self {
        self.pipelines.push(pipeline);
        self
    }

    #[inline]
    pub fn with_async_submit(mut self) -> Self {
        self.async_submit = true;
        self
    }

    #[inline]
    pub fn with_extent(mut self, width: u32, height: u32) -> Self {
        self.extent = Some((width, height));
        self
    }

    #[inline]
    pub fn with_graphics(mut self, config: GraphicsPassConfig) -> Self {
        self.graphics = Some(config);
        self
    }

    #[inline]
    pub fn with_compute(mut self, config: ComputePassConfig) -> Self {
        self.compute = Some(config);
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_subpass_count_floor() {
        let pass = FgPassNode::new("p", PassKind::Graphics, 0).with_subpass_count(0);
        assert_eq!(pass.subpass_count, 1);
    }

    #[test]
    fn test_shadow_shape_total() {
        let shapes = FgShadowShapes { circles: 1, rects: 2, ..Default::default() };
        assert_eq!(shapes.total(), 3);
    }
}
