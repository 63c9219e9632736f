//! 进程级单调计数器
//!
//! 帧、队列、render pass、pipeline、依赖事件的 id 都来自这里。
//! 首次使用时初始化，进程生命周期内从不回收。

use std::sync::atomic::{AtomicU64, Ordering};

use lazy_static::lazy_static;

/// 进程级计数器集合
pub struct GlobalCounters {
    /// 存活的帧数量
    pub live_frames: AtomicU64,
    /// 已提交的帧总数
    pub submitted_frames: AtomicU64,
    /// 已完成（含失败）的帧总数
    pub completed_frames: AtomicU64,

    next_queue_id: AtomicU64,
    next_render_pass_id: AtomicU64,
    next_pipeline_id: AtomicU64,
    next_descriptor_set_id: AtomicU64,
    next_dependency_event_id: AtomicU64,
}

lazy_static! {
    pub static ref COUNTERS: GlobalCounters = GlobalCounters {
        live_frames: AtomicU64::new(0),
        submitted_frames: AtomicU64::new(0),
        completed_frames: AtomicU64::new(0),
        next_queue_id: AtomicU64::new(1),
        next_render_pass_id: AtomicU64::new(1),
        next_pipeline_id: AtomicU64::new(1),
        next_descriptor_set_id: AtomicU64::new(1),
        next_dependency_event_id: AtomicU64::new(1),
    };
}

impl GlobalCounters {
    #[inline]
    pub fn next_queue_id(&self) -> u64 {
        self.next_queue_id.fetch_add(1, Ordering::Relaxed)
    }

    #[inline]
    pub fn next_render_pass_id(&self) -> u64 {
        self.next_render_pass_id.fetch_add(1, Ordering::Relaxed)
    }

    #[inline]
    pub fn next_pipeline_id(&self) -> u64 {
        self.next_pipeline_id.fetch_add(1, Ordering::Relaxed)
    }

    #[inline]
    pub fn next_descriptor_set_id(&self) -> u64 {
        self.next_descriptor_set_id.fetch_add(1, Ordering::Relaxed)
    }

    #[inline]
    pub fn next_dependency_event_id(&self) -> u64 {
        self.next_dependency_event_id.fetch_add(1, Ordering::Relaxed)
    }
}
