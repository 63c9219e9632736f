//! 附件与 pass 的状态定义
//!
//! 两组状态都是全序，只允许单调前进（见 `frame_queue`）。

/// 附件状态（全序）
///
/// `Detached` 与 `Complete` 是同一层级的分支：外部持有的 render target
/// 走 `Detached`（跳过缓存回收），普通附件走 `Complete`。
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum FgAttachmentState {
    Initial,
    Setup,
    InputRequired,
    Ready,
    ResourcesPending,
    ResourcesAcquired,
    Detached,
    Complete,
    ResourcesReleased,
    Finalized,
}

/// Pass 状态（全序）
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum FgPassState {
    Initial,
    Ready,
    Owned,
    ResourcesAcquired,
    Prepared,
    Submission,
    Submitted,
    Complete,
    Finalized,
}
