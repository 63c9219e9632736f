//! 帧间依赖事件
//!
//! 一次性事件：submitted -> signaled(success | failed)。帧可以在放行提交前
//! 等待若干事件，也可以在自己完成时 signal 事件。等待者以回调形式挂起，
//! signal 时在 loop 线程上逐个唤醒。

use std::cell::RefCell;
use std::rc::Rc;

use crate::counters::COUNTERS;

struct Inner {
    id: u64,
    submitted: bool,
    signaled: bool,
    failed: bool,
    waiters: Vec<Box<dyn FnOnce(bool)>>,
}

/// 一次性依赖事件（loop 线程内共享）
#[derive(Clone)]
pub struct FgDependencyEvent {
    inner: Rc<RefCell<Inner>>,
}

impl FgDependencyEvent {
    pub fn new() -> Self {
        Self {
            inner: Rc::new(RefCell::new(Inner {
                id: COUNTERS.next_dependency_event_id(),
                submitted: false,
                signaled: false,
                failed: false,
                waiters: Vec::new(),
            })),
        }
    }

    #[inline]
    pub fn id(&self) -> u64 {
        self.inner.borrow().id
    }

    #[inline]
    pub fn is_submitted(&self) -> bool {
        self.inner.borrow().submitted
    }

    #[inline]
    pub fn is_signaled(&self) -> bool {
        self.inner.borrow().signaled
    }

    #[inline]
    pub fn is_failed(&self) -> bool {
        self.inner.borrow().failed
    }

    /// 标记事件已随某个帧提交
    pub fn submit(&self) {
        self.inner.borrow_mut().submitted = true;
    }

    /// signal 事件并唤醒全部等待者；重复 signal 是 no-op
    pub fn signal(&self, success: bool) {
        let waiters = {
            let mut inner = self.inner.borrow_mut();
            if inner.signaled {
                return;
            }
            inner.signaled = true;
            inner.failed = !success;
            std::mem::take(&mut inner.waiters)
        };
        // 回调在 borrow 之外执行，允许回调里再次访问事件
        for waiter in waiters {
            waiter(success);
        }
    }

    /// 已 signal 则立即回调，否则挂起
    pub fn wait(&self, cb: Box<dyn FnOnce(bool)>) {
        let success = {
            let mut inner = self.inner.borrow_mut();
            if !inner.signaled {
                inner.waiters.push(cb);
                return;
            }
            !inner.failed
        };
        // 回调在 borrow 之外执行
        cb(success);
    }
}

impl Default for FgDependencyEvent {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_wait_before_signal() {
        let event = FgDependencyEvent::new();
        let fired = Rc::new(RefCell::new(None));
        let fired2 = fired.clone();
        event.wait(Box::new(move |ok| *fired2.borrow_mut() = Some(ok)));
        assert!(fired.borrow().is_none());

        event.signal(true);
        assert_eq!(*fired.borrow(), Some(true));
    }

    #[test]
    fn test_wait_after_failed_signal() {
        let event = FgDependencyEvent::new();
        event.signal(false);

        let fired = Rc::new(RefCell::new(None));
        let fired2 = fired.clone();
        event.wait(Box::new(move |ok| *fired2.borrow_mut() = Some(ok)));
        assert_eq!(*fired.borrow(), Some(false));
    }

    #[test]
    fn test_signal_is_idempotent() {
        let event = FgDependencyEvent::new();
        event.signal(true);
        event.signal(false);
        assert!(!event.is_failed());
    }
}
