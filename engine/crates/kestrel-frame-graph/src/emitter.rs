//! 帧发射器
//!
//! 帧节奏的唯一决策点：维护在飞（in-flight）与待发（pending）两个集合，
//! 按固定间隔减去安全偏移的节奏放行新帧。时间以参数传入（`Instant`），
//! 测试可以完全离线地驱动它。

use std::collections::VecDeque;
use std::time::{Duration, Instant};

use crate::frame_handle::FrameId;

/// 简单滑动窗口均值
pub struct MovingAverage {
    window: VecDeque<f64>,
    capacity: usize,
    sum: f64,
}

impl MovingAverage {
    pub fn new(capacity: usize) -> Self {
        Self {
            window: VecDeque::with_capacity(capacity),
            capacity: capacity.max(1),
            sum: 0.0,
        }
    }

    pub fn push(&mut self, value: f64) {
        if self.window.len() == self.capacity {
            if let Some(old) = self.window.pop_front() {
                self.sum -= old;
            }
        }
        self.window.push_back(value);
        self.sum += value;
    }

    #[inline]
    pub fn average(&self) -> f64 {
        if self.window.is_empty() {
            0.0
        } else {
            self.sum / self.window.len() as f64
        }
    }

    #[inline]
    pub fn sample_count(&self) -> usize {
        self.window.len()
    }
}

/// 在飞帧的记录
struct InFlight {
    id: FrameId,
    submitted: bool,
    started_at: Instant,
}

/// 帧发射器
pub struct FgFrameEmitter {
    frame_interval: Duration,
    /// 提前量：实际放行节奏是 interval - safety_offset
    safety_offset: Duration,
    /// 按需模式：不受节奏限制，入队即可放行
    on_demand: bool,

    in_flight: Vec<InFlight>,
    pending: VecDeque<FrameId>,

    /// 最近一次放行时刻
    last_start: Option<Instant>,
    /// 放行序号，用于识别过期的定时器回调
    order: u64,
    /// 失效代：invalidate 之后旧帧的回报全部忽略
    generation: u64,

    submit_time: MovingAverage,
    frame_time: MovingAverage,
}

// new & init
impl FgFrameEmitter {
    pub fn new(frame_interval: Duration) -> Self {
        Self {
            frame_interval,
            safety_offset: Duration::ZERO,
            on_demand: false,
            in_flight: Vec::new(),
            pending: VecDeque::new(),
            last_start: None,
            order: 0,
            generation: 0,
            submit_time: MovingAverage::new(32),
            frame_time: MovingAverage::new(32),
        }
    }

    #[inline]
    pub fn with_safety_offset(mut self, offset: Duration) -> Self {
        self.safety_offset = offset.min(self.frame_interval);
        self
    }

    #[inline]
    pub fn set_on_demand(&mut self, on_demand: bool) {
        self.on_demand = on_demand;
    }
}

// getters
impl FgFrameEmitter {
    #[inline]
    pub fn generation(&self) -> u64 {
        self.generation
    }

    #[inline]
    pub fn order(&self) -> u64 {
        self.order
    }

    #[inline]
    pub fn in_flight_count(&self) -> usize {
        self.in_flight.len()
    }

    #[inline]
    pub fn pending_count(&self) -> usize {
        self.pending.len()
    }

    #[inline]
    pub fn average_submit_time(&self) -> f64 {
        self.submit_time.average()
    }

    #[inline]
    pub fn average_frame_time(&self) -> f64 {
        self.frame_time.average()
    }

    /// 放行的最小间隔
    #[inline]
    fn pace(&self) -> Duration {
        self.frame_interval.saturating_sub(self.safety_offset)
    }
}

// 节奏
impl FgFrameEmitter {
    /// 接受一个新帧进入待发集合
    ///
    /// 在飞之外至多允许两个待发帧，超出即拒绝。
    pub fn enqueue(&mut self, id: FrameId) -> bool {
        if self.pending.len() >= 2 {
            log::warn!("FgFrameEmitter: pending queue full, frame rejected");
            return false;
        }
        self.pending.push_back(id);
        true
    }

    /// 集合条件是否允许放行（不考虑时间）
    ///
    /// 全部在飞帧已提交，且提交后尚未完成的至多一个。
    pub fn can_start(&self) -> bool {
        if self.pending.is_empty() {
            return false;
        }
        self.in_flight.iter().all(|f| f.submitted) && self.in_flight.len() <= 1
    }

    /// 下一次允许放行的时刻；集合条件不满足时为 None
    pub fn next_deadline(&self) -> Option<Instant> {
        if !self.can_start() {
            return None;
        }
        match self.last_start {
            None => None,
            Some(last) => Some(last + self.pace()),
        }
    }

    /// 尝试放行下一帧
    pub fn start_next(&mut self, now: Instant) -> Option<FrameId> {
        if !self.can_start() {
            return None;
        }
        if !self.on_demand {
            if let Some(last) = self.last_start {
                if now < last + self.pace() {
                    return None;
                }
            }
        }
        let id = self.pending.pop_front()?;
        self.in_flight.push(InFlight { id, submitted: false, started_at: now });
        self.last_start = Some(now);
        self.order += 1;
        Some(id)
    }

    /// 过期定时器识别：回调携带的序号与当前不符则忽略
    #[inline]
    pub fn is_stale_order(&self, order: u64) -> bool {
        order != self.order
    }

    /// 某在飞帧的全部 pass 已提交
    pub fn set_frame_submitted(&mut self, id: FrameId, now: Instant) {
        if let Some(frame) = self.in_flight.iter_mut().find(|f| f.id == id) {
            if !frame.submitted {
                frame.submitted = true;
                self.submit_time.push(now.duration_since(frame.started_at).as_secs_f64());
            }
        }
    }

    /// 某在飞帧完成（成功或失败），从集合移除
    pub fn on_frame_complete(&mut self, id: FrameId, now: Instant) {
        if let Some(index) = self.in_flight.iter().position(|f| f.id == id) {
            let frame = self.in_flight.swap_remove(index);
            self.frame_time.push(now.duration_since(frame.started_at).as_secs_f64());
        } else {
            self.pending.retain(|&p| p != id);
        }
    }

    /// 整体失效：代数自增，清空两个集合并返回受影响的帧
    pub fn invalidate(&mut self) -> Vec<FrameId> {
        self.generation += 1;
        let mut affected: Vec<FrameId> = self.in_flight.drain(..).map(|f| f.id).collect();
        affected.extend(self.pending.drain(..));
        self.last_start = None;
        affected
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use slotmap::SlotMap;

    fn ids(n: usize) -> Vec<FrameId> {
        let mut map: SlotMap<FrameId, ()> = SlotMap::with_key();
        (0..n).map(|_| map.insert(())).collect()
    }

    #[test]
    fn test_moving_average_window() {
        let mut avg = MovingAverage::new(2);
        assert_eq!(avg.average(), 0.0);
        avg.push(1.0);
        avg.push(3.0);
        assert_eq!(avg.average(), 2.0);
        avg.push(5.0);
        // 窗口滑出 1.0
        assert_eq!(avg.average(), 4.0);
    }

    #[test]
    fn test_pacing_blocks_early_start() {
        let ids = ids(2);
        let mut emitter = FgFrameEmitter::new(Duration::from_millis(10)).with_safety_offset(Duration::from_millis(2));
        let t0 = Instant::now();

        assert!(emitter.enqueue(ids[0]));
        assert!(emitter.enqueue(ids[1]));
        assert_eq!(emitter.start_next(t0), Some(ids[0]));
        emitter.set_frame_submitted(ids[0], t0 + Duration::from_millis(1));

        // 间隔不足（10-2=8ms）：不放行
        assert_eq!(emitter.start_next(t0 + Duration::from_millis(5)), None);
        // 到点放行
        assert_eq!(emitter.start_next(t0 + Duration::from_millis(8)), Some(ids[1]));
    }

    #[test]
    fn test_unsubmitted_in_flight_blocks_start() {
        let ids = ids(2);
        let mut emitter = FgFrameEmitter::new(Duration::from_millis(1));
        let t0 = Instant::now();

        emitter.enqueue(ids[0]);
        emitter.enqueue(ids[1]);
        assert_eq!(emitter.start_next(t0), Some(ids[0]));
        // 前帧未提交：集合条件不满足
        assert_eq!(emitter.start_next(t0 + Duration::from_secs(1)), None);

        emitter.set_frame_submitted(ids[0], t0);
        assert_eq!(emitter.start_next(t0 + Duration::from_secs(1)), Some(ids[1]));
    }

    #[test]
    fn test_two_submitted_unfinished_frames_block_third() {
        let ids = ids(3);
        let mut emitter = FgFrameEmitter::new(Duration::ZERO);
        let t0 = Instant::now();

        emitter.enqueue(ids[0]);
        emitter.enqueue(ids[1]);
        assert_eq!(emitter.start_next(t0), Some(ids[0]));
        emitter.set_frame_submitted(ids[0], t0);
        assert_eq!(emitter.start_next(t0), Some(ids[1]));
        emitter.set_frame_submitted(ids[1], t0);

        // 两个已提交未完成的帧在飞：第三帧不放行
        emitter.enqueue(ids[2]);
        assert_eq!(emitter.start_next(t0), None);

        emitter.on_frame_complete(ids[0], t0);
        assert_eq!(emitter.start_next(t0), Some(ids[2]));
    }

    #[test]
    fn test_pending_capacity() {
        let ids = ids(3);
        let mut emitter = FgFrameEmitter::new(Duration::from_millis(1));
        assert!(emitter.enqueue(ids[0]));
        assert!(emitter.enqueue(ids[1]));
        assert!(!emitter.enqueue(ids[2]));
    }

    #[test]
    fn test_on_demand_ignores_pace() {
        let ids = ids(2);
        let mut emitter = FgFrameEmitter::new(Duration::from_secs(10));
        emitter.set_on_demand(true);
        let t0 = Instant::now();

        emitter.enqueue(ids[0]);
        emitter.enqueue(ids[1]);
        assert_eq!(emitter.start_next(t0), Some(ids[0]));
        emitter.set_frame_submitted(ids[0], t0);
        assert_eq!(emitter.start_next(t0), Some(ids[1]));
    }

    #[test]
    fn test_stale_order_detection() {
        let ids = ids(1);
        let mut emitter = FgFrameEmitter::new(Duration::from_millis(1));
        let ticket = emitter.order();
        emitter.enqueue(ids[0]);
        emitter.start_next(Instant::now());
        assert!(emitter.is_stale_order(ticket));
        assert!(!emitter.is_stale_order(emitter.order()));
    }

    #[test]
    fn test_invalidate_drains_everything() {
        let ids = ids(2);
        let mut emitter = FgFrameEmitter::new(Duration::from_millis(1));
        emitter.enqueue(ids[0]);
        emitter.enqueue(ids[1]);
        emitter.start_next(Instant::now());

        let generation = emitter.generation();
        let affected = emitter.invalidate();
        assert_eq!(affected.len(), 2);
        assert_eq!(emitter.generation(), generation + 1);
        assert_eq!(emitter.in_flight_count(), 0);
        assert_eq!(emitter.pending_count(), 0);
    }

    #[test]
    fn test_complete_frees_in_flight_slot() {
        let ids = ids(2);
        let mut emitter = FgFrameEmitter::new(Duration::ZERO);
        let t0 = Instant::now();
        emitter.enqueue(ids[0]);
        emitter.start_next(t0);
        emitter.set_frame_submitted(ids[0], t0);
        emitter.on_frame_complete(ids[0], t0 + Duration::from_millis(4));

        assert_eq!(emitter.in_flight_count(), 0);
        assert!(emitter.average_frame_time() > 0.0);
        // 后续帧不被已完成的帧阻塞
        emitter.enqueue(ids[1]);
        assert_eq!(emitter.start_next(t0 + Duration::from_millis(5)), Some(ids[1]));
    }
}
