//! Deadline queue synchronized with a kernel timer descriptor.

use std::collections::HashMap;
use std::io;
use std::os::fd::RawFd;
use std::time::Instant;

use tracing::warn;

use crate::error::Error;
use crate::event_loop::EventLoop;

/// Callback invoked on the loop thread when a deadline expires.
pub type TimerCallback = Box<dyn FnMut(&mut EventLoop) + Send>;

/// One scheduled deadline, identified by the connection descriptor it
/// belongs to. At most one live timer exists per identifier.
pub struct Timer {
    pub id: RawFd,
    pub deadline: Instant,
    pub callback: Option<TimerCallback>,
}

impl Timer {
    /// A deadline with no callback of its own. Useful for adjusting an
    /// existing timer: the callback installed at insert time is kept.
    pub fn new(id: RawFd, deadline: Instant) -> Self {
        Timer {
            id,
            deadline,
            callback: None,
        }
    }

    pub fn with_callback(
        id: RawFd,
        deadline: Instant,
        cb: impl FnMut(&mut EventLoop) + Send + 'static,
    ) -> Self {
        Timer {
            id,
            deadline,
            callback: Some(Box::new(cb)),
        }
    }
}

impl std::fmt::Debug for Timer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Timer")
            .field("id", &self.id)
            .field("deadline", &self.deadline)
            .field("has_callback", &self.callback.is_some())
            .finish()
    }
}

/// Min-heap of timers plus an id-to-slot map for O(log n) adjust and
/// remove, kept coherent with one kernel timer descriptor.
///
/// After every public operation the descriptor is armed to the earliest
/// deadline, or disarmed when the heap is empty. All operations run on
/// the owning loop's thread; other threads reach the queue through the
/// loop's task queue.
pub struct TimerQueue {
    timer_fd: RawFd,
    heap: Vec<Timer>,
    slots: HashMap<RawFd, usize>,
    armed: bool,
}

impl TimerQueue {
    pub fn new() -> Result<Self, Error> {
        let timer_fd = unsafe {
            libc::timerfd_create(
                libc::CLOCK_MONOTONIC,
                libc::TFD_NONBLOCK | libc::TFD_CLOEXEC,
            )
        };
        if timer_fd < 0 {
            return Err(Error::Io(io::Error::last_os_error()));
        }
        Ok(TimerQueue {
            timer_fd,
            heap: Vec::new(),
            slots: HashMap::new(),
            armed: false,
        })
    }

    /// The descriptor that becomes readable when the earliest deadline is
    /// reached. Registered with the loop as an ordinary channel.
    pub fn fd(&self) -> RawFd {
        self.timer_fd
    }

    pub fn len(&self) -> usize {
        self.heap.len()
    }

    pub fn is_empty(&self) -> bool {
        self.heap.is_empty()
    }

    pub fn contains(&self, id: RawFd) -> bool {
        self.slots.contains_key(&id)
    }

    /// Whether the kernel descriptor is currently armed.
    pub fn is_armed(&self) -> bool {
        self.armed
    }

    pub fn next_deadline(&self) -> Option<Instant> {
        self.heap.first().map(|t| t.deadline)
    }

    /// Insert a timer. Inserting an id that is already present is a
    /// programming error; release builds degrade to an adjust.
    pub fn push(&mut self, timer: Timer) {
        if self.slots.contains_key(&timer.id) {
            debug_assert!(false, "duplicate timer id {}", timer.id);
            warn!(id = timer.id, "duplicate timer push, adjusting instead");
            self.adjust(timer);
            return;
        }
        self.insert(timer);
        self.rearm();
    }

    /// Move an existing timer to a new deadline, optionally replacing its
    /// callback. An absent id degrades to an insert, which lets callers
    /// extend a liveness deadline without tracking whether the original
    /// timer already fired.
    pub fn adjust(&mut self, timer: Timer) {
        match self.slots.get(&timer.id).copied() {
            Some(slot) => {
                self.heap[slot].deadline = timer.deadline;
                if let Some(cb) = timer.callback {
                    self.heap[slot].callback = Some(cb);
                }
                let slot = self.sift_up(slot);
                self.sift_down(slot);
            }
            None => self.insert(timer),
        }
        self.rearm();
    }

    /// Drop the timer for `id`, if any.
    pub fn remove(&mut self, id: RawFd) {
        let Some(slot) = self.slots.remove(&id) else {
            return;
        };
        let last = self.heap.len() - 1;
        if slot != last {
            self.heap.swap(slot, last);
            self.slots.insert(self.heap[slot].id, slot);
        }
        self.heap.pop();
        if slot < self.heap.len() {
            let slot = self.sift_up(slot);
            self.sift_down(slot);
        }
        self.rearm();
    }

    /// Pop every timer whose deadline is at or before `now`, earliest
    /// first, and drain the descriptor's expiration count. The caller
    /// invokes the callbacks; the descriptor is re-armed to the next
    /// deadline before this returns.
    pub fn expire_due(&mut self, now: Instant) -> Vec<Timer> {
        // Reset the readable state; the expiration count is not needed.
        let mut count: u64 = 0;
        unsafe {
            libc::read(
                self.timer_fd,
                &mut count as *mut u64 as *mut libc::c_void,
                std::mem::size_of::<u64>(),
            );
        }

        let mut due = Vec::new();
        while let Some(top) = self.heap.first() {
            if top.deadline > now {
                break;
            }
            due.push(self.pop_min());
        }
        self.rearm();
        due
    }

    fn insert(&mut self, timer: Timer) {
        let slot = self.heap.len();
        self.slots.insert(timer.id, slot);
        self.heap.push(timer);
        self.sift_up(slot);
    }

    fn pop_min(&mut self) -> Timer {
        let last = self.heap.len() - 1;
        self.heap.swap(0, last);
        let min = match self.heap.pop() {
            Some(t) => t,
            None => unreachable!("pop_min on empty heap"),
        };
        self.slots.remove(&min.id);
        if !self.heap.is_empty() {
            self.slots.insert(self.heap[0].id, 0);
            self.sift_down(0);
        }
        min
    }

    fn sift_up(&mut self, mut slot: usize) -> usize {
        while slot > 0 {
            let parent = (slot - 1) / 2;
            if self.heap[parent].deadline <= self.heap[slot].deadline {
                break;
            }
            self.swap_slots(parent, slot);
            slot = parent;
        }
        slot
    }

    fn sift_down(&mut self, mut slot: usize) {
        loop {
            let left = slot * 2 + 1;
            if left >= self.heap.len() {
                break;
            }
            let right = left + 1;
            let mut child = left;
            if right < self.heap.len() && self.heap[right].deadline < self.heap[left].deadline {
                child = right;
            }
            if self.heap[slot].deadline <= self.heap[child].deadline {
                break;
            }
            self.swap_slots(slot, child);
            slot = child;
        }
    }

    fn swap_slots(&mut self, a: usize, b: usize) {
        self.heap.swap(a, b);
        self.slots.insert(self.heap[a].id, a);
        self.slots.insert(self.heap[b].id, b);
    }

    /// Program the descriptor with an absolute expiration for the heap
    /// minimum, or disarm it when the heap is empty. One-shot: expiration
    /// for later deadlines is programmed by the operation that exposes
    /// them at the top.
    fn rearm(&mut self) {
        let mut spec: libc::itimerspec = unsafe { std::mem::zeroed() };

        match self.next_deadline() {
            Some(deadline) => {
                let delta = deadline.saturating_duration_since(Instant::now());

                let mut now = libc::timespec {
                    tv_sec: 0,
                    tv_nsec: 0,
                };
                unsafe {
                    libc::clock_gettime(libc::CLOCK_MONOTONIC, &mut now);
                }

                let mut sec = now.tv_sec + delta.as_secs() as libc::time_t;
                let mut nsec = now.tv_nsec + delta.subsec_nanos() as libc::c_long;
                if nsec >= 1_000_000_000 {
                    sec += 1;
                    nsec -= 1_000_000_000;
                }
                // An all-zero value disarms; an already-due deadline must
                // still fire.
                if sec == 0 && nsec == 0 {
                    nsec = 1;
                }
                spec.it_value.tv_sec = sec;
                spec.it_value.tv_nsec = nsec;
                self.armed = true;
            }
            None => {
                self.armed = false;
            }
        }

        let rc = unsafe {
            libc::timerfd_settime(
                self.timer_fd,
                libc::TFD_TIMER_ABSTIME,
                &spec,
                std::ptr::null_mut(),
            )
        };
        if rc < 0 {
            warn!(
                error = %io::Error::last_os_error(),
                "failed to program timer descriptor"
            );
        }
    }
}

impl Drop for TimerQueue {
    fn drop(&mut self) {
        unsafe {
            libc::close(self.timer_fd);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    fn at(ms: u64) -> Instant {
        Instant::now() + Duration::from_millis(ms)
    }

    #[test]
    fn pops_in_deadline_order() {
        let mut q = TimerQueue::new().unwrap();
        q.push(Timer::new(3, at(300)));
        q.push(Timer::new(1, at(100)));
        q.push(Timer::new(2, at(200)));
        q.push(Timer::new(4, at(50)));

        let due = q.expire_due(at(1000));
        let ids: Vec<_> = due.iter().map(|t| t.id).collect();
        assert_eq!(ids, vec![4, 1, 2, 3]);
        assert!(q.is_empty());
        assert!(!q.is_armed());
    }

    #[test]
    fn expire_due_leaves_future_timers() {
        let mut q = TimerQueue::new().unwrap();
        q.push(Timer::new(1, at(10)));
        q.push(Timer::new(2, at(10_000)));

        let due = q.expire_due(at(100));
        assert_eq!(due.len(), 1);
        assert_eq!(due[0].id, 1);
        assert_eq!(q.len(), 1);
        assert!(q.contains(2));
        assert!(q.is_armed());
    }

    #[test]
    fn push_then_remove_round_trips() {
        let mut q = TimerQueue::new().unwrap();
        q.push(Timer::new(1, at(500)));
        assert!(q.is_armed());

        q.push(Timer::new(2, at(700)));
        q.remove(2);
        assert_eq!(q.len(), 1);
        assert!(q.contains(1));
        assert!(q.is_armed());

        q.remove(1);
        assert!(q.is_empty());
        assert!(!q.is_armed());
    }

    #[test]
    fn remove_absent_is_a_no_op() {
        let mut q = TimerQueue::new().unwrap();
        q.push(Timer::new(1, at(500)));
        q.remove(99);
        assert_eq!(q.len(), 1);
    }

    #[test]
    fn adjust_absent_inserts() {
        let mut q = TimerQueue::new().unwrap();
        q.adjust(Timer::new(7, at(500)));
        assert!(q.contains(7));
        assert!(q.is_armed());
    }

    #[test]
    fn adjust_moves_deadline_and_keeps_callback() {
        let mut q = TimerQueue::new().unwrap();
        let fired = std::sync::Arc::new(std::sync::atomic::AtomicBool::new(false));
        let f = fired.clone();
        q.push(Timer::with_callback(1, at(10), move |_| {
            f.store(true, std::sync::atomic::Ordering::SeqCst);
        }));
        q.push(Timer::new(2, at(20)));

        // Push id 1 past id 2 without supplying a callback.
        q.adjust(Timer::new(1, at(5_000)));
        assert_eq!(q.heap[0].id, 2);

        let due = q.expire_due(at(10_000));
        assert_eq!(due.len(), 2);
        assert_eq!(due[0].id, 2);
        assert_eq!(due[1].id, 1);
        // The insert-time callback survived the adjust.
        assert!(due[1].callback.is_some());
    }

    #[test]
    fn slot_map_stays_consistent_under_churn() {
        let mut q = TimerQueue::new().unwrap();
        for id in 0..32 {
            q.push(Timer::new(id, at(1000 + (id as u64 * 37) % 500)));
        }
        for id in (0..32).step_by(3) {
            q.remove(id);
        }
        for id in (0..32).skip(1).step_by(3) {
            q.adjust(Timer::new(id, at(10)));
        }

        for (id, slot) in &q.slots {
            assert_eq!(q.heap[*slot].id, *id, "slot map points at wrong entry");
        }

        let due = q.expire_due(at(100));
        let mut ids: Vec<_> = due.iter().map(|t| t.id).collect();
        ids.sort_unstable();
        let expected: Vec<_> = (0..32).skip(1).step_by(3).collect();
        assert_eq!(ids, expected);
    }
}
