//! The GDB event queue: one pending-event slot per VCPU (§3 "GDB event";
//! §4.K "Event queue"). A VCPU that stops for a reason GDB cares about
//! (breakpoint, single-step completion, signal) parks an event here; the
//! command loop drains it into a stop reply the next time it's polled.

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StopReason {
    Breakpoint,
    Step,
    Signal(i32),
    Exited(i32),
    Terminated(i32),
}

#[derive(Debug, Clone, Copy)]
pub struct GdbEvent {
    pub vcpu_id: usize,
    pub reason: StopReason,
}

/// One slot per VCPU; a later event for the same VCPU overwrites an
/// undrained one rather than queuing — GDB only ever asks about the most
/// recent stop.
#[derive(Debug, Default)]
pub struct EventQueue {
    slots: Vec<Option<GdbEvent>>,
}

impl EventQueue {
    pub fn new(vcpu_count: usize) -> Self {
        Self {
            slots: vec![None; vcpu_count],
        }
    }

    pub fn post(&mut self, vcpu_id: usize, reason: StopReason) {
        self.slots[vcpu_id] = Some(GdbEvent { vcpu_id, reason });
    }

    /// Drain the oldest-indexed pending event, if any.
    pub fn take_any(&mut self) -> Option<GdbEvent> {
        let idx = self.slots.iter().position(|s| s.is_some())?;
        self.slots[idx].take()
    }

    pub fn take(&mut self, vcpu_id: usize) -> Option<GdbEvent> {
        self.slots[vcpu_id].take()
    }

    pub fn has_pending(&self) -> bool {
        self.slots.iter().any(Option::is_some)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn later_event_overwrites_an_undrained_one() {
        let mut q = EventQueue::new(2);
        q.post(0, StopReason::Step);
        q.post(0, StopReason::Breakpoint);
        assert_eq!(q.take(0).unwrap().reason, StopReason::Breakpoint);
        assert!(q.take(0).is_none());
    }

    #[test]
    fn take_any_drains_lowest_vcpu_id_first() {
        let mut q = EventQueue::new(3);
        q.post(2, StopReason::Signal(5));
        q.post(0, StopReason::Breakpoint);
        let first = q.take_any().unwrap();
        assert_eq!(first.vcpu_id, 0);
        let second = q.take_any().unwrap();
        assert_eq!(second.vcpu_id, 2);
        assert!(!q.has_pending());
    }
}
