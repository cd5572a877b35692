//! Victim selection for the frame table.
//!
//! A policy only decides *which* frame to look at next. Whether a frame can be
//! evicted at all (pinned, shared, busy) and whether it was recently used is
//! reported back by the frame table through a check.

use super::FrameId;
use alloc::collections::VecDeque;

/// What the frame table knows about a frame a policy asked about.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum FrameCheck {
    /// Free, pinned, shared or otherwise not evictable right now.
    Skip,
    /// Evictable, but accessed since the last check. The accessed bit has been
    /// cleared as part of the check.
    Referenced,
    /// Evictable and not recently used.
    Candidate,
}

pub trait ReplacementPolicy: Send {
    /// `frame` was just bound to a page.
    fn bound(&mut self, _frame: FrameId) {}

    /// `frame` lost its page, by eviction or release.
    fn released(&mut self, _frame: FrameId) {}

    /// Returns a frame to evict, or [`None`] if no frame out of `frame_count`
    /// can be evicted.
    fn select_victim(
        &mut self,
        frame_count: usize,
        check_frame: &mut dyn FnMut(FrameId) -> FrameCheck,
    ) -> Option<FrameId>;
}

/// Second chance. The hand sweeps the core map, clearing accessed bits, and
/// stops at the first frame that was not used since the hand last passed it.
#[derive(Default)]
pub struct Clock {
    hand: usize,
}

impl ReplacementPolicy for Clock {
    fn select_victim(
        &mut self,
        frame_count: usize,
        check_frame: &mut dyn FnMut(FrameId) -> FrameCheck,
    ) -> Option<FrameId> {
        if frame_count == 0 {
            return None;
        }

        // Two full turns: the first may only clear accessed bits.
        for _ in 0..2 * frame_count {
            let frame = self.hand % frame_count;
            self.hand = (frame + 1) % frame_count;

            if check_frame(frame) == FrameCheck::Candidate {
                return Some(frame);
            }
        }

        None
    }
}

/// Evicts frames in the order they were bound, ignoring accessed bits.
#[derive(Default)]
pub struct Fifo {
    queue: VecDeque<FrameId>,
}

impl ReplacementPolicy for Fifo {
    fn bound(&mut self, frame: FrameId) {
        if !self.queue.contains(&frame) {
            self.queue.push_back(frame);
        }
    }

    fn released(&mut self, frame: FrameId) {
        self.queue.retain(|&queued| queued != frame);
    }

    fn select_victim(
        &mut self,
        _frame_count: usize,
        check_frame: &mut dyn FnMut(FrameId) -> FrameCheck,
    ) -> Option<FrameId> {
        for _ in 0..self.queue.len() {
            let frame = self.queue.pop_front()?;
            // Rotate even on success so a victim that turns out to be busy is
            // not offered again straight away.
            self.queue.push_back(frame);

            if check_frame(frame) != FrameCheck::Skip {
                return Some(frame);
            }
        }

        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    /// Checks backed by per-frame (evictable, accessed) flags, clearing
    /// accessed bits the way the frame table does.
    fn check_with(frames: &mut [(bool, bool)]) -> impl FnMut(FrameId) -> FrameCheck + '_ {
        move |frame| {
            let (evictable, accessed) = &mut frames[frame];
            if !*evictable {
                FrameCheck::Skip
            } else if *accessed {
                *accessed = false;
                FrameCheck::Referenced
            } else {
                FrameCheck::Candidate
            }
        }
    }

    #[test]
    fn test_clock_second_chance() {
        let mut frames = [(true, true), (false, false), (true, false), (true, true)];
        let mut clock = Clock::default();

        // Frame 0 gets a second chance, 1 is pinned, 2 goes.
        assert_eq!(clock.select_victim(4, &mut check_with(&mut frames)), Some(2));
        assert!(!frames[0].1);

        // The hand continues past 2: 3 gets a second chance, 0 was cleared.
        assert_eq!(clock.select_victim(4, &mut check_with(&mut frames)), Some(0));
        assert!(!frames[3].1);
    }

    #[test]
    fn test_clock_all_referenced() {
        let mut frames = [(true, true), (true, true)];
        let mut clock = Clock { hand: 1 };
        assert_eq!(clock.select_victim(2, &mut check_with(&mut frames)), Some(1));
    }

    #[test]
    fn test_clock_nothing_evictable() {
        let mut frames = [(false, false); 4];
        let mut clock = Clock::default();
        assert_eq!(clock.select_victim(4, &mut check_with(&mut frames)), None);
        assert_eq!(clock.select_victim(0, &mut check_with(&mut [])), None);
    }

    #[test]
    fn test_fifo_order() {
        let mut frames = [(true, true), (true, false), (false, false)];
        let mut fifo = Fifo::default();
        fifo.bound(2);
        fifo.bound(0);
        fifo.bound(1);

        // 2 is pinned, 0 is oldest; recency does not matter.
        assert_eq!(fifo.select_victim(3, &mut check_with(&mut frames)), Some(0));
        fifo.released(0);
        assert_eq!(fifo.select_victim(3, &mut check_with(&mut frames)), Some(1));
    }

    #[test]
    fn test_fifo_busy_victim_rotates() {
        let mut frames = [(true, false), (true, false)];
        let mut fifo = Fifo::default();
        fifo.bound(0);
        fifo.bound(1);

        // Without a release in between, the next call moves on.
        assert_eq!(fifo.select_victim(2, &mut check_with(&mut frames)), Some(0));
        assert_eq!(fifo.select_victim(2, &mut check_with(&mut frames)), Some(1));
    }
}
