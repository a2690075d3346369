// Copyright 2025 Colin Marc <hi@colinmarc.com>
//
// SPDX-License-Identifier: BUSL-1.1

//! Per-window frame pacing.
//!
//! Each window carries a sync counter; a frame begins by bumping the counter
//! to an odd value and commits by bumping it to the following even value.
//! The compositing manager answers with frame-drawn and frame-timings
//! messages carrying the even value, which is the frame id. Only messages
//! carrying the armed id advance the state machine.

const DEFAULT_REFRESH_US: u32 = 16_667;

/// What a frame-clock transition means to the role.
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub enum FrameEvent {
    Started,
    NotifyDisablePresent,
    Presented,
    Complete,
}

#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub enum StartFrame {
    /// A new frame began; the counter should be set to this (odd) value.
    Started(u64),
    /// An in-progress frame can still absorb this commit.
    Batched,
    Refused,
}

#[derive(Debug)]
pub struct FrameClock {
    counter_value: u64,
    pending_frame: Option<u64>,
    last_complete: Option<u64>,

    frozen: u32,
    in_frame: bool,
    frame_start_ms: u64,

    predict_refresh: bool,
    refresh_interval_us: u32,
    last_frame_time_ms: u64,
}

impl FrameClock {
    pub fn new() -> Self {
        Self {
            counter_value: 0,
            pending_frame: None,
            last_complete: None,

            frozen: 0,
            in_frame: false,
            frame_start_ms: 0,

            predict_refresh: false,
            refresh_interval_us: DEFAULT_REFRESH_US,
            last_frame_time_ms: 0,
        }
    }

    pub fn frozen(&self) -> bool {
        self.frozen > 0
    }

    /// Called when the window manager requests synchronization. Frames stop
    /// until the matching unfreeze.
    pub fn freeze(&mut self) {
        self.frozen += 1;
    }

    pub fn unfreeze(&mut self) {
        debug_assert!(self.frozen > 0);
        self.frozen = self.frozen.saturating_sub(1);
    }

    /// Enables sub-frame batching, used when a desynchronized descendant
    /// should coalesce with the parent's cadence.
    pub fn set_predict_refresh(&mut self, on: bool) {
        self.predict_refresh = on;
    }

    /// The last draw timestamp, in flat monotonic milliseconds.
    pub fn frame_time(&self) -> u64 {
        self.last_frame_time_ms
    }

    pub fn start_frame(&mut self, now_ms: u64, force: bool) -> StartFrame {
        if self.frozen() && !force {
            return StartFrame::Refused;
        }

        if self.in_frame {
            let budget = (self.refresh_interval_us / 1000) as u64;
            if force || (self.predict_refresh && now_ms < self.frame_start_ms + budget.max(1)) {
                return StartFrame::Batched;
            }

            return StartFrame::Refused;
        }

        // Odd value: frame in progress.
        if self.counter_value % 2 == 0 {
            self.counter_value += 1;
        } else {
            self.counter_value += 2;
        }

        self.in_frame = true;
        self.frame_start_ms = now_ms;

        StartFrame::Started(self.counter_value)
    }

    /// Commits the frame. Returns the (even) counter value to publish, which
    /// doubles as the id frame-drawn messages must carry.
    pub fn end_frame(&mut self) -> Option<u64> {
        if !self.in_frame || self.pending_frame.is_some() {
            return None;
        }

        self.counter_value += 1;
        self.pending_frame = Some(self.counter_value);

        Some(self.counter_value)
    }

    /// A frame-drawn message arrived. True if it completes the armed frame;
    /// stale or unknown ids are ignored.
    pub fn handle_frame_drawn(&mut self, id: u64, time_ms: u64) -> bool {
        if self.pending_frame != Some(id) {
            return false;
        }

        self.pending_frame = None;
        self.last_complete = Some(id);
        self.in_frame = false;
        self.last_frame_time_ms = time_ms;

        true
    }

    /// A frame-timings message arrived. True if it refers to the most
    /// recently completed frame (and so carries its presentation time).
    pub fn handle_frame_timings(&mut self, id: u64, refresh_us: u32) -> bool {
        if refresh_us > 0 {
            self.refresh_interval_us = refresh_us;
        }

        self.last_complete == Some(id)
    }

    /// Drops any armed frame, e.g. when the window is unmapped and no
    /// drawn message will ever arrive.
    pub fn cancel(&mut self) {
        self.pending_frame = None;
        self.in_frame = false;
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn basic_cycle() {
        let mut clock = FrameClock::new();

        let StartFrame::Started(odd) = clock.start_frame(0, false) else {
            panic!("expected start");
        };
        assert_eq!(odd % 2, 1);

        let even = clock.end_frame().unwrap();
        assert_eq!(even, odd + 1);

        // A stale id does nothing.
        assert!(!clock.handle_frame_drawn(even - 2, 16));
        assert!(clock.handle_frame_drawn(even, 16));
        assert_eq!(clock.frame_time(), 16);

        assert!(clock.handle_frame_timings(even, 16_667));
    }

    #[test]
    fn frozen_refuses() {
        let mut clock = FrameClock::new();
        clock.freeze();
        assert_eq!(clock.start_frame(0, false), StartFrame::Refused);

        clock.unfreeze();
        assert!(matches!(clock.start_frame(0, false), StartFrame::Started(_)));
    }

    #[test]
    fn nested_freeze() {
        let mut clock = FrameClock::new();
        clock.freeze();
        clock.freeze();
        clock.unfreeze();
        assert!(clock.frozen());
        clock.unfreeze();
        assert!(!clock.frozen());
    }

    #[test]
    fn batching_within_budget() {
        let mut clock = FrameClock::new();
        clock.set_predict_refresh(true);

        assert!(matches!(clock.start_frame(100, false), StartFrame::Started(_)));
        assert_eq!(clock.start_frame(105, false), StartFrame::Batched);
        // Past the vblank budget.
        assert_eq!(clock.start_frame(200, false), StartFrame::Refused);
    }

    #[test]
    fn no_double_end() {
        let mut clock = FrameClock::new();
        clock.start_frame(0, false);
        assert!(clock.end_frame().is_some());
        assert_eq!(clock.end_frame(), None);
    }
}
