//! Local movement state.
//!
//! Only the part of movement the client owns: counting jumps since the last
//! landing. The count lives in an [`ObservableCell`] with a logging listener
//! installed for the cell's whole lifetime.

use skirmish_shared::cell::ObservableCell;
use tracing::info;

/// User input state at a moment in time.
#[derive(Debug, Clone, Copy, Default)]
pub struct InputState {
    pub jump: bool,
}

/// Jumps since the last landing.
#[derive(Debug, Clone)]
pub struct JumpCounter {
    cell: ObservableCell<u32>,
}

impl Default for JumpCounter {
    fn default() -> Self {
        Self::new()
    }
}

impl JumpCounter {
    pub fn new() -> Self {
        let cell = ObservableCell::new(0u32);
        cell.subscribe(|count| {
            info!(jump_count = *count, "Jump count changed");
            Ok(())
        })
        .keep();
        Self { cell }
    }

    pub fn count(&self) -> u32 {
        self.cell.get()
    }

    /// The underlying cell, for UI subscriptions.
    pub fn cell(&self) -> &ObservableCell<u32> {
        &self.cell
    }

    fn increment(&self) {
        self.cell.update(|n| *n += 1);
    }

    fn reset(&self) {
        self.cell.set(0);
    }
}

/// Turns per-frame input into jumps and landings.
#[derive(Debug, Clone)]
pub struct Movement {
    jumps: JumpCounter,
    max_jumps: u32,
    grounded: bool,
    jump_held: bool,
}

impl Movement {
    pub fn new(max_jumps: u32) -> Self {
        Movement {
            jumps: JumpCounter::new(),
            max_jumps,
            grounded: true,
            jump_held: false,
        }
    }

    pub fn jumps(&self) -> &JumpCounter {
        &self.jumps
    }

    pub fn is_grounded(&self) -> bool {
        self.grounded
    }

    /// Applies one frame of input. Returns true if a jump started.
    ///
    /// A jump triggers on the press edge only, and only while jumps remain.
    pub fn apply(&mut self, input: InputState) -> bool {
        let pressed = input.jump && !self.jump_held;
        self.jump_held = input.jump;
        if !pressed || self.jumps.count() >= self.max_jumps {
            return false;
        }
        self.grounded = false;
        self.jumps.increment();
        true
    }

    /// Touching the ground resets the counter.
    pub fn land(&mut self) {
        if self.grounded {
            return;
        }
        self.grounded = true;
        self.jumps.reset();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::{Arc, Mutex};

    fn press() -> InputState {
        InputState { jump: true }
    }

    #[test]
    fn holding_jump_counts_once() {
        let mut m = Movement::new(2);
        assert!(m.apply(press()));
        assert!(!m.apply(press()));
        assert_eq!(m.jumps().count(), 1);
    }

    #[test]
    fn jumps_are_capped_until_landing() {
        let mut m = Movement::new(2);
        for _ in 0..3 {
            m.apply(press());
            m.apply(InputState::default());
        }
        assert_eq!(m.jumps().count(), 2);

        m.land();
        assert!(m.is_grounded());
        assert_eq!(m.jumps().count(), 0);
        assert!(m.apply(press()));
    }

    #[test]
    fn ui_listener_sees_every_change() {
        let mut m = Movement::new(3);
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&seen);
        let _sub = m.jumps().cell().subscribe(move |n| {
            sink.lock().unwrap().push(*n);
            Ok(())
        });

        m.apply(press());
        m.apply(InputState::default());
        m.apply(press());
        m.land();
        m.land();

        assert_eq!(*seen.lock().unwrap(), vec![1, 2, 0]);
        assert_eq!(m.jumps().cell().subscriber_count(), 2);
    }
}
