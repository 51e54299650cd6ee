//! Device-wide lifecycle state packed with the in-flight transfer count
//!
//! Polling threads, transport completion callbacks and power notifications
//! all race on this word. Every change is a compare-and-swap retry loop over
//! the whole `(state, in_flight)` pair, so no transition can observe a count
//! from one state and commit it in another.
//!
//! ```text
//! STOPPED --start--> IDLE --poll--> RUNNING
//!                     ^                |
//!                     +--in_flight=0---+
//! STOPPED/IDLE/RUNNING --sleep--> SLEEP --wake--> IDLE
//! any non-terminal --kill--> KILLED
//! ```

use serde::Serialize;
use std::sync::atomic::{AtomicU64, Ordering};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[repr(u8)]
pub enum LifecycleState {
    Stopped = 0,
    Idle = 1,
    Running = 2,
    Sleep = 3,
    Killed = 4,
}

impl LifecycleState {
    fn from_bits(bits: u8) -> Self {
        match bits {
            0 => LifecycleState::Stopped,
            1 => LifecycleState::Idle,
            2 => LifecycleState::Running,
            3 => LifecycleState::Sleep,
            _ => LifecycleState::Killed,
        }
    }

    pub fn is_terminal(self) -> bool {
        self == LifecycleState::Killed
    }
}

/// One decoded value of the packed word
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StateWord {
    pub state: LifecycleState,
    pub in_flight: u32,
}

impl StateWord {
    const COUNT_MASK: u64 = 0xffff_ffff;

    fn pack(self) -> u64 {
        ((self.state as u64) << 32) | u64::from(self.in_flight)
    }

    fn unpack(bits: u64) -> Self {
        Self {
            state: LifecycleState::from_bits((bits >> 32) as u8),
            in_flight: (bits & Self::COUNT_MASK) as u32,
        }
    }

    fn with_state(self, state: LifecycleState) -> Self {
        Self { state, ..self }
    }
}

#[derive(Debug)]
pub struct PipeState {
    word: AtomicU64,
}

impl Default for PipeState {
    fn default() -> Self {
        Self::new()
    }
}

impl PipeState {
    pub fn new() -> Self {
        let initial = StateWord {
            state: LifecycleState::Stopped,
            in_flight: 0,
        };
        Self {
            word: AtomicU64::new(initial.pack()),
        }
    }

    pub fn load(&self) -> StateWord {
        StateWord::unpack(self.word.load(Ordering::Acquire))
    }

    pub fn state(&self) -> LifecycleState {
        self.load().state
    }

    pub fn in_flight(&self) -> u32 {
        self.load().in_flight
    }

    /// Apply `f` in a CAS retry loop.
    ///
    /// `f` may run several times and must be pure. Returning `None` abandons
    /// the transition; the value it saw is returned as the error.
    pub fn transition<F>(&self, mut f: F) -> Result<(StateWord, StateWord), StateWord>
    where
        F: FnMut(StateWord) -> Option<StateWord>,
    {
        let mut current = self.word.load(Ordering::Acquire);
        loop {
            let old = StateWord::unpack(current);
            let Some(new) = f(old) else {
                return Err(old);
            };
            match self.word.compare_exchange_weak(
                current,
                new.pack(),
                Ordering::AcqRel,
                Ordering::Acquire,
            ) {
                Ok(_) => return Ok((old, new)),
                Err(actual) => current = actual,
            }
        }
    }

    /// STOPPED -> IDLE
    pub fn start(&self) -> bool {
        self.transition(|w| (w.state == LifecycleState::Stopped).then(|| w.with_state(LifecycleState::Idle)))
            .is_ok()
    }

    /// IDLE -> RUNNING
    pub fn begin_running(&self) -> bool {
        self.transition(|w| (w.state == LifecycleState::Idle).then(|| w.with_state(LifecycleState::Running)))
            .is_ok()
    }

    /// Count one more submitted buffer; only IDLE and RUNNING accept submissions
    pub fn begin_flight(&self) -> bool {
        self.transition(|w| {
            matches!(w.state, LifecycleState::Idle | LifecycleState::Running).then(|| StateWord {
                in_flight: w.in_flight.saturating_add(1),
                ..w
            })
        })
        .is_ok()
    }

    /// Count one finished buffer. RUNNING drops to IDLE when nothing is left in flight.
    pub fn end_flight(&self) -> (StateWord, StateWord) {
        let result = self.transition(|w| {
            let in_flight = w.in_flight.saturating_sub(1);
            let state = if in_flight == 0 && w.state == LifecycleState::Running {
                LifecycleState::Idle
            } else {
                w.state
            };
            Some(StateWord { state, in_flight })
        });
        match result {
            Ok(pair) => pair,
            Err(word) => (word, word),
        }
    }

    /// STOPPED/IDLE/RUNNING -> SLEEP
    pub fn sleep(&self) -> bool {
        self.transition(|w| {
            matches!(
                w.state,
                LifecycleState::Stopped | LifecycleState::Idle | LifecycleState::Running
            )
            .then(|| w.with_state(LifecycleState::Sleep))
        })
        .is_ok()
    }

    /// SLEEP -> IDLE
    pub fn wake(&self) -> bool {
        self.transition(|w| (w.state == LifecycleState::Sleep).then(|| w.with_state(LifecycleState::Idle)))
            .is_ok()
    }

    /// Any non-terminal state -> KILLED. Exactly one caller ever gets `true`.
    pub fn kill(&self) -> bool {
        self.terminate().is_some()
    }

    /// Like [`PipeState::kill`], but hands the winner the state it left
    pub fn terminate(&self) -> Option<LifecycleState> {
        self.transition(|w| (!w.state.is_terminal()).then(|| w.with_state(LifecycleState::Killed)))
            .ok()
            .map(|(old, _)| old.state)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    #[test]
    fn test_pack_roundtrip_keeps_fields_apart() {
        let word = StateWord {
            state: LifecycleState::Sleep,
            in_flight: u32::MAX,
        };
        assert_eq!(StateWord::unpack(word.pack()), word);
    }

    #[test]
    fn test_transition_table() {
        let state = PipeState::new();
        assert_eq!(state.state(), LifecycleState::Stopped);
        assert!(!state.begin_running());
        assert!(!state.begin_flight());

        assert!(state.start());
        assert!(!state.start());
        assert!(state.begin_running());
        assert_eq!(state.state(), LifecycleState::Running);

        assert!(state.sleep());
        assert!(!state.begin_flight());
        assert!(state.wake());
        assert_eq!(state.state(), LifecycleState::Idle);

        assert!(state.kill());
        assert!(!state.kill());
        assert!(!state.start());
        assert!(!state.sleep());
        assert!(!state.wake());
        assert_eq!(state.state(), LifecycleState::Killed);
    }

    #[test]
    fn test_terminate_reports_previous_state() {
        let state = PipeState::new();
        assert_eq!(state.terminate(), Some(LifecycleState::Stopped));
        assert_eq!(state.terminate(), None);

        let state = PipeState::new();
        state.start();
        state.begin_running();
        assert_eq!(state.terminate(), Some(LifecycleState::Running));
        assert!(!state.kill());
    }

    #[test]
    fn test_running_drops_to_idle_at_zero() {
        let state = PipeState::new();
        state.start();
        state.begin_running();
        assert!(state.begin_flight());
        assert!(state.begin_flight());

        let (_, after) = state.end_flight();
        assert_eq!(after.state, LifecycleState::Running);
        assert_eq!(after.in_flight, 1);

        let (before, after) = state.end_flight();
        assert_eq!(before.state, LifecycleState::Running);
        assert_eq!(after.state, LifecycleState::Idle);
        assert_eq!(after.in_flight, 0);
    }

    #[test]
    fn test_end_flight_in_sleep_keeps_state() {
        let state = PipeState::new();
        state.start();
        state.begin_running();
        state.begin_flight();
        state.sleep();

        let (_, after) = state.end_flight();
        assert_eq!(after.state, LifecycleState::Sleep);
        assert_eq!(after.in_flight, 0);

        // Saturates instead of wrapping
        let (_, after) = state.end_flight();
        assert_eq!(after.in_flight, 0);
    }

    #[test]
    fn test_concurrent_kill_has_single_winner() {
        let state = Arc::new(PipeState::new());
        state.start();

        let handles: Vec<_> = (0..8)
            .map(|_| {
                let state = state.clone();
                std::thread::spawn(move || state.kill())
            })
            .collect();

        let winners = handles
            .into_iter()
            .map(|h| h.join().unwrap())
            .filter(|won| *won)
            .count();
        assert_eq!(winners, 1);
    }

    #[test]
    fn test_concurrent_flight_accounting() {
        let state = Arc::new(PipeState::new());
        state.start();
        state.begin_running();

        let handles: Vec<_> = (0..4)
            .map(|_| {
                let state = state.clone();
                std::thread::spawn(move || {
                    for _ in 0..1000 {
                        assert!(state.begin_flight());
                        state.end_flight();
                    }
                })
            })
            .collect();
        for handle in handles {
            handle.join().unwrap();
        }

        assert_eq!(state.in_flight(), 0);
    }
}
