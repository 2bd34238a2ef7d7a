//! Recorder state machine
//!
//! The legality rules live in one pure function (`State::on`) so they can be tested without any
//! threads. `StateCell` applies them atomically; it is the only state shared between the caller
//! and the worker threads.
//!
//! ```text
//! Idle      --Prepare-->  Preparing --Prepared--> Ready
//! Preparing/Ready/Recording/Stopping --Fail--> Error
//! Ready     --Start-->    Recording
//! Recording/Ready --Stop--> Stopping --Stopped--> Ready
//! any       --Release-->  Idle
//! ```

use std::fmt;
use std::sync::atomic::{AtomicU8, Ordering};

#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum State {
    Idle = 0,
    Preparing = 1,
    Ready = 2,
    Recording = 3,
    Stopping = 4,
    Error = 5,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Event {
    Prepare,
    Prepared,
    Fail,
    Start,
    Stop,
    Stopped,
    Release,
}

/// An event that is not legal from `from`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TransitionError {
    pub from: State,
    pub event: Event,
}

impl fmt::Display for TransitionError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:?} is not legal from {}", self.event, self.from)
    }
}

impl std::error::Error for TransitionError {}

impl fmt::Display for State {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            State::Idle => "IDLE",
            State::Preparing => "PREPARING",
            State::Ready => "READY",
            State::Recording => "RECORDING",
            State::Stopping => "STOPPING",
            State::Error => "ERROR",
        };
        f.write_str(s)
    }
}

impl State {
    fn from_u8(v: u8) -> State {
        match v {
            0 => State::Idle,
            1 => State::Preparing,
            2 => State::Ready,
            3 => State::Recording,
            4 => State::Stopping,
            _ => State::Error,
        }
    }

    /// Next state for `event`, or an error if the event is illegal here.
    pub fn on(self, event: Event) -> Result<State, TransitionError> {
        use Event as E;
        use State as S;
        let next = match (self, event) {
            (_, E::Release) => S::Idle,
            (S::Idle, E::Prepare) => S::Preparing,
            (S::Preparing, E::Prepared) => S::Ready,
            (S::Preparing | S::Ready | S::Recording | S::Stopping, E::Fail) => S::Error,
            (S::Ready, E::Start) => S::Recording,
            (S::Recording | S::Ready, E::Stop) => S::Stopping,
            (S::Stopping, E::Stopped) => S::Ready,
            (from, event) => return Err(TransitionError { from, event }),
        };
        Ok(next)
    }
}

/// Atomic holder for the current `State`.
#[derive(Debug)]
pub struct StateCell(AtomicU8);

impl Default for StateCell {
    fn default() -> Self {
        Self::new()
    }
}

impl StateCell {
    pub fn new() -> Self {
        Self(AtomicU8::new(State::Idle as u8))
    }

    pub fn get(&self) -> State {
        State::from_u8(self.0.load(Ordering::Acquire))
    }

    /// Apply `event`; returns `(previous, next)`. A rejected event leaves the cell untouched.
    pub fn transition(&self, event: Event) -> Result<(State, State), TransitionError> {
        let mut cur = self.0.load(Ordering::Acquire);
        loop {
            let from = State::from_u8(cur);
            let next = from.on(event)?;
            match self
                .0
                .compare_exchange(cur, next as u8, Ordering::AcqRel, Ordering::Acquire)
            {
                Ok(_) => return Ok((from, next)),
                Err(actual) => cur = actual,
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const ALL_STATES: [State; 6] = [
        State::Idle,
        State::Preparing,
        State::Ready,
        State::Recording,
        State::Stopping,
        State::Error,
    ];

    #[test]
    fn happy_path() {
        let cell = StateCell::new();
        for (ev, want) in [
            (Event::Prepare, State::Preparing),
            (Event::Prepared, State::Ready),
            (Event::Start, State::Recording),
            (Event::Stop, State::Stopping),
            (Event::Stopped, State::Ready),
            (Event::Start, State::Recording),
            (Event::Release, State::Idle),
        ] {
            let (_, next) = cell.transition(ev).unwrap();
            assert_eq!(next, want);
        }
    }

    #[test]
    fn start_only_from_ready() {
        for s in ALL_STATES {
            assert_eq!(s.on(Event::Start).is_ok(), s == State::Ready, "{s}");
        }
    }

    #[test]
    fn stop_only_from_recording_or_ready() {
        for s in ALL_STATES {
            let ok = matches!(s, State::Recording | State::Ready);
            assert_eq!(s.on(Event::Stop).is_ok(), ok, "{s}");
        }
    }

    #[test]
    fn error_rejects_everything_but_release() {
        let cell = StateCell::new();
        cell.transition(Event::Prepare).unwrap();
        cell.transition(Event::Fail).unwrap();
        for ev in [
            Event::Prepare,
            Event::Prepared,
            Event::Fail,
            Event::Start,
            Event::Stop,
            Event::Stopped,
        ] {
            let err = cell.transition(ev).unwrap_err();
            assert_eq!(err.from, State::Error);
            assert_eq!(cell.get(), State::Error);
        }
        assert_eq!(cell.transition(Event::Release).unwrap().1, State::Idle);
    }

    #[test]
    fn release_is_idempotent() {
        let cell = StateCell::new();
        assert_eq!(cell.transition(Event::Release).unwrap(), (State::Idle, State::Idle));
        assert_eq!(cell.transition(Event::Release).unwrap(), (State::Idle, State::Idle));
    }

    #[test]
    fn prepare_only_from_idle() {
        for s in ALL_STATES {
            assert_eq!(s.on(Event::Prepare).is_ok(), s == State::Idle, "{s}");
        }
    }
}
