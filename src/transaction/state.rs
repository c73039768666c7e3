//! Transaction state machine.

use crate::error::{Error, Result};

/// The possible states of a transaction.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum State {
    /// No connection is bound yet; work is queued.
    Disconnected,
    /// A connection is bound but the transaction is not accepting direct
    /// queries: the begin statement is in flight, the queue is draining, or a
    /// child transaction holds the connection.
    Connected,
    /// Queries go straight to the connection.
    Open,
    /// Committed or rolled back. Terminal.
    Closed,
}

impl State {
    /// Returns true if the transition table allows `self -> next`.
    pub fn can_transition_to(self, next: State) -> bool {
        use State::*;
        matches!(
            (self, next),
            (Disconnected, Connected)
                | (Connected, Open)
                | (Connected, Closed)
                | (Open, Connected)
                | (Open, Closed)
        )
    }

    pub fn is_closed(self) -> bool {
        matches!(self, Self::Closed)
    }

    /// Returns true while queries must wait in the queue.
    pub fn is_pending(self) -> bool {
        matches!(self, Self::Disconnected | Self::Connected)
    }
}

impl std::fmt::Display for State {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Disconnected => write!(f, "disconnected"),
            Self::Connected => write!(f, "connected"),
            Self::Open => write!(f, "open"),
            Self::Closed => write!(f, "closed"),
        }
    }
}

/// Current state plus the transition check.
#[derive(Debug)]
pub struct StateMachine {
    state: State,
}

impl StateMachine {
    pub fn new() -> Self {
        Self {
            state: State::Disconnected,
        }
    }

    pub fn state(&self) -> State {
        self.state
    }

    /// Moves to `next`, returning the previous state.
    pub fn transition(&mut self, next: State) -> Result<State> {
        let from = self.state;
        if !from.can_transition_to(next) {
            return Err(Error::InvalidTransition { from, to: next });
        }
        self.state = next;
        Ok(from)
    }
}

impl Default for StateMachine {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_transition_table() {
        use State::*;
        let all = [Disconnected, Connected, Open, Closed];
        let allowed = [
            (Disconnected, Connected),
            (Connected, Open),
            (Connected, Closed),
            (Open, Connected),
            (Open, Closed),
        ];

        for from in all {
            for to in all {
                assert_eq!(
                    from.can_transition_to(to),
                    allowed.contains(&(from, to)),
                    "{} -> {}",
                    from,
                    to
                );
            }
        }
    }

    #[test]
    fn test_lifecycle() {
        let mut machine = StateMachine::new();
        assert_eq!(machine.state(), State::Disconnected);

        assert_eq!(machine.transition(State::Connected).unwrap(), State::Disconnected);
        assert_eq!(machine.transition(State::Open).unwrap(), State::Connected);
        assert_eq!(machine.transition(State::Connected).unwrap(), State::Open);
        assert_eq!(machine.transition(State::Closed).unwrap(), State::Connected);
        assert!(machine.state().is_closed());
    }

    #[test]
    fn test_closed_is_terminal() {
        let mut machine = StateMachine::new();
        machine.transition(State::Connected).unwrap();
        machine.transition(State::Closed).unwrap();

        let err = machine.transition(State::Closed).unwrap_err();
        assert!(matches!(
            err,
            Error::InvalidTransition {
                from: State::Closed,
                to: State::Closed
            }
        ));
        assert!(machine.transition(State::Open).is_err());
        assert_eq!(machine.state(), State::Closed);
    }

    #[test]
    fn test_cannot_skip_connecting() {
        let mut machine = StateMachine::new();
        assert!(machine.transition(State::Open).is_err());
        assert!(machine.transition(State::Closed).is_err());
        assert_eq!(machine.state(), State::Disconnected);
    }

    #[test]
    fn test_state_display() {
        assert_eq!(State::Closed.to_string(), "closed");
        assert_eq!(State::Disconnected.to_string(), "disconnected");
    }
}
