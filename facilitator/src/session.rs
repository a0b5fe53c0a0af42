use std::fmt;

use comms::msg::Rank;

use crate::error::Violation;

/// Training → Validating → Training ... → Finished
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
    Training,
    Validating,
    Finished,
}

impl Phase {
    /// Whether the protocol allows moving from `self` to `to`.
    pub fn can_transition_to(self, to: Phase) -> bool {
        matches!(
            (self, to),
            (Phase::Training, Phase::Validating)
                | (Phase::Validating, Phase::Training)
                | (Phase::Training | Phase::Validating, Phase::Finished)
        )
    }
}

impl fmt::Display for Phase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Training => write!(f, "Training"),
            Self::Validating => write!(f, "Validating"),
            Self::Finished => write!(f, "Finished"),
        }
    }
}

/// The facilitator's view of the in-flight client interaction.
///
/// Only one client is bound at a time, a forward pass from another client
/// replaces it and the gradients of the replaced client are then routed to the
/// new one.
#[derive(Debug)]
pub struct Session {
    bound_client: Option<Rank>,
    phase: Phase,
}

impl Session {
    pub fn new() -> Self {
        Self {
            bound_client: None,
            phase: Phase::Training,
        }
    }

    pub fn phase(&self) -> Phase {
        self.phase
    }

    pub fn bound_client(&self) -> Option<Rank> {
        self.bound_client
    }

    /// Checks the session is in the `expected` phase.
    pub fn require(&self, expected: Phase) -> Result<(), Violation> {
        if self.phase != expected {
            return Err(Violation::WrongPhase { expected });
        }

        Ok(())
    }

    /// Binds the session to `client`, returning the previously bound client.
    pub fn bind(&mut self, client: Rank) -> Option<Rank> {
        self.bound_client.replace(client)
    }

    /// Moves the session into the phase `to`.
    ///
    /// Any bound client is released, gradients are only attributed to forward passes
    /// of the current phase.
    pub fn transition(&mut self, to: Phase) -> Result<(), Violation> {
        if !self.phase.can_transition_to(to) {
            return Err(match self.phase {
                Phase::Finished => Violation::Finished,
                _ => Violation::WrongPhase {
                    expected: if to == Phase::Training {
                        Phase::Validating
                    } else {
                        Phase::Training
                    },
                },
            });
        }

        self.phase = to;
        self.bound_client = None;
        Ok(())
    }
}

impl Default for Session {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn starts_training_and_unbound() {
        let session = Session::new();
        assert_eq!(session.phase(), Phase::Training);
        assert_eq!(session.bound_client(), None);
    }

    #[test]
    fn bind_overwrites_previous_client() {
        let mut session = Session::new();
        assert_eq!(session.bind(2), None);
        assert_eq!(session.bind(3), Some(2));
        assert_eq!(session.bound_client(), Some(3));
    }

    #[test]
    fn transitions_release_the_bound_client() {
        let mut session = Session::new();
        session.bind(2);

        session.transition(Phase::Validating).unwrap();
        assert_eq!(session.bound_client(), None);

        session.transition(Phase::Training).unwrap();
        assert_eq!(session.phase(), Phase::Training);
    }

    #[test]
    fn rejects_illegal_transitions() {
        let mut session = Session::new();

        assert_eq!(
            session.transition(Phase::Training),
            Err(Violation::WrongPhase {
                expected: Phase::Validating
            })
        );

        session.transition(Phase::Finished).unwrap();

        for to in [Phase::Training, Phase::Validating, Phase::Finished] {
            assert_eq!(session.transition(to), Err(Violation::Finished));
        }
    }

    #[test]
    fn finished_is_reachable_from_validating() {
        let mut session = Session::new();
        session.transition(Phase::Validating).unwrap();
        session.transition(Phase::Finished).unwrap();
        assert_eq!(session.phase(), Phase::Finished);
    }
}
