//! Peer connection state machine
//!
//! ```text
//! outbound: New → OfferCreated → IceGathering → IceComplete → OfferSent
//!               → RemoteDescriptionSet → Connected
//! inbound:  New → RemoteDescriptionSet → IceGathering → IceComplete
//!               → AnswerSent → Connected
//! ```
//!
//! `Disconnected` is terminal and reachable from every other state.

use std::fmt;

/// Negotiation progress of one peer
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ConnectionState {
    New,
    OfferCreated,
    IceGathering,
    IceComplete,
    OfferSent,
    AnswerSent,
    RemoteDescriptionSet,
    Connected,
    Disconnected,
}

/// Which side started the connection
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    /// We created the offer
    Outbound,
    /// The remote side sent us an offer
    Inbound,
}

impl ConnectionState {
    pub fn is_terminal(self) -> bool {
        self == ConnectionState::Disconnected
    }

    /// Whether `self → to` is a legal step for a connection started in
    /// `direction`
    pub fn can_transition(self, to: ConnectionState, direction: Direction) -> bool {
        use ConnectionState::*;
        use Direction::*;

        if to == Disconnected {
            return !self.is_terminal();
        }
        matches!(
            (direction, self, to),
            (Outbound, New, OfferCreated)
                | (Outbound, OfferCreated, IceGathering)
                | (Outbound, IceGathering, IceComplete)
                | (Outbound, IceComplete, OfferSent)
                | (Outbound, OfferSent, RemoteDescriptionSet)
                | (Outbound, RemoteDescriptionSet, Connected)
                | (Inbound, New, RemoteDescriptionSet)
                | (Inbound, RemoteDescriptionSet, IceGathering)
                | (Inbound, IceGathering, IceComplete)
                | (Inbound, IceComplete, AnswerSent)
                | (Inbound, AnswerSent, Connected)
        )
    }

    /// True once the next legal step is `Connected`
    pub fn awaits_transport(self, direction: Direction) -> bool {
        self.can_transition(ConnectionState::Connected, direction)
    }
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(self, f)
    }
}

#[cfg(test)]
mod tests {
    use super::ConnectionState::*;
    use super::*;

    fn walk(direction: Direction, path: &[ConnectionState]) -> bool {
        path.windows(2)
            .all(|step| step[0].can_transition(step[1], direction))
    }

    #[test]
    fn test_outbound_path() {
        assert!(walk(
            Direction::Outbound,
            &[
                New,
                OfferCreated,
                IceGathering,
                IceComplete,
                OfferSent,
                RemoteDescriptionSet,
                Connected
            ]
        ));
        assert!(RemoteDescriptionSet.awaits_transport(Direction::Outbound));
        assert!(!OfferSent.awaits_transport(Direction::Outbound));
    }

    #[test]
    fn test_inbound_path() {
        assert!(walk(
            Direction::Inbound,
            &[
                New,
                RemoteDescriptionSet,
                IceGathering,
                IceComplete,
                AnswerSent,
                Connected
            ]
        ));
        assert!(AnswerSent.awaits_transport(Direction::Inbound));
    }

    #[test]
    fn test_illegal_transitions() {
        assert!(!New.can_transition(Connected, Direction::Outbound));
        assert!(!New.can_transition(OfferCreated, Direction::Inbound));
        assert!(!RemoteDescriptionSet.can_transition(IceGathering, Direction::Outbound));
        assert!(!IceComplete.can_transition(AnswerSent, Direction::Outbound));
        assert!(!Connected.can_transition(New, Direction::Inbound));
    }

    #[test]
    fn test_disconnect_from_anywhere() {
        for state in [New, OfferCreated, IceGathering, OfferSent, AnswerSent, Connected] {
            assert!(state.can_transition(Disconnected, Direction::Outbound));
            assert!(state.can_transition(Disconnected, Direction::Inbound));
        }
        assert!(!Disconnected.can_transition(Disconnected, Direction::Inbound));
        assert!(!Disconnected.can_transition(New, Direction::Outbound));
    }
}
