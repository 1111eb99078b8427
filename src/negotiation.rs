//! Per-attempt negotiation state machine.

use std::fmt;

use crate::CommsError;

/// Offer/answer progress of one peer manager.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum NegotiationState {
    /// No negotiation has started.
    #[default]
    Idle,
    /// Local offer sent, waiting for the remote answer.
    AwaitingAnswer,
    /// Remote offer applied, local answer not yet sent.
    AwaitingLocalAnswer,
    /// Descriptions exchanged in both directions.
    Connected,
    /// A local or transport failure. Only a reset leaves this state.
    Failed,
    /// Torn down.
    Closed,
}

/// Inputs of the [`NegotiationState`] machine.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum NegotiationEvent {
    /// A local offer was published.
    LocalOfferSent,
    /// A remote offer was applied.
    RemoteOfferApplied,
    /// The local answer was published.
    LocalAnswerSent,
    /// The remote answer was applied.
    RemoteAnswerApplied,
    /// The transport reported `failed`.
    TransportFailed,
    /// Teardown.
    Close,
}

impl NegotiationState {
    /// Pure transition function. Events that make no sense in the current state are
    /// rejected rather than ignored.
    pub fn apply(self, event: NegotiationEvent) -> Result<Self, CommsError> {
        use NegotiationEvent as E;
        use NegotiationState as S;

        let next = match (self, event) {
            (S::Closed, _) => None,
            (_, E::Close) => Some(S::Closed),
            (S::Failed, _) => None,
            (_, E::TransportFailed) => Some(S::Failed),
            (S::Idle, E::LocalOfferSent) => Some(S::AwaitingAnswer),
            (S::Idle, E::RemoteOfferApplied) => Some(S::AwaitingLocalAnswer),
            (S::AwaitingAnswer, E::RemoteAnswerApplied) => Some(S::Connected),
            (S::AwaitingLocalAnswer, E::LocalAnswerSent) => Some(S::Connected),
            _ => None,
        };
        next.ok_or(CommsError::InvalidTransition { from: self, event })
    }

    /// An offer or answer is outstanding.
    pub fn is_pending(self) -> bool {
        matches!(self, Self::AwaitingAnswer | Self::AwaitingLocalAnswer)
    }

    /// Failed and closed attempts never leave their state; a fresh attempt is required.
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Failed | Self::Closed)
    }
}

impl fmt::Display for NegotiationState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Idle => "idle",
            Self::AwaitingAnswer => "awaiting-answer",
            Self::AwaitingLocalAnswer => "awaiting-local-answer",
            Self::Connected => "connected",
            Self::Failed => "failed",
            Self::Closed => "closed",
        };
        f.write_str(name)
    }
}

#[cfg(test)]
mod tests {
    use super::NegotiationEvent as E;
    use super::NegotiationState as S;
    use super::*;

    #[test]
    fn offerer_path() {
        let state = S::Idle.apply(E::LocalOfferSent).unwrap();
        assert!(state.is_pending());
        assert_eq!(state.apply(E::RemoteAnswerApplied).unwrap(), S::Connected);
    }

    #[test]
    fn answerer_path() {
        let state = S::Idle.apply(E::RemoteOfferApplied).unwrap();
        assert_eq!(state, S::AwaitingLocalAnswer);
        assert_eq!(state.apply(E::LocalAnswerSent).unwrap(), S::Connected);
    }

    #[test]
    fn invalid_events_are_rejected() {
        assert!(matches!(
            S::Idle.apply(E::RemoteAnswerApplied),
            Err(CommsError::InvalidTransition {
                from: S::Idle,
                event: E::RemoteAnswerApplied
            })
        ));
        assert!(S::Connected.apply(E::RemoteAnswerApplied).is_err());
        assert!(S::AwaitingAnswer.apply(E::RemoteOfferApplied).is_err());
        assert!(S::AwaitingLocalAnswer.apply(E::LocalOfferSent).is_err());
    }

    #[test]
    fn failure_and_close_are_terminal() {
        let failed = S::Connected.apply(E::TransportFailed).unwrap();
        assert!(failed.is_terminal());
        assert!(failed.apply(E::LocalOfferSent).is_err());
        assert!(failed.apply(E::TransportFailed).is_err());
        let closed = failed.apply(E::Close).unwrap();
        assert!(closed.apply(E::Close).is_err());
    }
}
