//! Connection state machine shared by both engines.
//!
//! A connection starts in `Initial`, alternates between `ReadPending` and
//! `WritePending` while its peer is connected, and passes through
//! `DisconnectPending` on its way back to `Initial`, where it can be reused.

/// Current state of a connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum ConnState {
    /// Not bound to a peer. Safe to hand out from the pool.
    #[default]
    Initial,
    /// A read has been posted (completion) or the connection is waiting for
    /// readable data (readiness).
    ReadPending,
    /// A write is in flight or has bytes left to flush.
    WritePending,
    /// An asynchronous disconnect is in flight.
    DisconnectPending,
}

/// What to do with a completion, decided from the state it arrived in.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Step {
    /// Bytes moved. Run the owner callback registered for this state.
    Dispatch(ConnState),
    /// The peer closed its side. Start the disconnect.
    BeginDisconnect,
    /// The disconnect finished. Reset and hand the connection back.
    Recycle,
    /// Nothing was pending.
    Stray,
}

impl ConnState {
    pub fn is_initial(self) -> bool {
        self == ConnState::Initial
    }

    /// True while a peer is attached and data can flow.
    pub fn is_exchanging(self) -> bool {
        matches!(self, ConnState::ReadPending | ConnState::WritePending)
    }

    /// Decide the next step for a completion carrying `transferred` bytes.
    ///
    /// A zero-byte read or write means the peer is gone, except while a
    /// disconnect is pending, where any completion finishes the cycle.
    pub fn on_completion(self, transferred: usize) -> Step {
        match (self, transferred) {
            (ConnState::DisconnectPending, _) => Step::Recycle,
            (ConnState::Initial, _) => Step::Stray,
            (_, 0) => Step::BeginDisconnect,
            (state, _) => Step::Dispatch(state),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_is_initial() {
        assert_eq!(ConnState::default(), ConnState::Initial);
        assert!(ConnState::default().is_initial());
    }

    #[test]
    fn test_data_completions_dispatch() {
        assert_eq!(
            ConnState::ReadPending.on_completion(5),
            Step::Dispatch(ConnState::ReadPending)
        );
        assert_eq!(
            ConnState::WritePending.on_completion(1),
            Step::Dispatch(ConnState::WritePending)
        );
    }

    #[test]
    fn test_zero_bytes_begins_disconnect() {
        assert_eq!(ConnState::ReadPending.on_completion(0), Step::BeginDisconnect);
        assert_eq!(ConnState::WritePending.on_completion(0), Step::BeginDisconnect);
    }

    #[test]
    fn test_disconnect_always_recycles() {
        // Transferred count is irrelevant once a disconnect is pending
        assert_eq!(ConnState::DisconnectPending.on_completion(0), Step::Recycle);
        assert_eq!(ConnState::DisconnectPending.on_completion(42), Step::Recycle);
    }

    #[test]
    fn test_initial_is_stray() {
        assert_eq!(ConnState::Initial.on_completion(0), Step::Stray);
        assert_eq!(ConnState::Initial.on_completion(3), Step::Stray);
    }

    #[test]
    fn test_exchanging_states() {
        assert!(ConnState::ReadPending.is_exchanging());
        assert!(ConnState::WritePending.is_exchanging());
        assert!(!ConnState::Initial.is_exchanging());
        assert!(!ConnState::DisconnectPending.is_exchanging());
    }
}
