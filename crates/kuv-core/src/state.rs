//! Connection half-close state machine
//!
//! Transitions are pure functions of `(state, event)` so the lifecycle can
//! be tested without a socket. The connection drives it from its loop
//! thread and closes the native handle once `Closed` is reached.

/// Lifecycle of one connection
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum ConnectionState {
    /// Both directions active
    Open = 0,

    /// No more input: peer sent FIN or the application stopped reading
    ReadHalfClosed = 1,

    /// Output drained and write side shut down
    WriteHalfClosed = 2,

    /// Both halves done, or the connection failed; terminal
    Closed = 3,
}

/// Things that happen to a connection
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionEvent {
    /// Read returned end-of-stream
    ReadEof,

    /// Read returned no bytes and no end-of-stream status
    ReadEmpty,

    /// Application completed its input reader
    InputCompleted,

    /// Application completed output and the FIN was sent
    WriteShutdown,

    /// Read error, write error, or abort
    Failed,
}

impl ConnectionState {
    /// Apply an event
    pub const fn on(self, event: ConnectionEvent) -> ConnectionState {
        use ConnectionEvent::*;
        use ConnectionState::*;

        match (self, event) {
            (state, ReadEmpty) => state,
            (_, Failed) => Closed,
            (Open, ReadEof) | (Open, InputCompleted) => ReadHalfClosed,
            (Open, WriteShutdown) => WriteHalfClosed,
            (ReadHalfClosed, WriteShutdown) => Closed,
            (WriteHalfClosed, ReadEof) | (WriteHalfClosed, InputCompleted) => Closed,
            (state, _) => state,
        }
    }

    /// Reads may still be issued
    #[inline]
    pub const fn is_read_open(&self) -> bool {
        matches!(self, ConnectionState::Open | ConnectionState::WriteHalfClosed)
    }

    /// Writes may still be issued
    #[inline]
    pub const fn is_write_open(&self) -> bool {
        matches!(self, ConnectionState::Open | ConnectionState::ReadHalfClosed)
    }

    #[inline]
    pub const fn is_closed(&self) -> bool {
        matches!(self, ConnectionState::Closed)
    }
}

impl Default for ConnectionState {
    fn default() -> Self {
        ConnectionState::Open
    }
}

#[cfg(test)]
mod tests {
    use super::ConnectionEvent::*;
    use super::ConnectionState::*;
    use super::*;

    const ALL_STATES: [ConnectionState; 4] = [Open, ReadHalfClosed, WriteHalfClosed, Closed];

    #[test]
    fn test_zero_byte_read_is_noop() {
        for state in ALL_STATES {
            assert_eq!(state.on(ReadEmpty), state);
        }
        // any number of empty reads keeps an open connection open
        let mut state = Open;
        for _ in 0..100 {
            state = state.on(ReadEmpty);
        }
        assert_eq!(state, Open);
        assert!(state.is_read_open());
    }

    #[test]
    fn test_read_then_write() {
        let state = Open.on(ReadEof);
        assert_eq!(state, ReadHalfClosed);
        assert!(!state.is_read_open());
        assert!(state.is_write_open());
        assert_eq!(state.on(WriteShutdown), Closed);
    }

    #[test]
    fn test_write_then_read() {
        let state = Open.on(WriteShutdown);
        assert_eq!(state, WriteHalfClosed);
        assert!(state.is_read_open());
        assert!(!state.is_write_open());
        assert_eq!(state.on(ReadEof), Closed);
        assert_eq!(state.on(InputCompleted), Closed);
    }

    #[test]
    fn test_input_completed_closes_read_half() {
        assert_eq!(Open.on(InputCompleted), ReadHalfClosed);
    }

    #[test]
    fn test_failure_closes_from_anywhere() {
        for state in ALL_STATES {
            assert_eq!(state.on(Failed), Closed);
        }
    }

    #[test]
    fn test_repeated_half_close_is_idempotent() {
        assert_eq!(Open.on(ReadEof).on(ReadEof), ReadHalfClosed);
        assert_eq!(Open.on(ReadEof).on(InputCompleted), ReadHalfClosed);
        assert_eq!(Open.on(WriteShutdown).on(WriteShutdown), WriteHalfClosed);
    }

    #[test]
    fn test_closed_is_terminal() {
        for event in [ReadEof, ReadEmpty, InputCompleted, WriteShutdown, Failed] {
            assert_eq!(Closed.on(event), Closed);
        }
        assert!(Closed.is_closed());
        assert!(!Closed.is_read_open());
        assert!(!Closed.is_write_open());
    }
}
