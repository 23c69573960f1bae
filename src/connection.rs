use std::sync::atomic::{AtomicU8, AtomicU32, Ordering};

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[repr(u8)]
pub enum ConnectionState {
    NotConnected = 0,
    Connecting = 1,
    Connected = 2,
    Failed = 3,
}

impl ConnectionState {
    fn from_u8(value: u8) -> Self {
        match value {
            1 => ConnectionState::Connecting,
            2 => ConnectionState::Connected,
            3 => ConnectionState::Failed,
            _ => ConnectionState::NotConnected,
        }
    }
}

/// Session-wide connection state.
///
/// `NotConnected -> Connecting -> Connected | Failed`. Entering `Connecting` is a
/// single compare-and-set, so concurrent scan events can never start two
/// attempts. `Failed` re-arms into `Connecting` only while attempts remain;
/// `Connected` is terminal.
#[derive(Debug)]
pub struct ConnectionGuard {
    state: AtomicU8,
    attempts: AtomicU32,
    max_attempts: u32,
}

impl ConnectionGuard {
    pub fn new(max_attempts: u32) -> Self {
        ConnectionGuard {
            state: AtomicU8::new(ConnectionState::NotConnected as u8),
            attempts: AtomicU32::new(0),
            max_attempts: max_attempts.max(1),
        }
    }

    pub fn state(&self) -> ConnectionState {
        ConnectionState::from_u8(self.state.load(Ordering::Acquire))
    }

    pub fn attempts(&self) -> u32 {
        self.attempts.load(Ordering::Acquire)
    }

    pub fn max_attempts(&self) -> u32 {
        self.max_attempts
    }

    /// Claim the right to issue a connect. Returns the 1-based attempt number
    /// when the caller won the transition into `Connecting`.
    pub fn try_begin(&self) -> Option<u32> {
        let from = match self.state() {
            ConnectionState::NotConnected => ConnectionState::NotConnected,
            ConnectionState::Failed if self.attempts() < self.max_attempts => {
                ConnectionState::Failed
            }
            _ => return None,
        };

        self.state
            .compare_exchange(
                from as u8,
                ConnectionState::Connecting as u8,
                Ordering::AcqRel,
                Ordering::Acquire,
            )
            .ok()?;

        Some(self.attempts.fetch_add(1, Ordering::AcqRel) + 1)
    }

    /// Record the outcome of the attempt currently in `Connecting`.
    pub fn finish(&self, connected: bool) -> ConnectionState {
        let to = if connected {
            ConnectionState::Connected
        } else {
            ConnectionState::Failed
        };
        match self.state.compare_exchange(
            ConnectionState::Connecting as u8,
            to as u8,
            Ordering::AcqRel,
            Ordering::Acquire,
        ) {
            Ok(_) => to,
            Err(current) => ConnectionState::from_u8(current),
        }
    }
}
