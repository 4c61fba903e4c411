//! The pure state machine driving a subchannel.
//!
//! [`Machine::handle`] performs the transition for one input and returns
//! the effects the driver must perform. No I/O happens here, which keeps
//! every transition testable with plain assertions.

use super::SubchannelEvent;
use crate::connectivity::ConnectivityState;
use crate::transport::CloseReason;

/// Lifecycle states of a subchannel.
///
/// The happy path loops `NotConnected → Connecting → Connected` (and back
/// on benign closure). `GoingAway` covers the window between a peer's
/// GOAWAY and the actual closure. `ShuttingDown` waits out in-flight work
/// after a shutdown request; `Shutdown` is terminal.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum State {
    NotConnected,
    Connecting,
    Connected,
    GoingAway,
    ShuttingDown,
    Shutdown,
}

/// Everything that can happen to a subchannel.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Input {
    /// The owner wants a connection.
    Connect,
    /// The backoff timer fired.
    BackedOff,
    /// The owner is discarding this subchannel.
    Shutdown,
    /// The in-flight connection attempt completed.
    ConnectSucceeded,
    /// The in-flight connection attempt failed.
    ConnectFailed,
    /// The peer announced it will stop serving new streams.
    GoingAway,
    /// The connection is gone.
    Closed(CloseReason),
}

/// Side effects the driver performs after a transition.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Effect {
    /// Publish an event to the subchannel's consumer.
    Emit(SubchannelEvent),
    /// Attempt a connection to the address at this index of the endpoint.
    Connect(usize),
    /// Sample the next backoff delay and schedule a `BackedOff` input.
    ScheduleBackoff,
    /// A connection was established; restart the backoff schedule.
    ResetBackoff,
    /// Ask the current connection to close.
    CloseConnection,
    /// Terminal: close the input and event streams.
    Finish,
}

#[derive(Debug)]
pub(crate) struct Machine {
    state: State,
    /// Number of addresses in the endpoint; attempts walk them in order.
    address_count: usize,
    /// Index of the address the current attempt is using.
    address_index: usize,
    /// Set while waiting for the backoff timer; there is no attempt in
    /// flight in that window.
    backing_off: bool,
}

use self::Effect::Emit;
use super::SubchannelEvent::ConnectivityStateChanged as StateChanged;

impl Machine {
    pub(crate) fn new(address_count: usize) -> Self {
        debug_assert!(address_count > 0);
        Self {
            state: State::NotConnected,
            address_count,
            address_index: 0,
            backing_off: false,
        }
    }

    pub(crate) fn state(&self) -> State {
        self.state
    }

    /// Applies one input and returns the effects to perform, in order.
    pub(crate) fn handle(&mut self, input: Input) -> Vec<Effect> {
        match input {
            Input::Connect => self.on_connect(),
            Input::BackedOff => self.on_backed_off(),
            Input::Shutdown => self.on_shutdown(),
            Input::ConnectSucceeded => self.on_connect_succeeded(),
            Input::ConnectFailed => self.on_connect_failed(),
            Input::GoingAway => self.on_going_away(),
            Input::Closed(reason) => self.on_closed(reason),
        }
    }

    fn on_connect(&mut self) -> Vec<Effect> {
        match self.state {
            State::NotConnected => {
                self.state = State::Connecting;
                self.address_index = 0;
                vec![
                    Effect::Connect(0),
                    Emit(StateChanged(ConnectivityState::Connecting)),
                ]
            }
            // Already connecting, connected or on the way out.
            _ => vec![],
        }
    }

    fn on_backed_off(&mut self) -> Vec<Effect> {
        if self.state == State::Connecting && self.backing_off {
            self.backing_off = false;
            self.address_index = 0;
            vec![
                Effect::Connect(0),
                Emit(StateChanged(ConnectivityState::Connecting)),
            ]
        } else {
            // Stale timer; shutdown may have overtaken it.
            vec![]
        }
    }

    fn on_connect_succeeded(&mut self) -> Vec<Effect> {
        match self.state {
            State::Connecting if !self.backing_off => {
                self.state = State::Connected;
                vec![
                    Effect::ResetBackoff,
                    Emit(StateChanged(ConnectivityState::Ready)),
                ]
            }
            State::ShuttingDown => {
                // The attempt we were waiting out has landed; close it and
                // finish.
                self.state = State::Shutdown;
                vec![
                    Effect::CloseConnection,
                    Emit(StateChanged(ConnectivityState::Shutdown)),
                    Effect::Finish,
                ]
            }
            _ => vec![],
        }
    }

    fn on_connect_failed(&mut self) -> Vec<Effect> {
        match self.state {
            State::Connecting if !self.backing_off => {
                if self.address_index + 1 < self.address_count {
                    // Try the next address; externally this is still the
                    // same connection attempt.
                    self.address_index += 1;
                    vec![Effect::Connect(self.address_index)]
                } else {
                    self.address_index = 0;
                    self.backing_off = true;
                    vec![
                        Emit(StateChanged(ConnectivityState::TransientFailure)),
                        Effect::ScheduleBackoff,
                    ]
                }
            }
            State::ShuttingDown => {
                self.state = State::Shutdown;
                vec![
                    Emit(StateChanged(ConnectivityState::Shutdown)),
                    Effect::Finish,
                ]
            }
            _ => vec![],
        }
    }

    fn on_going_away(&mut self) -> Vec<Effect> {
        match self.state {
            State::Connected => {
                self.state = State::GoingAway;
                vec![
                    Emit(SubchannelEvent::GoingAway),
                    Emit(SubchannelEvent::RequiresNameResolution),
                ]
            }
            _ => vec![],
        }
    }

    fn on_closed(&mut self, reason: CloseReason) -> Vec<Effect> {
        match self.state {
            State::Connected => match reason {
                // A quiet closure: go idle and reconnect on demand.
                CloseReason::IdleTimeout
                | CloseReason::Remote
                | CloseReason::Error { was_idle: true } => {
                    self.state = State::NotConnected;
                    vec![Emit(StateChanged(ConnectivityState::Idle))]
                }
                // The connection died under load; the network may have
                // changed shape, so re-resolve and reconnect right away.
                CloseReason::KeepaliveTimeout | CloseReason::Error { was_idle: false } => {
                    self.state = State::Connecting;
                    self.address_index = 0;
                    vec![
                        Emit(StateChanged(ConnectivityState::TransientFailure)),
                        Emit(SubchannelEvent::RequiresNameResolution),
                        Effect::Connect(0),
                        Emit(StateChanged(ConnectivityState::Connecting)),
                    ]
                }
                CloseReason::InitiatedLocally => {
                    self.state = State::Shutdown;
                    vec![
                        Emit(StateChanged(ConnectivityState::Shutdown)),
                        Effect::Finish,
                    ]
                }
            },
            State::GoingAway => {
                self.state = State::NotConnected;
                vec![Emit(StateChanged(ConnectivityState::Idle))]
            }
            State::ShuttingDown => {
                self.state = State::Shutdown;
                vec![
                    Emit(StateChanged(ConnectivityState::Shutdown)),
                    Effect::Finish,
                ]
            }
            _ => vec![],
        }
    }

    fn on_shutdown(&mut self) -> Vec<Effect> {
        match self.state {
            State::NotConnected => {
                self.state = State::Shutdown;
                vec![
                    Emit(StateChanged(ConnectivityState::Shutdown)),
                    Effect::Finish,
                ]
            }
            State::Connecting => {
                if self.backing_off {
                    // No attempt in flight; nothing to wait for.
                    self.state = State::Shutdown;
                    vec![
                        Emit(StateChanged(ConnectivityState::Shutdown)),
                        Effect::Finish,
                    ]
                } else {
                    // Wait for the in-flight attempt to land.
                    self.state = State::ShuttingDown;
                    vec![]
                }
            }
            State::Connected | State::GoingAway => {
                self.state = State::ShuttingDown;
                vec![Effect::CloseConnection]
            }
            State::ShuttingDown | State::Shutdown => vec![],
        }
    }
}
