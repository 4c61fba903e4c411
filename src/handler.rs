//! Lifecycle of a server-side RPC handler.
//!
//! An accepted stream drives this machine with the events it observes:
//! request parts arriving, response parts being written, cancellation.
//! The machine decides whether the driver forwards the work, cancels the
//! RPC, or drops the input on the floor. Like the interceptor machine it
//! is pure: [`HandlerState::handle`] maps `(state, input)` to
//! `(next state, action)` and nothing else.

/// Events observed on an accepted stream.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HandlerInput {
    /// Request metadata arrived.
    HandleMetadata,
    /// A request message arrived.
    HandleMessage,
    /// The request stream ended.
    HandleEnd,
    /// The handler wrote a response message.
    SendMessage,
    /// The handler wrote the terminal status.
    SendStatus,
    /// The RPC was cancelled.
    Cancel,
}

/// What the driver does with the input.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HandlerAction {
    /// The input is legal here: perform it.
    Forward,
    /// The input is out of order: instruct the transport to cancel the
    /// RPC.
    Cancel,
    /// The RPC already finished: do no work.
    Drop,
    /// Cancellation in (or into) the terminal state: additionally release
    /// everything the handler holds.
    CancelAndNilOutHandlerComponents,
}

/// Lifecycle states of one accepted RPC.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HandlerState {
    /// Nothing received yet.
    Idle,
    /// Request parts are flowing; the handler may already respond.
    Handling,
    /// The request stream ended; the handler is still responding.
    Draining,
    /// Terminal.
    Finished,
}

impl HandlerState {
    /// Maps one input to the successor state and the action to perform.
    pub fn handle(self, input: HandlerInput) -> (HandlerState, HandlerAction) {
        use HandlerAction as Action;
        use HandlerInput as Input;
        use HandlerState as State;

        match (self, input) {
            // Cancellation wins everywhere and releases the handler.
            (_, Input::Cancel) => (State::Finished, Action::CancelAndNilOutHandlerComponents),

            (State::Idle, Input::HandleMetadata) => (State::Handling, Action::Forward),
            // Anything else before metadata is a protocol violation.
            (State::Idle, _) => (State::Finished, Action::Cancel),

            (State::Handling, Input::HandleMetadata) => (State::Finished, Action::Cancel),
            (State::Handling, Input::HandleMessage) => (State::Handling, Action::Forward),
            (State::Handling, Input::HandleEnd) => (State::Draining, Action::Forward),
            (State::Handling, Input::SendMessage) => (State::Handling, Action::Forward),
            (State::Handling, Input::SendStatus) => (State::Finished, Action::Forward),

            // The request stream is over; only response traffic is legal.
            (State::Draining, Input::SendMessage) => (State::Draining, Action::Forward),
            (State::Draining, Input::SendStatus) => (State::Finished, Action::Forward),
            (State::Draining, _) => (State::Finished, Action::Cancel),

            (State::Finished, _) => (State::Finished, Action::Drop),
        }
    }
}

/// Convenience wrapper owning the current state.
#[derive(Debug)]
pub struct HandlerStateMachine {
    state: HandlerState,
}

impl Default for HandlerStateMachine {
    fn default() -> Self {
        Self::new()
    }
}

impl HandlerStateMachine {
    pub fn new() -> Self {
        Self {
            state: HandlerState::Idle,
        }
    }

    pub fn state(&self) -> HandlerState {
        self.state
    }

    /// Applies one input, stores the successor state and returns the
    /// action.
    pub fn handle(&mut self, input: HandlerInput) -> HandlerAction {
        let (state, action) = self.state.handle(input);
        self.state = state;
        action
    }
}
