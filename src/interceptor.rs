//! Ordering validation for parts flowing through the server-side
//! interceptor pipeline.
//!
//! Every part of an accepted RPC passes this machine twice: once entering
//! the pipeline (from the network for requests, from the handler for
//! responses) and once leaving it. The machine checks that each direction
//! keeps the `metadata, message*, end` shape and tells the driver what to
//! do with the part. It performs no I/O and holds no references, so every
//! transition is testable with plain assertions.

use crate::parts::{RequestPart, ResponsePart};

/// What the driver should do with one part.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InterceptorAction {
    /// Hand the part to the interceptor pipeline.
    Intercept,
    /// Pass the part out of the pipeline to its destination.
    Forward,
    /// The part is out of order: tear the RPC down.
    Cancel,
    /// The RPC is already finished: discard the part, do no work.
    Drop,
}

/// How to tear the pipeline down on cancellation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CancelAction {
    /// A terminal status can still reach the peer: try to send one, then
    /// release the pipeline.
    SendStatusThenNilOutInterceptorPipeline,
    /// Too late for a status: just release the pipeline.
    NilOutInterceptorPipeline,
}

/// Progress of one direction of one side of the RPC.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum StreamState {
    /// Nothing seen yet; metadata is the only acceptable part.
    Idle,
    /// Metadata went through; messages and the end may follow.
    Transferring,
    /// The end went through; nothing more is acceptable.
    Done,
}

impl StreamState {
    fn metadata(&mut self) -> bool {
        match self {
            StreamState::Idle => {
                *self = StreamState::Transferring;
                true
            }
            _ => false,
        }
    }

    fn message(&mut self) -> bool {
        *self == StreamState::Transferring
    }

    fn end(&mut self) -> bool {
        match self {
            StreamState::Idle | StreamState::Transferring => {
                *self = StreamState::Done;
                true
            }
            StreamState::Done => false,
        }
    }

    fn handle_request(&mut self, part: &RequestPart) -> bool {
        match part {
            RequestPart::Metadata(_) => self.metadata(),
            RequestPart::Message(_) => self.message(),
            RequestPart::End => self.end(),
        }
    }

    fn handle_response(&mut self, part: &ResponsePart) -> bool {
        match part {
            ResponsePart::Metadata(_) => self.metadata(),
            ResponsePart::Message(_) => self.message(),
            ResponsePart::Status(_) => self.end(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum State {
    Intercepting {
        /// Request parts entering the pipeline from the network.
        request_in: StreamState,
        /// Request parts leaving the pipeline towards the handler.
        request_out: StreamState,
        /// Response parts entering the pipeline from the handler.
        response_in: StreamState,
        /// Response parts leaving the pipeline towards the network.
        response_out: StreamState,
    },
    Finished,
}

/// Validates the ordering of every part crossing the interceptor
/// pipeline of one accepted RPC.
#[derive(Debug)]
pub struct InterceptorStateMachine {
    state: State,
}

impl Default for InterceptorStateMachine {
    fn default() -> Self {
        Self::new()
    }
}

impl InterceptorStateMachine {
    pub fn new() -> Self {
        Self {
            state: State::Intercepting {
                request_in: StreamState::Idle,
                request_out: StreamState::Idle,
                response_in: StreamState::Idle,
                response_out: StreamState::Idle,
            },
        }
    }

    /// A request part arrived from the network, about to enter the
    /// pipeline.
    pub fn receive_request_part(&mut self, part: &RequestPart) -> InterceptorAction {
        match &mut self.state {
            State::Intercepting { request_in, .. } => {
                if request_in.handle_request(part) {
                    InterceptorAction::Intercept
                } else {
                    InterceptorAction::Cancel
                }
            }
            State::Finished => InterceptorAction::Drop,
        }
    }

    /// A request part came out of the pipeline, headed for the handler.
    pub fn intercepted_request_part(&mut self, part: &RequestPart) -> InterceptorAction {
        match &mut self.state {
            State::Intercepting { request_out, .. } => {
                if request_out.handle_request(part) {
                    InterceptorAction::Forward
                } else {
                    InterceptorAction::Cancel
                }
            }
            State::Finished => InterceptorAction::Drop,
        }
    }

    /// A response part arrived from the handler, about to enter the
    /// pipeline.
    pub fn send_response_part(&mut self, part: &ResponsePart) -> InterceptorAction {
        match &mut self.state {
            State::Intercepting { response_in, .. } => {
                if response_in.handle_response(part) {
                    InterceptorAction::Intercept
                } else {
                    InterceptorAction::Cancel
                }
            }
            State::Finished => InterceptorAction::Drop,
        }
    }

    /// A response part came out of the pipeline, headed for the network.
    pub fn intercepted_response_part(&mut self, part: &ResponsePart) -> InterceptorAction {
        match &mut self.state {
            State::Intercepting { response_out, .. } => {
                if response_out.handle_response(part) {
                    InterceptorAction::Forward
                } else {
                    InterceptorAction::Cancel
                }
            }
            State::Finished => InterceptorAction::Drop,
        }
    }

    /// Tears the RPC down. Terminal: after this, every part is dropped.
    pub fn cancel(&mut self) -> CancelAction {
        match self.state {
            State::Intercepting { response_out, .. } => {
                self.state = State::Finished;
                if matches!(
                    response_out,
                    StreamState::Idle | StreamState::Transferring
                ) {
                    // The network side has not seen a terminal part yet; a
                    // best-effort status may still get through.
                    CancelAction::SendStatusThenNilOutInterceptorPipeline
                } else {
                    CancelAction::NilOutInterceptorPipeline
                }
            }
            State::Finished => CancelAction::NilOutInterceptorPipeline,
        }
    }
}
