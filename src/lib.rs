//! Core runtime for a stream-oriented RPC client and server.
//!
//! The crate provides the pieces a gRPC-style library composes into its
//! client and server paths, without committing to a wire format:
//!
//! - [`broadcast`]: a single-producer, multi-subscriber bounded sequence,
//!   the primitive that lets retries and hedging replay one request
//!   stream to several attempts.
//! - [`throttle`]: the token bucket deciding whether retry and hedge
//!   attempts are admitted.
//! - [`subchannel`]: the per-endpoint connection lifecycle (connect,
//!   backoff, ready, going-away, shutdown).
//! - [`balancer`]: the pick-first and round-robin policies over a set of
//!   subchannels.
//! - [`interceptor`] and [`handler`]: the pure state machines validating
//!   part ordering and driving an accepted RPC on the server.
//!
//! Wire transports plug in underneath through the [`transport`] traits;
//! name resolution, message serialization and the outer client/server
//! facades sit on top.

pub mod backoff;
pub mod balancer;
pub mod broadcast;
pub mod connectivity;
pub mod endpoint;
pub mod error;
pub mod handler;
pub mod interceptor;
pub mod metadata;
pub mod parts;
pub mod status;
pub mod subchannel;
pub mod throttle;
pub mod transport;

pub use backoff::Backoff;
pub use balancer::{LbEvent, PickFirstBalancer, RoundRobinBalancer};
pub use broadcast::{BroadcastSource, BroadcastStream, Subscription};
pub use connectivity::ConnectivityState;
pub use endpoint::{Endpoint, EndpointKey};
pub use error::Error;
pub use handler::{HandlerAction, HandlerInput, HandlerState, HandlerStateMachine};
pub use interceptor::{CancelAction, InterceptorAction, InterceptorStateMachine};
pub use metadata::Metadata;
pub use parts::{RequestPart, ResponsePart};
pub use status::{Status, StatusCode};
pub use subchannel::{Subchannel, SubchannelEvent, SubchannelHandle};
pub use throttle::RetryThrottle;
pub use transport::{
    CloseReason, Connection, ConnectionEvent, Connector, MethodDescriptor, StreamOptions,
};

/// The crate-wide result type.
pub type Result<T> = std::result::Result<T, Error>;
