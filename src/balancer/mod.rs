//! Client-side load balancing policies.
//!
//! A load balancer owns a set of [`Subchannel`]s, watches their events,
//! publishes an aggregated connectivity state and answers
//! `pick_subchannel` calls from the RPC executor. Two policies are
//! provided: [`PickFirstBalancer`] keeps one live subchannel at a time,
//! [`RoundRobinBalancer`] spreads picks over every ready subchannel.
//!
//! Both follow the same plumbing: each subchannel's event stream is
//! drained by a small forwarder task that tags events with the
//! subchannel's id into one merged channel, and a single pump task applies
//! them to the balancer's state under its mutex. Subchannels being
//! discarded are "parked" until they report `Shutdown`; only then are
//! their resources considered released.

pub mod pick_first;
pub mod round_robin;

pub use pick_first::PickFirstBalancer;
pub use round_robin::RoundRobinBalancer;

use crate::connectivity::ConnectivityState;
use crate::subchannel::{Subchannel, SubchannelEvent};
use crate::transport::Connector;
use tokio::sync::mpsc;
use tokio_stream::{wrappers::UnboundedReceiverStream, StreamExt};

/// Events a load balancer publishes to its owner.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LbEvent {
    /// The aggregated connectivity state changed (or, for pick-first, the
    /// serving subchannel changed while staying ready).
    ConnectivityStateChanged(ConnectivityState),
    /// A subchannel saw a signal that warrants re-resolving the name.
    RequiresNameResolution,
    /// Every parked subchannel has shut down; the event stream ends after
    /// this.
    Closed,
}

/// Lifecycle of a balancer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Lifecycle {
    Active,
    /// `close` was called; waiting for parked subchannels to shut down.
    Closing,
    Closed,
}

/// Drains one subchannel's events into the balancer's merged channel,
/// tagging them with the subchannel's id. Ends when the subchannel
/// terminates or the balancer goes away.
fn spawn_forwarder(
    id: u64,
    events: mpsc::UnboundedReceiver<SubchannelEvent>,
    merged: mpsc::UnboundedSender<(u64, SubchannelEvent)>,
) {
    let mut events = UnboundedReceiverStream::new(events);
    tokio::spawn(async move {
        while let Some(event) = events.next().await {
            if merged.send((id, event)).is_err() {
                break;
            }
        }
    });
}

/// Detaches a subchannel's event stream and starts forwarding it.
fn register_subchannel<C: Connector>(
    subchannel: &mut Subchannel<C>,
    merged: &mpsc::UnboundedSender<(u64, SubchannelEvent)>,
) {
    // A freshly constructed subchannel always still has its event stream.
    let events = subchannel
        .take_events()
        .expect("subchannel event stream already taken");
    spawn_forwarder(subchannel.id(), events, merged.clone());
}
