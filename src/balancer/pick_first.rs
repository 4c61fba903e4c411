//! The pick-first load-balancing policy.
//!
//! Pick-first serves every RPC from a single subchannel. When the resolver
//! hands over a different endpoint, the new subchannel warms up next to
//! the serving one and only replaces it once it is ready, so an endpoint
//! change never interrupts traffic that a working connection could carry.

use super::{register_subchannel, Lifecycle, LbEvent};
use crate::backoff::Backoff;
use crate::connectivity::ConnectivityState;
use crate::endpoint::Endpoint;
use crate::subchannel::{Subchannel, SubchannelEvent, SubchannelHandle};
use crate::transport::Connector;
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use tokio::sync::mpsc;
use tracing::debug;

/// A load balancer keeping at most one serving subchannel and at most one
/// warming replacement.
pub struct PickFirstBalancer<C: Connector + Clone> {
    inner: Arc<Mutex<Inner<C>>>,
    events: Option<mpsc::UnboundedReceiver<LbEvent>>,
}

struct Entry<C: Connector> {
    subchannel: Subchannel<C>,
    connectivity: ConnectivityState,
    going_away: bool,
}

struct Inner<C: Connector + Clone> {
    lifecycle: Lifecycle,
    connector: C,
    backoff: Backoff,
    /// The subchannel serving picks.
    current: Option<Entry<C>>,
    /// A replacement warming up after an endpoint change.
    next: Option<Entry<C>>,
    /// Discarded subchannels that have not yet reported `Shutdown`.
    parked: HashMap<u64, Subchannel<C>>,
    /// The last published connectivity state.
    aggregate: ConnectivityState,
    events: Option<mpsc::UnboundedSender<LbEvent>>,
    merged: Option<mpsc::UnboundedSender<(u64, SubchannelEvent)>>,
}

impl<C: Connector + Clone> PickFirstBalancer<C> {
    /// Creates the balancer and spawns its event pump. No subchannel
    /// exists until the first [`update_endpoint`](Self::update_endpoint).
    pub fn new(connector: C, backoff: Backoff) -> Self {
        let (merged_tx, mut merged_rx) = mpsc::unbounded_channel();
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let inner = Arc::new(Mutex::new(Inner {
            lifecycle: Lifecycle::Active,
            connector,
            backoff,
            current: None,
            next: None,
            parked: HashMap::new(),
            aggregate: ConnectivityState::Idle,
            events: Some(events_tx),
            merged: Some(merged_tx),
        }));

        let pump = inner.clone();
        tokio::spawn(async move {
            while let Some((id, event)) = merged_rx.recv().await {
                let mut inner = pump.lock().unwrap();
                inner.on_subchannel_event(id, event);
                if inner.lifecycle == Lifecycle::Closed {
                    break;
                }
            }
        });

        Self {
            inner,
            events: Some(events_rx),
        }
    }

    /// Takes the balancer's event stream. There is exactly one; a second
    /// call returns `None`.
    pub fn take_events(&mut self) -> Option<mpsc::UnboundedReceiver<LbEvent>> {
        self.events.take()
    }

    /// Points the balancer at a (possibly new) endpoint.
    ///
    /// A no-op if `endpoint` equals the one currently served. Otherwise a
    /// new subchannel starts connecting; if the serving one is idle it is
    /// discarded immediately, else it keeps serving until the replacement
    /// is ready.
    pub fn update_endpoint(&self, endpoint: Endpoint) {
        let mut inner = self.inner.lock().unwrap();
        if inner.lifecycle != Lifecycle::Active {
            return;
        }
        if let Some(current) = &inner.current {
            if *current.subchannel.endpoint() == endpoint {
                return;
            }
        }
        let entry = inner.start_subchannel(endpoint);
        let current_is_idle = inner
            .current
            .as_ref()
            .map(|current| current.connectivity == ConnectivityState::Idle);
        match current_is_idle {
            None => inner.current = Some(entry),
            Some(true) => {
                // Nothing is flowing through the idle subchannel; swap now.
                if let Some(old) = inner.current.replace(entry) {
                    inner.park(old.subchannel);
                }
            }
            Some(false) => {
                // Warm the replacement next to the serving subchannel.
                if let Some(previous) = inner.next.replace(entry) {
                    inner.park(previous.subchannel);
                }
            }
        }
    }

    /// Returns the serving subchannel if it is ready and not going away.
    ///
    /// Picking while the serving subchannel is idle nudges it to connect.
    pub fn pick_subchannel(&self) -> Option<SubchannelHandle<C>> {
        let inner = self.inner.lock().unwrap();
        if inner.lifecycle != Lifecycle::Active {
            return None;
        }
        match &inner.current {
            Some(current)
                if !current.going_away && current.connectivity == ConnectivityState::Ready =>
            {
                Some(current.subchannel.handle())
            }
            Some(current) => {
                if current.connectivity == ConnectivityState::Idle {
                    current.subchannel.connect();
                }
                None
            }
            None => None,
        }
    }

    /// Closes the balancer: every subchannel is discarded, `Shutdown` is
    /// published, and once the last parked subchannel terminates the event
    /// stream ends with [`LbEvent::Closed`].
    pub fn close(&self) {
        let mut inner = self.inner.lock().unwrap();
        if inner.lifecycle != Lifecycle::Active {
            return;
        }
        inner.lifecycle = Lifecycle::Closing;
        if let Some(current) = inner.current.take() {
            inner.park(current.subchannel);
        }
        if let Some(next) = inner.next.take() {
            inner.park(next.subchannel);
        }
        inner.publish(LbEvent::ConnectivityStateChanged(
            ConnectivityState::Shutdown,
        ));
        inner.maybe_finish_close();
    }
}

impl<C: Connector + Clone> Inner<C> {
    /// Builds, registers and starts a subchannel for `endpoint`.
    fn start_subchannel(&mut self, endpoint: Endpoint) -> Entry<C> {
        let mut subchannel =
            Subchannel::new(endpoint, self.connector.clone(), self.backoff.clone());
        if let Some(merged) = &self.merged {
            register_subchannel(&mut subchannel, merged);
        }
        subchannel.connect();
        Entry {
            subchannel,
            connectivity: ConnectivityState::Idle,
            going_away: false,
        }
    }

    fn park(&mut self, subchannel: Subchannel<C>) {
        debug!(subchannel = subchannel.id(), "parking subchannel");
        subchannel.shutdown();
        self.parked.insert(subchannel.id(), subchannel);
    }

    fn publish(&mut self, event: LbEvent) {
        if let LbEvent::ConnectivityStateChanged(state) = event {
            self.aggregate = state;
        }
        if let Some(events) = &self.events {
            let _ = events.send(event);
        }
    }

    fn maybe_finish_close(&mut self) {
        if self.lifecycle == Lifecycle::Closing
            && self.parked.is_empty()
            && self.current.is_none()
            && self.next.is_none()
        {
            self.lifecycle = Lifecycle::Closed;
            self.publish(LbEvent::Closed);
            // Dropping the senders finishes the event stream and lets the
            // pump task run down.
            self.events = None;
            self.merged = None;
        }
    }

    fn on_subchannel_event(&mut self, id: u64, event: SubchannelEvent) {
        if self.parked.contains_key(&id) {
            match event {
                SubchannelEvent::ConnectivityStateChanged(ConnectivityState::Idle) => {
                    // Still around: nudge it again.
                    self.parked[&id].shutdown();
                }
                SubchannelEvent::ConnectivityStateChanged(ConnectivityState::Shutdown) => {
                    self.parked.remove(&id);
                    self.maybe_finish_close();
                }
                _ => {}
            }
            return;
        }

        if self.current.as_ref().is_some_and(|c| c.subchannel.id() == id) {
            self.on_current_event(event);
        } else if self.next.as_ref().is_some_and(|n| n.subchannel.id() == id) {
            self.on_next_event(event);
        }
        // Events from subchannels already removed are dropped.
    }

    fn on_current_event(&mut self, event: SubchannelEvent) {
        match event {
            SubchannelEvent::RequiresNameResolution => {
                self.publish(LbEvent::RequiresNameResolution);
            }
            SubchannelEvent::GoingAway => {
                if let Some(current) = &mut self.current {
                    current.going_away = true;
                }
            }
            SubchannelEvent::ConnectivityStateChanged(state) => {
                if let Some(current) = &mut self.current {
                    current.connectivity = state;
                }
                if state == ConnectivityState::Shutdown {
                    // The serving subchannel terminated on its own; report
                    // idle so the owner re-resolves.
                    self.current = None;
                    if self.aggregate != ConnectivityState::Idle {
                        self.publish(LbEvent::ConnectivityStateChanged(ConnectivityState::Idle));
                    }
                    return;
                }
                if state != self.aggregate && self.lifecycle == Lifecycle::Active {
                    self.publish(LbEvent::ConnectivityStateChanged(state));
                }
            }
        }
    }

    fn on_next_event(&mut self, event: SubchannelEvent) {
        match event {
            SubchannelEvent::ConnectivityStateChanged(ConnectivityState::Ready) => {
                // The replacement is ready: swap it in and retire the old
                // serving subchannel.
                if let Some(mut promoted) = self.next.take() {
                    promoted.connectivity = ConnectivityState::Ready;
                    if let Some(old) = self.current.replace(promoted) {
                        self.park(old.subchannel);
                    }
                    // Re-published even when the aggregate was already
                    // ready: the serving subchannel changed.
                    self.publish(LbEvent::ConnectivityStateChanged(ConnectivityState::Ready));
                }
            }
            SubchannelEvent::RequiresNameResolution => {
                self.publish(LbEvent::RequiresNameResolution);
            }
            // The replacement stays in the warming seat through every
            // other transition.
            _ => {}
        }
    }
}
