//! The round-robin load-balancing policy.
//!
//! Round-robin keeps one subchannel per endpoint and rotates picks over
//! the ready ones. Endpoints are keyed by the unordered multiset of their
//! addresses, so a resolver update that merely reorders addresses within
//! an endpoint does not replace its subchannel. Removals are deferred
//! where possible: a subchannel slated for removal keeps serving until
//! some other subchannel becomes ready, so serving capacity never drops
//! to zero just because the resolver moved the fleet around.

use super::{register_subchannel, Lifecycle, LbEvent};
use crate::backoff::Backoff;
use crate::connectivity::{aggregate, ConnectivityState};
use crate::endpoint::{Endpoint, EndpointKey};
use crate::subchannel::{Subchannel, SubchannelEvent, SubchannelHandle};
use crate::transport::Connector;
use rand::Rng;
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use tokio::sync::mpsc;
use tracing::debug;

/// A load balancer rotating picks over every ready subchannel.
pub struct RoundRobinBalancer<C: Connector + Clone> {
    inner: Arc<Mutex<Inner<C>>>,
    events: Option<mpsc::UnboundedReceiver<LbEvent>>,
}

struct Entry<C: Connector> {
    subchannel: Subchannel<C>,
    connectivity: ConnectivityState,
    /// Slated for removal by a resolver update; parked as soon as another
    /// subchannel reports ready.
    marked_for_removal: bool,
}

struct Inner<C: Connector + Clone> {
    lifecycle: Lifecycle,
    connector: C,
    backoff: Backoff,
    /// Live subchannels by id.
    entries: HashMap<u64, Entry<C>>,
    /// Endpoint identity to subchannel id.
    by_key: HashMap<EndpointKey, u64>,
    /// Discarded subchannels that have not yet reported `Shutdown`.
    parked: HashMap<u64, Subchannel<C>>,
    /// Handles of the ready subchannels, in rotation order.
    picker: Vec<SubchannelHandle<C>>,
    picker_index: usize,
    /// The last published aggregate state.
    published: ConnectivityState,
    events: Option<mpsc::UnboundedSender<LbEvent>>,
    merged: Option<mpsc::UnboundedSender<(u64, SubchannelEvent)>>,
}

impl<C: Connector + Clone> RoundRobinBalancer<C> {
    /// Creates the balancer and spawns its event pump. No subchannels
    /// exist until the first [`update_addresses`](Self::update_addresses).
    pub fn new(connector: C, backoff: Backoff) -> Self {
        let (merged_tx, mut merged_rx) = mpsc::unbounded_channel();
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let inner = Arc::new(Mutex::new(Inner {
            lifecycle: Lifecycle::Active,
            connector,
            backoff,
            entries: HashMap::new(),
            by_key: HashMap::new(),
            parked: HashMap::new(),
            picker: Vec::new(),
            picker_index: 0,
            published: ConnectivityState::Idle,
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

    /// Reconciles the subchannel set against a resolver update.
    ///
    /// New endpoints get a subchannel that starts connecting immediately.
    /// Endpoints that disappeared are removed: as many as the update adds
    /// are kept serving until a new subchannel becomes ready, the excess
    /// is discarded on the spot.
    pub fn update_addresses(&self, endpoints: Vec<Endpoint>) {
        let mut inner = self.inner.lock().unwrap();
        if inner.lifecycle != Lifecycle::Active {
            return;
        }
        // A real reference lets the borrow checker split the fields below.
        let inner = &mut *inner;

        let mut incoming: HashMap<EndpointKey, Endpoint> = HashMap::new();
        for endpoint in endpoints {
            incoming.entry(endpoint.key()).or_insert(endpoint);
        }

        // An endpoint slated for removal that reappears is simply kept.
        for (key, id) in &inner.by_key {
            if incoming.contains_key(key) {
                if let Some(entry) = inner.entries.get_mut(id) {
                    entry.marked_for_removal = false;
                }
            }
        }

        let to_add: Vec<Endpoint> = incoming
            .iter()
            .filter(|(key, _)| !inner.by_key.contains_key(*key))
            .map(|(_, endpoint)| endpoint.clone())
            .collect();
        let to_remove: Vec<EndpointKey> = inner
            .by_key
            .keys()
            .filter(|key| !incoming.contains_key(*key))
            .cloned()
            .collect();
        if to_add.is_empty() && to_remove.is_empty() {
            return;
        }
        debug!(
            adding = to_add.len(),
            removing = to_remove.len(),
            "reconciling endpoints"
        );

        for endpoint in to_add.iter().cloned() {
            inner.start_subchannel(endpoint);
        }

        // Removing more than we add would dent serving capacity; only the
        // excess goes now, the rest waits for a replacement to be ready.
        let immediately = to_remove.len().saturating_sub(to_add.len());
        for (index, key) in to_remove.iter().enumerate() {
            if index < immediately {
                inner.remove_by_key(key);
            } else if let Some(&id) = inner.by_key.get(key) {
                if let Some(entry) = inner.entries.get_mut(&id) {
                    entry.marked_for_removal = true;
                }
            }
        }

        inner.refresh_picker();
        inner.refresh_aggregate();
    }

    /// Returns the next ready subchannel in rotation.
    ///
    /// When nothing is ready and the aggregate is idle, every subchannel
    /// is asked to connect and `None` is returned.
    pub fn pick_subchannel(&self) -> Option<SubchannelHandle<C>> {
        let mut inner = self.inner.lock().unwrap();
        if inner.lifecycle != Lifecycle::Active {
            return None;
        }
        if inner.picker.is_empty() {
            if inner.published == ConnectivityState::Idle {
                for entry in inner.entries.values() {
                    entry.subchannel.connect();
                }
            }
            return None;
        }
        let picked = inner.picker[inner.picker_index].clone();
        inner.picker_index = (inner.picker_index + 1) % inner.picker.len();
        Some(picked)
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
        let ids: Vec<u64> = inner.entries.keys().cloned().collect();
        for id in ids {
            inner.remove_by_id(id);
        }
        inner.picker.clear();
        inner.publish(LbEvent::ConnectivityStateChanged(
            ConnectivityState::Shutdown,
        ));
        inner.maybe_finish_close();
    }
}

impl<C: Connector + Clone> Inner<C> {
    fn start_subchannel(&mut self, endpoint: Endpoint) {
        let key = endpoint.key();
        let mut subchannel =
            Subchannel::new(endpoint, self.connector.clone(), self.backoff.clone());
        if let Some(merged) = &self.merged {
            register_subchannel(&mut subchannel, merged);
        }
        subchannel.connect();
        let id = subchannel.id();
        self.by_key.insert(key, id);
        self.entries.insert(
            id,
            Entry {
                subchannel,
                connectivity: ConnectivityState::Idle,
                marked_for_removal: false,
            },
        );
    }

    fn remove_by_key(&mut self, key: &EndpointKey) {
        if let Some(id) = self.by_key.remove(key) {
            if let Some(entry) = self.entries.remove(&id) {
                self.park(entry.subchannel);
            }
        }
    }

    fn remove_by_id(&mut self, id: u64) {
        if let Some(entry) = self.entries.remove(&id) {
            self.by_key.remove(&entry.subchannel.endpoint().key());
            self.park(entry.subchannel);
        }
    }

    fn park(&mut self, subchannel: Subchannel<C>) {
        debug!(subchannel = subchannel.id(), "parking subchannel");
        subchannel.shutdown();
        self.parked.insert(subchannel.id(), subchannel);
    }

    fn publish(&mut self, event: LbEvent) {
        if let LbEvent::ConnectivityStateChanged(state) = event {
            self.published = state;
        }
        if let Some(events) = &self.events {
            let _ = events.send(event);
        }
    }

    fn maybe_finish_close(&mut self) {
        if self.lifecycle == Lifecycle::Closing && self.parked.is_empty() {
            self.lifecycle = Lifecycle::Closed;
            self.publish(LbEvent::Closed);
            self.events = None;
            self.merged = None;
        }
    }

    /// Rebuilds the ready list. The starting index is randomised so
    /// distinct balancers do not converge on the same first pick.
    fn refresh_picker(&mut self) {
        self.picker = self
            .entries
            .values()
            .filter(|entry| entry.connectivity == ConnectivityState::Ready)
            .map(|entry| entry.subchannel.handle())
            .collect();
        self.picker_index = if self.picker.is_empty() {
            0
        } else {
            rand::rng().random_range(0..self.picker.len())
        };
    }

    /// Recomputes and, if it changed, publishes the aggregate state.
    fn refresh_aggregate(&mut self) {
        if self.lifecycle != Lifecycle::Active {
            return;
        }
        let state = if self.entries.is_empty() {
            // No live subchannels: report idle until the resolver hands
            // over endpoints again.
            ConnectivityState::Idle
        } else {
            aggregate(self.entries.values().map(|entry| entry.connectivity))
        };
        if state != self.published {
            self.publish(LbEvent::ConnectivityStateChanged(state));
        }
    }

    fn on_subchannel_event(&mut self, id: u64, event: SubchannelEvent) {
        if self.parked.contains_key(&id) {
            match event {
                SubchannelEvent::ConnectivityStateChanged(ConnectivityState::Idle) => {
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
        if !self.entries.contains_key(&id) {
            return;
        }

        match event {
            SubchannelEvent::RequiresNameResolution => {
                self.publish(LbEvent::RequiresNameResolution);
            }
            SubchannelEvent::GoingAway => {
                // The peer is draining this subchannel: take it out of
                // rotation right away. The drain also means the name
                // resolution is likely stale.
                self.remove_by_id(id);
                self.publish(LbEvent::RequiresNameResolution);
                self.refresh_picker();
                self.refresh_aggregate();
            }
            SubchannelEvent::ConnectivityStateChanged(state) => {
                let previous = self.entries[&id].connectivity;
                if previous == ConnectivityState::TransientFailure
                    && state == ConnectivityState::Connecting
                {
                    // Not a state change per the load-balancing rules: the
                    // subchannel stays in transient failure until it makes
                    // it back to ready.
                    return;
                }
                if let Some(entry) = self.entries.get_mut(&id) {
                    entry.connectivity = state;
                }
                if state == ConnectivityState::Ready {
                    self.drain_marked_except(id);
                }
                if state == ConnectivityState::Shutdown {
                    // Terminal on its own account: already shut down, so
                    // there is nothing left to park.
                    if let Some(entry) = self.entries.remove(&id) {
                        self.by_key.remove(&entry.subchannel.endpoint().key());
                    }
                }
                self.refresh_picker();
                self.refresh_aggregate();
            }
        }
    }

    /// Parks every subchannel slated for removal, now that `ready_id`
    /// provides serving capacity.
    fn drain_marked_except(&mut self, ready_id: u64) {
        let marked: Vec<u64> = self
            .entries
            .iter()
            .filter(|(id, entry)| **id != ready_id && entry.marked_for_removal)
            .map(|(id, _)| *id)
            .collect();
        for id in marked {
            self.remove_by_id(id);
        }
    }
}
