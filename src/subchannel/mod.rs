//! A subchannel controls at most one live connection to one endpoint.
//!
//! Each subchannel is driven by its own task: the task feeds owner
//! requests, connection events and backoff timer firings through the pure
//! [`machine`] and performs the effects it returns. The owner (a load
//! balancer) watches the subchannel through its [`SubchannelEvent`]
//! stream and opens streams through a cheap [`SubchannelHandle`].

mod machine;

use crate::backoff::Backoff;
use crate::connectivity::ConnectivityState;
use crate::endpoint::Endpoint;
use crate::error::Error;
use crate::transport::{
    CloseReason, Connection, ConnectionEvent, Connector, MethodDescriptor, StreamOptions,
};
use crate::Result;
use machine::{Effect, Input, Machine, State};
use std::future::Future;
use std::pin::Pin;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use tokio::sync::mpsc;
use tracing::{debug, trace};

/// Mints crate-wide unique subchannel identities. The identity is how a
/// load balancer correlates events with a subchannel it may have already
/// replaced.
static NEXT_SUBCHANNEL_ID: AtomicU64 = AtomicU64::new(1);

/// Events a subchannel publishes to its owner.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SubchannelEvent {
    /// The subchannel's connectivity changed. `Shutdown` is reported at
    /// most once and is the final event.
    ConnectivityStateChanged(ConnectivityState),
    /// The peer announced it will stop serving new streams.
    GoingAway,
    /// The peer's signal suggests the name resolution may be stale.
    RequiresNameResolution,
}

/// Owner-side requests fed into the driver.
#[derive(Debug, Clone, Copy)]
enum Request {
    Connect,
    Shutdown,
}

struct ConnSlot<C: Connector> {
    conn: Option<C::Conn>,
    /// Streams may only be opened while the machine is `Connected`.
    open_for_streams: bool,
}

struct Shared<C: Connector> {
    slot: Mutex<ConnSlot<C>>,
}

/// A subchannel, owned by a load balancer.
///
/// Dropping it (and every handle cloned from it) shuts the driver task
/// down.
pub struct Subchannel<C: Connector> {
    handle: SubchannelHandle<C>,
    endpoint: Endpoint,
    events: Option<mpsc::UnboundedReceiver<SubchannelEvent>>,
}

impl<C: Connector> std::fmt::Debug for Subchannel<C> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Subchannel")
            .field("id", &self.handle.id)
            .field("endpoint", &self.endpoint)
            .finish_non_exhaustive()
    }
}

/// A cheap, cloneable reference to a subchannel, good for picking and for
/// opening streams.
pub struct SubchannelHandle<C: Connector> {
    id: u64,
    requests: mpsc::UnboundedSender<Request>,
    shared: Arc<Shared<C>>,
}

impl<C: Connector> std::fmt::Debug for SubchannelHandle<C> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SubchannelHandle")
            .field("id", &self.id)
            .finish_non_exhaustive()
    }
}

impl<C: Connector> Clone for SubchannelHandle<C> {
    fn clone(&self) -> Self {
        Self {
            id: self.id,
            requests: self.requests.clone(),
            shared: self.shared.clone(),
        }
    }
}

impl<C: Connector> Subchannel<C> {
    /// Creates the subchannel and spawns its driver task.
    ///
    /// The subchannel starts out `NotConnected`; nothing is attempted
    /// until [`connect`](Self::connect) is called.
    pub fn new(endpoint: Endpoint, connector: C, backoff: Backoff) -> Self {
        let id = NEXT_SUBCHANNEL_ID.fetch_add(1, Ordering::Relaxed);
        let (requests_tx, requests_rx) = mpsc::unbounded_channel();
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let shared = Arc::new(Shared {
            slot: Mutex::new(ConnSlot {
                conn: None,
                open_for_streams: false,
            }),
        });

        let driver = Driver {
            id,
            endpoint: endpoint.clone(),
            connector: Arc::new(connector),
            backoff,
            shared: shared.clone(),
            requests: requests_rx,
            events: events_tx,
        };
        tokio::spawn(driver.run());

        Self {
            handle: SubchannelHandle {
                id,
                requests: requests_tx,
                shared,
            },
            endpoint,
            events: Some(events_rx),
        }
    }

    pub fn id(&self) -> u64 {
        self.handle.id
    }

    pub fn endpoint(&self) -> &Endpoint {
        &self.endpoint
    }

    /// A cloneable reference for picking and stream creation.
    pub fn handle(&self) -> SubchannelHandle<C> {
        self.handle.clone()
    }

    /// Takes the event stream. Yields events in causal order and ends once
    /// the subchannel reaches `Shutdown`. There is exactly one stream; the
    /// second call returns `None`.
    pub fn take_events(&mut self) -> Option<mpsc::UnboundedReceiver<SubchannelEvent>> {
        self.events.take()
    }

    /// Asks the subchannel to establish a connection. A no-op unless it is
    /// currently `NotConnected`.
    pub fn connect(&self) {
        self.handle.connect();
    }

    /// Shuts the subchannel down. In-flight work is waited out; the event
    /// stream ends with a final `Shutdown` state change.
    pub fn shutdown(&self) {
        self.handle.shutdown();
    }

    /// Opens a bidirectional stream on the live connection.
    ///
    /// # Errors
    ///
    /// [`Error::Unavailable`] unless the subchannel is connected.
    pub fn make_stream(
        &self,
        descriptor: &MethodDescriptor,
        options: &StreamOptions,
    ) -> Result<<C::Conn as Connection>::Stream> {
        self.handle.make_stream(descriptor, options)
    }
}

impl<C: Connector> SubchannelHandle<C> {
    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn connect(&self) {
        let _ = self.requests.send(Request::Connect);
    }

    pub fn shutdown(&self) {
        let _ = self.requests.send(Request::Shutdown);
    }

    /// Opens a bidirectional stream on the live connection.
    ///
    /// # Errors
    ///
    /// [`Error::Unavailable`] unless the subchannel is connected.
    pub fn make_stream(
        &self,
        descriptor: &MethodDescriptor,
        options: &StreamOptions,
    ) -> Result<<C::Conn as Connection>::Stream> {
        let mut slot = self.shared.slot.lock().unwrap();
        if slot.open_for_streams {
            if let Some(conn) = slot.conn.as_mut() {
                return conn.make_stream(descriptor, options);
            }
        }
        Err(Error::Unavailable(
            "subchannel has no ready connection".to_string(),
        ))
    }
}

type EstablishFuture<C> = Pin<
    Box<
        dyn Future<
                Output = Result<(
                    <C as Connector>::Conn,
                    mpsc::UnboundedReceiver<ConnectionEvent>,
                )>,
            > + Send,
    >,
>;

struct Driver<C: Connector> {
    id: u64,
    endpoint: Endpoint,
    connector: Arc<C>,
    backoff: Backoff,
    shared: Arc<Shared<C>>,
    requests: mpsc::UnboundedReceiver<Request>,
    events: mpsc::UnboundedSender<SubchannelEvent>,
}

impl<C: Connector> Driver<C> {
    #[tracing::instrument(skip_all, fields(subchannel = self.id))]
    async fn run(mut self) {
        let mut machine = Machine::new(self.endpoint.addresses().len());
        let mut conn_events: Option<mpsc::UnboundedReceiver<ConnectionEvent>> = None;
        let mut connect_fut: Option<EstablishFuture<C>> = None;
        let mut backoff_sleep: Option<Pin<Box<tokio::time::Sleep>>> = None;
        let mut requests_open = true;
        let mut finished = false;

        while !finished {
            let input = tokio::select! {
                maybe = self.requests.recv(), if requests_open => match maybe {
                    Some(Request::Connect) => Input::Connect,
                    Some(Request::Shutdown) => Input::Shutdown,
                    None => {
                        // Every owner handle is gone; tear down.
                        requests_open = false;
                        Input::Shutdown
                    }
                },
                result = async { connect_fut.as_mut().unwrap().await }, if connect_fut.is_some() => {
                    connect_fut = None;
                    match result {
                        Ok((conn, events)) => {
                            self.shared.slot.lock().unwrap().conn = Some(conn);
                            conn_events = Some(events);
                            // The machine learns the outcome from the
                            // connection's own events.
                            continue;
                        }
                        Err(error) => {
                            debug!(%error, "connection attempt failed");
                            Input::ConnectFailed
                        }
                    }
                },
                maybe = async { conn_events.as_mut().unwrap().recv().await }, if conn_events.is_some() => {
                    match maybe {
                        Some(ConnectionEvent::ConnectSucceeded) => Input::ConnectSucceeded,
                        Some(ConnectionEvent::ConnectFailed) => {
                            self.discard_connection(&mut conn_events);
                            Input::ConnectFailed
                        }
                        Some(ConnectionEvent::GoingAway) => Input::GoingAway,
                        Some(ConnectionEvent::Closed(reason)) => {
                            self.discard_connection(&mut conn_events);
                            Input::Closed(reason)
                        }
                        // The transport dropped its event channel without a
                        // closed notification; treat it as the peer going
                        // away.
                        None => {
                            self.discard_connection(&mut conn_events);
                            Input::Closed(CloseReason::Remote)
                        }
                    }
                },
                _ = async { backoff_sleep.as_mut().unwrap().await }, if backoff_sleep.is_some() => {
                    backoff_sleep = None;
                    Input::BackedOff
                },
            };

            trace!(?input, state = ?machine.state(), "subchannel input");
            for effect in machine.handle(input) {
                match effect {
                    Effect::Emit(event) => {
                        let _ = self.events.send(event);
                    }
                    Effect::Connect(index) => {
                        let address = self.endpoint.addresses()[index];
                        let connector = self.connector.clone();
                        connect_fut = Some(Box::pin(async move {
                            connector.establish(address).await
                        }));
                    }
                    Effect::ScheduleBackoff => {
                        let delay = self.backoff.next_delay();
                        debug!(?delay, "backing off before reconnecting");
                        backoff_sleep = Some(Box::pin(tokio::time::sleep(delay)));
                    }
                    Effect::ResetBackoff => self.backoff.reset(),
                    Effect::CloseConnection => {
                        if let Some(conn) = self.shared.slot.lock().unwrap().conn.as_mut() {
                            conn.close();
                        }
                    }
                    Effect::Finish => finished = true,
                }
            }

            // Streams may only be opened while connected.
            let mut slot = self.shared.slot.lock().unwrap();
            slot.open_for_streams = machine.state() == State::Connected;
            if finished {
                slot.conn = None;
            }
        }
        debug!("subchannel terminated");
        // Dropping `self.events` finishes the event stream.
    }

    fn discard_connection(
        &self,
        conn_events: &mut Option<mpsc::UnboundedReceiver<ConnectionEvent>>,
    ) {
        *conn_events = None;
        self.shared.slot.lock().unwrap().conn = None;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::testing::{ConnectScript, FakeConnector};
    use std::net::SocketAddr;

    fn addr(s: &str) -> SocketAddr {
        s.parse().unwrap()
    }

    fn endpoint(addrs: &[&str]) -> Endpoint {
        Endpoint::new(addrs.iter().copied().map(addr).collect())
    }

    fn quick_backoff() -> Backoff {
        Backoff::new(
            std::time::Duration::from_millis(10),
            1.0,
            0.0,
            std::time::Duration::from_millis(10),
        )
    }

    async fn expect_event(
        events: &mut mpsc::UnboundedReceiver<SubchannelEvent>,
        expected: SubchannelEvent,
    ) {
        assert_eq!(events.recv().await, Some(expected));
    }

    #[tokio::test]
    async fn connects_and_serves_streams() {
        let connector = FakeConnector::new();
        let mut subchannel = Subchannel::new(
            endpoint(&["10.0.0.1:50051"]),
            connector.clone(),
            quick_backoff(),
        );
        let mut events = subchannel.take_events().unwrap();
        assert!(subchannel.take_events().is_none());

        let descriptor = MethodDescriptor::new("echo.Echo", "Collect");
        let options = StreamOptions::default();
        assert!(matches!(
            subchannel.make_stream(&descriptor, &options),
            Err(Error::Unavailable(_))
        ));

        subchannel.connect();
        expect_event(
            &mut events,
            SubchannelEvent::ConnectivityStateChanged(ConnectivityState::Connecting),
        )
        .await;

        connector.last_connection().send(ConnectionEvent::ConnectSucceeded);
        expect_event(
            &mut events,
            SubchannelEvent::ConnectivityStateChanged(ConnectivityState::Ready),
        )
        .await;

        subchannel.make_stream(&descriptor, &options).unwrap();
        assert_eq!(connector.last_connection().stream_count(), 1);
        assert_eq!(connector.attempts(), vec![addr("10.0.0.1:50051")]);
    }

    #[tokio::test(start_paused = true)]
    async fn walks_addresses_then_backs_off() {
        let connector = FakeConnector::new();
        connector.script([ConnectScript::Refuse, ConnectScript::Refuse]);

        let mut subchannel = Subchannel::new(
            endpoint(&["10.0.0.1:50051", "10.0.0.2:50051"]),
            connector.clone(),
            quick_backoff(),
        );
        let mut events = subchannel.take_events().unwrap();

        subchannel.connect();
        expect_event(
            &mut events,
            SubchannelEvent::ConnectivityStateChanged(ConnectivityState::Connecting),
        )
        .await;

        // Both scripted refusals burn through the address list, so the
        // subchannel reports transient failure and backs off.
        expect_event(
            &mut events,
            SubchannelEvent::ConnectivityStateChanged(ConnectivityState::TransientFailure),
        )
        .await;

        // After the backoff delay it starts over at the first address and
        // this time the (unscripted) attempt is accepted.
        expect_event(
            &mut events,
            SubchannelEvent::ConnectivityStateChanged(ConnectivityState::Connecting),
        )
        .await;
        connector.last_connection().send(ConnectionEvent::ConnectSucceeded);
        expect_event(
            &mut events,
            SubchannelEvent::ConnectivityStateChanged(ConnectivityState::Ready),
        )
        .await;

        assert_eq!(
            connector.attempts(),
            vec![
                addr("10.0.0.1:50051"),
                addr("10.0.0.2:50051"),
                addr("10.0.0.1:50051"),
            ]
        );
    }

    #[tokio::test]
    #[tracing_test::traced_test]
    async fn keepalive_timeout_reconnects_and_requests_resolution() {
        let connector = FakeConnector::new();
        let mut subchannel = Subchannel::new(
            endpoint(&["10.0.0.1:50051"]),
            connector.clone(),
            quick_backoff(),
        );
        let mut events = subchannel.take_events().unwrap();

        subchannel.connect();
        expect_event(
            &mut events,
            SubchannelEvent::ConnectivityStateChanged(ConnectivityState::Connecting),
        )
        .await;
        connector.last_connection().send(ConnectionEvent::ConnectSucceeded);
        expect_event(
            &mut events,
            SubchannelEvent::ConnectivityStateChanged(ConnectivityState::Ready),
        )
        .await;

        connector
            .last_connection()
            .send(ConnectionEvent::Closed(CloseReason::KeepaliveTimeout));
        expect_event(
            &mut events,
            SubchannelEvent::ConnectivityStateChanged(ConnectivityState::TransientFailure),
        )
        .await;
        expect_event(&mut events, SubchannelEvent::RequiresNameResolution).await;
        expect_event(
            &mut events,
            SubchannelEvent::ConnectivityStateChanged(ConnectivityState::Connecting),
        )
        .await;

        // A second connection attempt is in flight.
        connector.last_connection().send(ConnectionEvent::ConnectSucceeded);
        expect_event(
            &mut events,
            SubchannelEvent::ConnectivityStateChanged(ConnectivityState::Ready),
        )
        .await;
        assert_eq!(connector.connection_count(), 2);
    }

    #[tokio::test]
    async fn going_away_then_closure_goes_idle() {
        let connector = FakeConnector::new();
        let mut subchannel = Subchannel::new(
            endpoint(&["10.0.0.1:50051"]),
            connector.clone(),
            quick_backoff(),
        );
        let mut events = subchannel.take_events().unwrap();

        subchannel.connect();
        connector.last_connection().send(ConnectionEvent::ConnectSucceeded);
        expect_event(
            &mut events,
            SubchannelEvent::ConnectivityStateChanged(ConnectivityState::Connecting),
        )
        .await;
        expect_event(
            &mut events,
            SubchannelEvent::ConnectivityStateChanged(ConnectivityState::Ready),
        )
        .await;

        connector.last_connection().send(ConnectionEvent::GoingAway);
        expect_event(&mut events, SubchannelEvent::GoingAway).await;
        expect_event(&mut events, SubchannelEvent::RequiresNameResolution).await;

        // New streams are already refused while going away.
        let descriptor = MethodDescriptor::new("echo.Echo", "Collect");
        assert!(matches!(
            subchannel.make_stream(&descriptor, &StreamOptions::default()),
            Err(Error::Unavailable(_))
        ));

        connector
            .last_connection()
            .send(ConnectionEvent::Closed(CloseReason::Remote));
        expect_event(
            &mut events,
            SubchannelEvent::ConnectivityStateChanged(ConnectivityState::Idle),
        )
        .await;
    }

    #[tokio::test]
    async fn shutdown_closes_the_connection_and_ends_the_stream() {
        let connector = FakeConnector::new();
        let mut subchannel = Subchannel::new(
            endpoint(&["10.0.0.1:50051"]),
            connector.clone(),
            quick_backoff(),
        );
        let mut events = subchannel.take_events().unwrap();

        subchannel.connect();
        connector.last_connection().send(ConnectionEvent::ConnectSucceeded);
        expect_event(
            &mut events,
            SubchannelEvent::ConnectivityStateChanged(ConnectivityState::Connecting),
        )
        .await;
        expect_event(
            &mut events,
            SubchannelEvent::ConnectivityStateChanged(ConnectivityState::Ready),
        )
        .await;

        subchannel.shutdown();
        // The driver closes the connection; the transport confirms.
        let handle = connector.last_connection();
        while !handle.is_closed() {
            tokio::task::yield_now().await;
        }
        handle.send(ConnectionEvent::Closed(CloseReason::InitiatedLocally));

        expect_event(
            &mut events,
            SubchannelEvent::ConnectivityStateChanged(ConnectivityState::Shutdown),
        )
        .await;
        // Terminal: the event stream ends and streams stay refused.
        assert_eq!(events.recv().await, None);
        let descriptor = MethodDescriptor::new("echo.Echo", "Collect");
        assert!(matches!(
            subchannel.make_stream(&descriptor, &StreamOptions::default()),
            Err(Error::Unavailable(_))
        ));
    }

    #[tokio::test]
    async fn dropping_the_subchannel_tears_the_driver_down() {
        let connector = FakeConnector::new();
        let mut subchannel = Subchannel::new(
            endpoint(&["10.0.0.1:50051"]),
            connector.clone(),
            quick_backoff(),
        );
        let mut events = subchannel.take_events().unwrap();
        subchannel.connect();
        expect_event(
            &mut events,
            SubchannelEvent::ConnectivityStateChanged(ConnectivityState::Connecting),
        )
        .await;

        drop(subchannel);
        // The driver shuts down once every owner handle is gone; the
        // in-flight attempt is waited out first.
        connector.last_connection().send(ConnectionEvent::ConnectSucceeded);
        expect_event(
            &mut events,
            SubchannelEvent::ConnectivityStateChanged(ConnectivityState::Shutdown),
        )
        .await;
        assert_eq!(events.recv().await, None);
        assert!(connector.last_connection().is_closed());
    }
}
