//! Two-peer test fixture for integration testing
//!
//! Provides a reusable harness for two engines that share an in-memory
//! relay and transport:
//! - Mutual authentication
//! - Negotiation and channel setup
//! - Event assertions with a bounded wait
//!
//! # Example
//!
//! ```no_run
//! use parley_integration_tests::fixtures::TwoPeerFixture;
//!
//! #[tokio::test]
//! async fn test_basic_session() {
//!     let mut fixture = TwoPeerFixture::new();
//!     fixture.authenticate().await;
//!     fixture.open_channel("chat").await;
//!
//!     let polite = fixture.polite.id();
//!     fixture.impolite.engine.send(&polite, "chat", "hi").await.unwrap();
//!
//!     fixture.cleanup();
//! }
//! ```

use parley_core::mock::{MockConnection, MockNetwork, MockRelay};
use parley_core::{
    Channel, Engine, EngineConfig, EngineEvent, IdentityManager, MemoryStore, MessageStore,
};
use parley_crypto::{NativeProvider, PeerId};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

/// Room URL every fixture joins
pub const ROOM_URL: &str = "https://parley.test/room/integration";

/// Bound on each wait for an engine event
const EVENT_TIMEOUT: Duration = Duration::from_secs(10);

/// One engine with its event stream, store and running input pumps
pub struct TestPeer {
    /// The engine under test
    pub engine: Engine,
    /// Its event stream
    pub events: mpsc::UnboundedReceiver<EngineEvent>,
    /// Its message store
    pub store: Arc<MemoryStore>,
    pumps: Vec<JoinHandle<()>>,
}

impl TestPeer {
    /// Create an engine attached to `network` and `relay` and start its
    /// signaling and transport pumps.
    ///
    /// # Panics
    ///
    /// Panics if the engine cannot be created.
    #[must_use]
    pub fn spawn(
        identity: IdentityManager,
        config: EngineConfig,
        network: &MockNetwork,
        relay: &MockRelay,
    ) -> Self {
        let (factory, transport) = network.factory(identity.peer_id());
        let (sink, inbound) = relay.connect(identity.peer_id());
        let store = Arc::new(MemoryStore::new());

        let (engine, events) = Engine::new(
            config,
            identity,
            Arc::new(factory),
            sink,
            Arc::clone(&store) as Arc<dyn MessageStore>,
        )
        .expect("engine");

        let signaling = {
            let engine = engine.clone();
            tokio::spawn(async move { engine.run_signaling(inbound).await })
        };
        let transport = {
            let engine = engine.clone();
            tokio::spawn(async move { engine.run_transport(transport).await })
        };

        Self {
            engine,
            events,
            store,
            pumps: vec![signaling, transport],
        }
    }

    /// Local peer id
    #[must_use]
    pub fn id(&self) -> PeerId {
        self.engine.local_peer_id().clone()
    }

    /// Wait for the first event matching `matches`, discarding the others.
    ///
    /// # Panics
    ///
    /// Panics if no matching event arrives in time.
    pub async fn wait_for<F>(&mut self, matches: F) -> EngineEvent
    where
        F: Fn(&EngineEvent) -> bool,
    {
        let events = &mut self.events;
        let wait = async {
            while let Some(event) = events.recv().await {
                if matches(&event) {
                    return event;
                }
            }
            panic!("event stream closed");
        };
        tokio::time::timeout(EVENT_TIMEOUT, wait)
            .await
            .expect("timed out waiting for event")
    }

    /// Drain every event emitted so far
    pub fn drain(&mut self) -> Vec<EngineEvent> {
        let mut drained = Vec::new();
        while let Ok(event) = self.events.try_recv() {
            drained.push(event);
        }
        drained
    }

    /// Stop the input pumps
    pub fn stop(&self) {
        for pump in &self.pumps {
            pump.abort();
        }
    }
}

/// Two engines in one room, ordered by negotiation role
pub struct TwoPeerFixture {
    /// Shared transport
    pub network: MockNetwork,
    /// Shared relay
    pub relay: MockRelay,
    /// Id of the joined room
    pub room_id: String,
    /// The peer with the smaller id; yields on offer collisions
    pub polite: TestPeer,
    /// The peer with the larger id; wins collisions and creates channels
    pub impolite: TestPeer,
}

impl TwoPeerFixture {
    /// Create a fixture with the default configuration
    #[must_use]
    pub fn new() -> Self {
        Self::with_config(EngineConfig::default())
    }

    /// Create a fixture where both engines use `config`.
    ///
    /// # Panics
    ///
    /// Panics if an identity cannot be generated.
    #[must_use]
    pub fn with_config(config: EngineConfig) -> Self {
        let network = MockNetwork::new();
        let relay = MockRelay::new();

        let mut identities = [identity(), identity()];
        identities.sort_by(|a, b| a.peer_id().cmp(b.peer_id()));
        let [low, high] = identities;

        let polite = TestPeer::spawn(low, config.clone(), &network, &relay);
        let impolite = TestPeer::spawn(high, config, &network, &relay);

        let room_id = polite.engine.join_room(ROOM_URL);
        impolite.engine.join_room(ROOM_URL);

        Self {
            network,
            relay,
            room_id,
            polite,
            impolite,
        }
    }

    /// Run the challenge exchange and wait until both sides authenticated.
    ///
    /// # Panics
    ///
    /// Panics if authentication does not complete in time.
    pub async fn authenticate(&mut self) {
        self.impolite
            .engine
            .introduce(&self.room_id, None)
            .await
            .expect("introduce");
        self.impolite
            .wait_for(|e| matches!(e, EngineEvent::PeerAuthenticated { .. }))
            .await;
        self.polite
            .wait_for(|e| matches!(e, EngineEvent::PeerAuthenticated { .. }))
            .await;
    }

    /// Open `label` from both sides and wait until it is usable.
    ///
    /// # Panics
    ///
    /// Panics if either side fails to open the channel.
    pub async fn open_channel(&self, label: &str) -> (Channel, Channel) {
        let (polite_id, impolite_id) = (self.polite.id(), self.impolite.id());
        tokio::try_join!(
            self.polite
                .engine
                .open_channel(&self.room_id, &impolite_id, label),
            self.impolite
                .engine
                .open_channel(&self.room_id, &polite_id, label),
        )
        .expect("open channel")
    }

    /// The polite side's connection to the impolite side
    #[must_use]
    pub fn polite_connection(&self) -> Option<Arc<MockConnection>> {
        self.network
            .connection(&self.polite.id(), &self.impolite.id())
    }

    /// The impolite side's connection to the polite side
    #[must_use]
    pub fn impolite_connection(&self) -> Option<Arc<MockConnection>> {
        self.network
            .connection(&self.impolite.id(), &self.polite.id())
    }

    /// Stop both engines' pumps
    pub fn cleanup(&self) {
        self.polite.stop();
        self.impolite.stop();
    }
}

impl Default for TwoPeerFixture {
    fn default() -> Self {
        Self::new()
    }
}

/// A fresh identity backed by the native provider
///
/// # Panics
///
/// Panics if key generation fails.
#[must_use]
pub fn identity() -> IdentityManager {
    IdentityManager::new(Arc::new(NativeProvider)).expect("identity")
}
