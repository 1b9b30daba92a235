//! In-process loopback session.
//!
//! Two engines share an in-memory relay and transport. They authenticate
//! each other, negotiate, open an encrypted channel and exchange messages,
//! exercising the whole engine without a network.

use anyhow::Context;
use parley_core::mock::{MockNetwork, MockRelay};
use parley_core::{Engine, EngineConfig, EngineEvent, IdentityManager, MemoryStore, MessageStore};
use parley_crypto::{NativeProvider, PeerId};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

/// Bound on each wait for an engine event
const EVENT_TIMEOUT: Duration = Duration::from_secs(15);

struct Node {
    name: &'static str,
    engine: Engine,
    events: mpsc::UnboundedReceiver<EngineEvent>,
    store: Arc<MemoryStore>,
    pumps: Vec<JoinHandle<()>>,
}

impl Node {
    fn spawn(
        name: &'static str,
        config: &EngineConfig,
        network: &MockNetwork,
        relay: &MockRelay,
    ) -> anyhow::Result<Self> {
        let identity = IdentityManager::new(Arc::new(NativeProvider))?;
        let (factory, transport) = network.factory(identity.peer_id());
        let (sink, inbound) = relay.connect(identity.peer_id());
        let store = Arc::new(MemoryStore::new());

        let (engine, events) = Engine::new(
            config.clone(),
            identity,
            Arc::new(factory),
            sink,
            Arc::clone(&store) as Arc<dyn MessageStore>,
        )?;

        let signaling = {
            let engine = engine.clone();
            tokio::spawn(async move { engine.run_signaling(inbound).await })
        };
        let transport = {
            let engine = engine.clone();
            tokio::spawn(async move { engine.run_transport(transport).await })
        };

        println!("{:<6} {}", name, engine.local_peer_id());
        Ok(Self {
            name,
            engine,
            events,
            store,
            pumps: vec![signaling, transport],
        })
    }

    fn id(&self) -> &PeerId {
        self.engine.local_peer_id()
    }

    async fn wait_for<F>(&mut self, what: &str, mut matches: F) -> anyhow::Result<EngineEvent>
    where
        F: FnMut(&EngineEvent) -> bool,
    {
        let name = self.name;
        let events = &mut self.events;
        let wait = async {
            while let Some(event) = events.recv().await {
                tracing::debug!("{}: {:?}", name, event);
                if matches(&event) {
                    return Some(event);
                }
            }
            None
        };
        tokio::time::timeout(EVENT_TIMEOUT, wait)
            .await
            .with_context(|| format!("{} timed out waiting for {}", name, what))?
            .with_context(|| format!("{} event stream closed", name))
    }

    fn stop(&self) {
        for pump in &self.pumps {
            pump.abort();
        }
    }
}

/// Run a loopback session exchanging `messages` messages each way on `label`.
///
/// # Errors
///
/// Returns an error if any step fails or times out.
pub async fn run(
    config: &EngineConfig,
    room_url: &str,
    label: &str,
    messages: usize,
    message_bytes: usize,
) -> anyhow::Result<()> {
    let started = Instant::now();
    let network = MockNetwork::new();
    let relay = MockRelay::new();

    println!("Peers:");
    let mut alice = Node::spawn("alice", config, &network, &relay)?;
    let mut bob = Node::spawn("bob", config, &network, &relay)?;

    let room_id = alice.engine.join_room(room_url);
    bob.engine.join_room(room_url);
    println!("Room:  {}", room_id);
    println!();

    alice.engine.introduce(&room_id, None).await?;
    alice
        .wait_for("authentication", |e| matches!(e, EngineEvent::PeerAuthenticated { .. }))
        .await?;
    bob.wait_for("authentication", |e| matches!(e, EngineEvent::PeerAuthenticated { .. }))
        .await?;
    println!("Mutual authentication complete");

    let (alice_id, bob_id) = (alice.id().clone(), bob.id().clone());
    println!(
        "Roles: alice is {:?}, bob is {:?}",
        alice.engine.role(&bob_id),
        bob.engine.role(&alice_id)
    );

    let (from_alice, from_bob) = tokio::try_join!(
        alice.engine.open_channel(&room_id, &bob_id, label),
        bob.engine.open_channel(&room_id, &alice_id, label),
    )?;
    println!(
        "Channel '{}' open ({:?} / {:?})",
        label, from_alice.state, from_bob.state
    );
    println!();

    let padding = "x".repeat(message_bytes);
    for i in 0..messages {
        let body = format!("ping {i} {padding}");
        alice.engine.send(&bob_id, label, &body).await?;
        let received = bob
            .wait_for("message", |e| matches!(e, EngineEvent::MessageReceived { .. }))
            .await?;
        if let EngineEvent::MessageReceived { message, .. } = received {
            anyhow::ensure!(message.message == body, "message {i} corrupted");
            println!("alice -> bob  {} ({} bytes)", message.id, message.message.len());
        }

        let reply = format!("pong {i}");
        bob.engine.send(&alice_id, label, &reply).await?;
        let received = alice
            .wait_for("reply", |e| matches!(e, EngineEvent::MessageReceived { .. }))
            .await?;
        if let EngineEvent::MessageReceived { message, .. } = received {
            anyhow::ensure!(message.message == reply, "reply {i} corrupted");
            println!("bob -> alice  {} ({} bytes)", message.id, message.message.len());
        }
    }

    let history = alice
        .engine
        .channel(&bob_id, label)
        .await
        .map_or(0, |c| c.messages().len());
    let stored = alice.store.snapshot().messages.len();

    alice.engine.disconnect(&bob_id).await?;
    bob.wait_for("disconnect", |e| matches!(e, EngineEvent::PeerClosed { .. }))
        .await?;

    alice.stop();
    bob.stop();

    println!();
    println!("Summary:");
    println!("  Messages exchanged: {}", messages * 2);
    println!("  Channel history:    {}", history);
    println!("  Stored messages:    {}", stored);
    println!("  Elapsed:            {:.2?}", started.elapsed());
    Ok(())
}
