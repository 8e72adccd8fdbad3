use std::{net::SocketAddr, sync::Arc, time::Duration};

use anyhow::{Result, anyhow};
use chat_relay::{
    client::{ChatClient, ClientEvent, ClientSender},
    message::{ChatMessage, write_message},
    registry::{CollisionPolicy, Registry},
    relay::{Relay, RelayConfig},
};
use tokio::{
    io::AsyncWriteExt,
    net::{TcpListener, TcpStream, tcp::OwnedWriteHalf},
    sync::{mpsc, oneshot},
    task::JoinHandle,
    time::{sleep, timeout},
};

const WAIT: Duration = Duration::from_secs(2);
const QUIET: Duration = Duration::from_millis(200);

struct TestRelay {
    addr: SocketAddr,
    registry: Arc<Registry>,
    shutdown: oneshot::Sender<()>,
    server: JoinHandle<()>,
}

impl TestRelay {
    async fn start(config: RelayConfig) -> Result<Self> {
        let listener = TcpListener::bind("127.0.0.1:0").await?;
        let relay = Relay::new(listener, config);
        let addr = relay.local_addr()?;
        let registry = relay.registry();

        let (shutdown, shutdown_rx) = oneshot::channel::<()>();
        let server = tokio::spawn(async move {
            let shutdown = async move {
                let _ = shutdown_rx.await;
            };
            let _ = relay.run_until(shutdown).await;
        });

        Ok(Self {
            addr,
            registry,
            shutdown,
            server,
        })
    }

    async fn stop(self) {
        let _ = self.shutdown.send(());
        let _ = self.server.await;
    }

    /// Polls the registered identities until `check` holds.
    async fn wait_until<F>(&self, description: &str, check: F) -> Result<()>
    where
        F: Fn(&[String]) -> bool,
    {
        let deadline = tokio::time::Instant::now() + WAIT;
        while !check(&self.registry.identities().await) {
            if tokio::time::Instant::now() > deadline {
                return Err(anyhow!("timed out waiting until {description}"));
            }
            sleep(Duration::from_millis(10)).await;
        }
        Ok(())
    }
}

struct Participant {
    name: String,
    sender: ClientSender<OwnedWriteHalf>,
    events: mpsc::UnboundedReceiver<ClientEvent>,
}

impl Participant {
    async fn connect(addr: SocketAddr, name: &str) -> Result<Self> {
        let (sender, receiver) = ChatClient::connect(addr).await?.into_split();
        let (events_tx, events) = mpsc::unbounded_channel();
        tokio::spawn(receiver.receive_loop(move |event| {
            let _ = events_tx.send(event);
        }));
        Ok(Self {
            name: name.to_string(),
            sender,
            events,
        })
    }

    /// Connects and sends a first message so the relay registers the name.
    async fn join(relay: &TestRelay, name: &str) -> Result<Self> {
        let mut participant = Self::connect(relay.addr, name).await?;
        participant.say(&format!("{name} is here")).await?;
        relay
            .wait_until(&format!("{name} is registered"), |identities| {
                identities.iter().any(|id| id == name)
            })
            .await?;
        Ok(participant)
    }

    async fn say(&mut self, text: &str) -> Result<()> {
        self.sender.send_message(&self.name, text).await?;
        Ok(())
    }

    async fn next_event(&mut self) -> Result<ClientEvent> {
        timeout(WAIT, self.events.recv())
            .await?
            .ok_or_else(|| anyhow!("{} event stream ended", self.name))
    }

    async fn next_message(&mut self) -> Result<ChatMessage> {
        match self.next_event().await? {
            ClientEvent::Message(message) => Ok(message),
            other => Err(anyhow!("{} expected a message, got {other:?}", self.name)),
        }
    }

    async fn assert_quiet(&mut self) {
        if let Ok(Some(event)) = timeout(QUIET, self.events.recv()).await {
            panic!("{} should not have received {event:?}", self.name);
        }
    }
}

#[tokio::test]
async fn message_reaches_others_but_not_its_sender() -> Result<()> {
    let relay = TestRelay::start(RelayConfig::default()).await?;
    let mut bob = Participant::join(&relay, "B").await?;
    let mut alice = Participant::connect(relay.addr, "A").await?;

    alice.say("hi").await?;

    assert_eq!(bob.next_message().await?, ChatMessage::new("A", "hi"));
    alice.assert_quiet().await;

    relay.stop().await;
    Ok(())
}

#[tokio::test]
async fn broken_connection_leaves_the_registry() -> Result<()> {
    let relay = TestRelay::start(RelayConfig::default()).await?;
    let mut bob = Participant::join(&relay, "B").await?;

    let stream = TcpStream::connect(relay.addr).await?;
    let (_alice_reader, mut alice_writer) = stream.into_split();
    write_message(&mut alice_writer, &ChatMessage::new("A", "hello")).await?;
    assert_eq!(bob.next_message().await?, ChatMessage::new("A", "hello"));
    assert!(relay.registry.contains("A").await);

    alice_writer.write_all(b"\x00 not a message\n").await?;
    relay
        .wait_until("A is unregistered", |identities| {
            !identities.iter().any(|id| id == "A")
        })
        .await?;

    assert!(relay.registry.broadcast_targets("B").await.is_empty());
    bob.say("anyone?").await?;
    bob.assert_quiet().await;
    assert_eq!(relay.registry.identities().await, vec!["B".to_string()]);

    relay.stop().await;
    Ok(())
}

#[tokio::test]
async fn messages_from_one_sender_arrive_in_order() -> Result<()> {
    let relay = TestRelay::start(RelayConfig::default()).await?;
    let mut bob = Participant::join(&relay, "bob").await?;
    let mut alice = Participant::join(&relay, "alice").await?;
    assert_eq!(bob.next_message().await?.message, "alice is here");

    for n in 0..50 {
        alice.say(&format!("m{n}")).await?;
    }

    for n in 0..50 {
        assert_eq!(bob.next_message().await?.message, format!("m{n}"));
    }

    relay.stop().await;
    Ok(())
}

#[tokio::test]
async fn second_connection_takes_over_an_identity() -> Result<()> {
    let relay = TestRelay::start(RelayConfig::default()).await?;
    let mut bob = Participant::join(&relay, "bob").await?;
    let mut laptop = Participant::join(&relay, "alice").await?;
    assert_eq!(bob.next_message().await?.message, "alice is here");

    let laptop_session = relay.registry.session_of("alice").await;
    let mut phone = Participant::connect(relay.addr, "alice").await?;
    phone.say("switching devices").await?;
    assert_eq!(bob.next_message().await?.message, "switching devices");
    assert_ne!(relay.registry.session_of("alice").await, laptop_session);

    bob.say("welcome back").await?;
    assert_eq!(phone.next_message().await?, ChatMessage::new("bob", "welcome back"));

    // The displaced connection stays open: it no longer receives, but what it
    // sends is still relayed.
    laptop.assert_quiet().await;
    laptop.say("still on the laptop").await?;
    assert_eq!(
        bob.next_message().await?,
        ChatMessage::new("alice", "still on the laptop")
    );
    assert_ne!(relay.registry.session_of("alice").await, laptop_session);

    relay.stop().await;
    Ok(())
}

#[tokio::test]
async fn reject_policy_closes_the_duplicate() -> Result<()> {
    let config = RelayConfig {
        collision_policy: CollisionPolicy::Reject,
        ..RelayConfig::default()
    };
    let relay = TestRelay::start(config).await?;
    let mut bob = Participant::join(&relay, "bob").await?;
    let _alice = Participant::join(&relay, "alice").await?;
    assert_eq!(bob.next_message().await?.message, "alice is here");
    let alice_session = relay.registry.session_of("alice").await;

    let mut impostor = Participant::connect(relay.addr, "alice").await?;
    impostor.say("it's me").await?;

    assert!(matches!(impostor.next_event().await?, ClientEvent::Closed));
    bob.assert_quiet().await;
    assert_eq!(relay.registry.session_of("alice").await, alice_session);

    relay.stop().await;
    Ok(())
}
