/// One task per group.
///
/// The actor owns the group's `GroupEngine`. Callers talk to it through a
/// `GroupHandle`: commands go in on a bounded mpsc queue, answers come back
/// on oneshot channels, events go out on a broadcast channel. Outbound
/// frames are resolved to peer addresses and handed to the dispatcher.
use std::fmt;
use std::sync::Arc;
use std::time::Instant;
use tokio::sync::{broadcast, mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::config::EngineConfig;
use crate::crdt::ids::GroupID;
use crate::crdt::ops::OpEnvelope;
use crate::crdt::store::AppendResult;
use crate::engine::directory::PeerDirectory;
use crate::engine::group::{Authored, GroupEngine, LocalAction};
use crate::engine::{EngineError, Effects, GroupEvent, Outbound, Recipient, Result};
use crate::sync::dispatcher::{Dispatcher, PeerAddress};
use crate::sync::frame::FrameMessage;

type Reply<T> = oneshot::Sender<Result<T>>;

pub enum GroupCommand {
    Author {
        action: LocalAction,
        reply: Reply<Authored>,
    },
    Ingest {
        op: OpEnvelope,
        from: Option<PeerAddress>,
        reply: Reply<AppendResult>,
    },
    /// A decoded inbound frame. Errors are logged, not returned.
    Frame {
        message: FrameMessage,
        from: PeerAddress,
    },
    /// Sync with one peer, or with every active member when `peer` is None.
    /// Replies with the number of requests queued.
    RequestSync {
        peer: Option<PeerAddress>,
        reply: Reply<usize>,
    },
    Read(Box<dyn FnOnce(&GroupEngine) + Send>),
    Tick,
    Shutdown,
}

impl fmt::Debug for GroupCommand {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            GroupCommand::Author { .. } => "Author",
            GroupCommand::Ingest { .. } => "Ingest",
            GroupCommand::Frame { .. } => "Frame",
            GroupCommand::RequestSync { .. } => "RequestSync",
            GroupCommand::Read(_) => "Read",
            GroupCommand::Tick => "Tick",
            GroupCommand::Shutdown => "Shutdown",
        };
        f.write_str(name)
    }
}

// ---------------------------------------------------------------------------
// Handle
// ---------------------------------------------------------------------------

#[derive(Clone)]
pub struct GroupHandle {
    group_id: GroupID,
    tx: mpsc::Sender<GroupCommand>,
    events: broadcast::Sender<GroupEvent>,
    cancel: CancellationToken,
}

impl GroupHandle {
    pub fn group_id(&self) -> GroupID {
        self.group_id
    }

    pub fn subscribe(&self) -> broadcast::Receiver<GroupEvent> {
        self.events.subscribe()
    }

    pub fn cancel_token(&self) -> &CancellationToken {
        &self.cancel
    }

    pub fn is_closed(&self) -> bool {
        self.cancel.is_cancelled() || self.tx.is_closed()
    }

    /// Publish an event outside the actor (used for deletion).
    pub(crate) fn publish(&self, event: GroupEvent) {
        let _ = self.events.send(event);
    }

    async fn send(&self, command: GroupCommand) -> Result<()> {
        self.tx
            .send(command)
            .await
            .map_err(|_| EngineError::ActorGone)
    }

    async fn call<T>(&self, make: impl FnOnce(Reply<T>) -> GroupCommand) -> Result<T> {
        let (reply, rx) = oneshot::channel();
        self.send(make(reply)).await?;
        rx.await.map_err(|_| EngineError::ActorGone)?
    }

    pub async fn author(&self, action: LocalAction) -> Result<Authored> {
        self.call(|reply| GroupCommand::Author { action, reply }).await
    }

    pub async fn ingest(&self, op: OpEnvelope, from: Option<PeerAddress>) -> Result<AppendResult> {
        self.call(|reply| GroupCommand::Ingest { op, from, reply }).await
    }

    pub async fn frame(&self, message: FrameMessage, from: PeerAddress) -> Result<()> {
        self.send(GroupCommand::Frame { message, from }).await
    }

    pub async fn request_sync(&self, peer: Option<PeerAddress>) -> Result<usize> {
        self.call(|reply| GroupCommand::RequestSync { peer, reply }).await
    }

    /// Run `f` against the engine inside the actor.
    pub async fn read<R, F>(&self, f: F) -> Result<R>
    where
        R: Send + 'static,
        F: FnOnce(&GroupEngine) -> R + Send + 'static,
    {
        let (tx, rx) = oneshot::channel();
        self.send(GroupCommand::Read(Box::new(move |engine| {
            let _ = tx.send(f(engine));
        })))
        .await?;
        rx.await.map_err(|_| EngineError::ActorGone)
    }

    pub async fn tick(&self) -> Result<()> {
        self.send(GroupCommand::Tick).await
    }

    pub async fn shutdown(&self) -> Result<()> {
        self.send(GroupCommand::Shutdown).await
    }
}

impl fmt::Debug for GroupHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("GroupHandle")
            .field("group_id", &self.group_id)
            .field("closed", &self.is_closed())
            .finish()
    }
}

// ---------------------------------------------------------------------------
// Actor
// ---------------------------------------------------------------------------

pub struct GroupActor {
    engine: GroupEngine,
    rx: mpsc::Receiver<GroupCommand>,
    events: broadcast::Sender<GroupEvent>,
    cancel: CancellationToken,
    dispatcher: Dispatcher,
    directory: Arc<dyn PeerDirectory>,
}

impl GroupActor {
    /// Start the actor task. `initial` holds effects produced while the
    /// engine was built (a group creation, say); they are flushed first.
    /// The actor stops when `parent` is cancelled.
    pub fn spawn(
        engine: GroupEngine,
        initial: Effects,
        dispatcher: Dispatcher,
        directory: Arc<dyn PeerDirectory>,
        config: &EngineConfig,
        parent: &CancellationToken,
    ) -> (GroupHandle, JoinHandle<()>) {
        let (tx, rx) = mpsc::channel(config.command_queue_depth.max(1));
        let (events, _) = broadcast::channel(config.event_queue_depth.max(1));
        let cancel = parent.child_token();
        let handle = GroupHandle {
            group_id: engine.group_id(),
            tx,
            events: events.clone(),
            cancel: cancel.clone(),
        };
        let actor = GroupActor {
            engine,
            rx,
            events,
            cancel,
            dispatcher,
            directory,
        };
        let task = tokio::spawn(actor.run(initial));
        (handle, task)
    }

    async fn run(mut self, initial: Effects) {
        let group_id = self.engine.group_id();
        log::debug!("group {}: actor started", group_id);
        self.flush(initial);

        loop {
            let command = tokio::select! {
                _ = self.cancel.cancelled() => break,
                command = self.rx.recv() => match command {
                    Some(command) => command,
                    None => break,
                },
            };
            if let GroupCommand::Shutdown = command {
                break;
            }
            self.handle(command);
        }
        log::debug!("group {}: actor stopped", group_id);
    }

    fn handle(&mut self, command: GroupCommand) {
        match command {
            GroupCommand::Author { action, reply } => {
                let op_type = action.op_type();
                let result = match self.engine.author(action) {
                    Ok((authored, effects)) => {
                        self.flush(effects);
                        Ok(authored)
                    }
                    Err(EngineError::SecretUnavailable(secret_id)) => {
                        self.chase_secret();
                        Err(EngineError::SecretUnavailable(secret_id))
                    }
                    Err(e) => {
                        log::debug!("group {}: {} refused: {}", self.engine.group_id(), op_type.as_str(), e);
                        Err(e)
                    }
                };
                let _ = reply.send(result);
            }
            GroupCommand::Ingest { op, from, reply } => {
                let result = self.engine.ingest(op, from.as_ref()).map(|(result, effects)| {
                    self.flush(effects);
                    result
                });
                let _ = reply.send(result);
            }
            GroupCommand::Frame { message, from } => {
                let kind = message.kind();
                match self.engine.handle_frame(message, &from) {
                    Ok(effects) => self.flush(effects),
                    Err(e) => log::warn!(
                        "group {}: {} from {} dropped: {}",
                        self.engine.group_id(),
                        kind,
                        from,
                        e
                    ),
                }
            }
            GroupCommand::RequestSync { peer, reply } => {
                let result = match peer {
                    Some(peer) => self
                        .engine
                        .sync_request(Recipient::Peer(peer))
                        .map(|out| Effects {
                            outbound: vec![out],
                            events: Vec::new(),
                        }),
                    None => self.engine.sync_all(),
                }
                .map(|effects| {
                    let queued = effects.outbound.len();
                    self.flush(effects);
                    queued
                });
                let _ = reply.send(result);
            }
            GroupCommand::Read(f) => f(&self.engine),
            GroupCommand::Tick => match self.engine.tick(Instant::now()) {
                Ok(effects) => self.flush(effects),
                Err(e) => log::warn!("group {}: tick failed: {}", self.engine.group_id(), e),
            },
            GroupCommand::Shutdown => {}
        }
    }

    fn chase_secret(&mut self) {
        match self.engine.chase_secret(Instant::now()) {
            Ok(effects) => self.flush(effects),
            Err(e) => log::warn!("group {}: secret request failed: {}", self.engine.group_id(), e),
        }
    }

    fn flush(&self, effects: Effects) {
        for event in effects.events {
            // no subscribers is fine
            let _ = self.events.send(event);
        }
        for out in effects.outbound {
            self.deliver(out);
        }
    }

    fn deliver(&self, out: Outbound) {
        let group_id = self.engine.group_id();
        let address = match out.to {
            Recipient::Device(pubkey) => match self.directory.address_for(&pubkey) {
                Some(address) => address,
                None => {
                    log::debug!("group {}: no address for {}", group_id, hex::encode(pubkey));
                    return;
                }
            },
            Recipient::Reply { pubkey, source } => self.directory.address_for(&pubkey).unwrap_or(source),
            Recipient::Peer(address) => address,
        };
        let bytes = match out.frame.to_bytes() {
            Ok(bytes) => bytes,
            Err(e) => {
                log::error!("group {}: frame encode failed: {}", group_id, e);
                return;
            }
        };
        if !self
            .dispatcher
            .enqueue(group_id, address, bytes, self.cancel.clone())
        {
            log::warn!("group {}: dispatcher gone, frame dropped", group_id);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crdt::ops::Role;
    use crate::engine::directory::MemoryDirectory;
    use crate::engine::keystore::{KeyStore, MemoryKeyStore};
    use crate::engine::EngineContext;
    use crate::persistence::{MemoryClockStore, MemoryOpLog};
    use crate::sync::dispatcher::{DispatchPolicy, Transport, TransportError};
    use crate::sync::frame::Frame;
    use async_trait::async_trait;
    use std::time::Duration;

    struct ChannelTransport(mpsc::UnboundedSender<(PeerAddress, Vec<u8>)>);

    #[async_trait]
    impl Transport for ChannelTransport {
        async fn send(&self, peer: &PeerAddress, frame: Vec<u8>) -> std::result::Result<(), TransportError> {
            self.0
                .send((peer.clone(), frame))
                .map_err(|_| TransportError::Closed)
        }
    }

    fn context() -> EngineContext {
        EngineContext {
            keys: Arc::new(MemoryKeyStore::generate()),
            op_log: Arc::new(MemoryOpLog::new()),
            clocks: Arc::new(MemoryClockStore::new()),
            config: EngineConfig {
                peer_contact_spacing_ms: 0,
                ..EngineConfig::default()
            },
        }
    }

    async fn spawn_actor(
        directory: Arc<MemoryDirectory>,
    ) -> (
        GroupHandle,
        mpsc::UnboundedReceiver<(PeerAddress, Vec<u8>)>,
        CancellationToken,
    ) {
        let ctx = context();
        let (tx, wire) = mpsc::unbounded_channel();
        let shutdown = CancellationToken::new();
        let (dispatcher, _) = Dispatcher::spawn(
            Arc::new(ChannelTransport(tx)),
            DispatchPolicy::from_config(&ctx.config),
            shutdown.clone(),
        );
        let (engine, effects) = GroupEngine::create(&ctx, Some("Actors")).unwrap();
        let (handle, _) = GroupActor::spawn(engine, effects, dispatcher, directory, &ctx.config, &shutdown);
        (handle, wire, shutdown)
    }

    #[tokio::test]
    async fn test_author_and_read() {
        let (handle, _wire, _shutdown) = spawn_actor(Arc::new(MemoryDirectory::new())).await;
        let mut events = handle.subscribe();

        let sent = handle
            .author(LocalAction::SendMessage { text: "hello".into() })
            .await
            .unwrap();
        assert!(sent.msg_id.is_some());

        let texts = handle
            .read(|engine| {
                engine
                    .conversation()
                    .iter()
                    .filter_map(|e| e.text().map(str::to_owned))
                    .collect::<Vec<_>>()
            })
            .await
            .unwrap();
        assert_eq!(texts, vec!["hello".to_string()]);

        let mut saw_message = false;
        while let Ok(event) = events.try_recv() {
            saw_message |= matches!(event, GroupEvent::MessageReceived { .. });
        }
        assert!(saw_message);
    }

    #[tokio::test]
    async fn test_invite_goes_out_on_the_wire() {
        let directory = Arc::new(MemoryDirectory::new());
        let invitee = MemoryKeyStore::generate();
        directory.insert(invitee.signing_public_key(), PeerAddress::new("invitee.onion"));
        let (handle, mut wire, _shutdown) = spawn_actor(directory).await;

        let invite = handle
            .author(LocalAction::Invite {
                pubkey: invitee.signing_public_key(),
                role: Role::Member,
            })
            .await
            .unwrap();

        let (peer, bytes) = tokio::time::timeout(Duration::from_secs(5), wire.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(peer, PeerAddress::new("invitee.onion"));
        let frame = Frame::from_bytes(&bytes).unwrap();
        assert_eq!(frame.message, FrameMessage::Operation(invite.op));
    }

    #[tokio::test]
    async fn test_cancel_stops_actor() {
        let (handle, _wire, shutdown) = spawn_actor(Arc::new(MemoryDirectory::new())).await;
        shutdown.cancel();
        assert!(handle.is_closed());
        // the actor may still drain a queued command, but never answers after exit
        tokio::time::sleep(Duration::from_millis(10)).await;
        let result = handle.author(LocalAction::SendMessage { text: "x".into() }).await;
        assert!(matches!(result, Err(EngineError::ActorGone)));
    }
}
