/// The public API over every group on this device.
///
/// `Messenger` keeps one `GroupHandle` per loaded group and routes local
/// calls and inbound frames to the right actor. The group map is locked only
/// to look up, insert or remove handles; all group work happens inside the
/// actors.
use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};
use tokio::sync::{broadcast, mpsc};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::crdt::conversation::{ConversationEntry, MetadataValue};
use crate::crdt::ids::{DeviceID, GroupID, OpID};
use crate::crdt::membership::MemberEntry;
use crate::crdt::ops::{MemberInvitePayload, MetadataKey, OpEnvelope, OpType, Role};
use crate::crdt::store::{AppendResult, PendingInfo};
use crate::engine::actor::{GroupActor, GroupHandle};
use crate::engine::directory::PeerDirectory;
use crate::engine::group::{GroupEngine, LocalAction, OperationInfo};
use crate::engine::{EngineContext, EngineError, Effects, GroupEvent, Result};
use crate::query::{self, Query};
use crate::sync::dispatcher::{DispatchPolicy, Dispatcher, PeerAddress, Transport};
use crate::sync::frame::{Frame, FrameMessage};

pub struct Messenger {
    ctx: EngineContext,
    local: DeviceID,
    directory: Arc<dyn PeerDirectory>,
    dispatcher: Dispatcher,
    groups: Mutex<HashMap<GroupID, GroupHandle>>,
    shutdown: CancellationToken,
    dispatcher_task: Mutex<Option<JoinHandle<()>>>,
}

impl Messenger {
    /// Start the outbound dispatcher. Must be called inside a tokio runtime.
    pub fn new(ctx: EngineContext, transport: Arc<dyn Transport>, directory: Arc<dyn PeerDirectory>) -> Self {
        let shutdown = CancellationToken::new();
        let (dispatcher, task) = Dispatcher::spawn(transport, DispatchPolicy::from_config(&ctx.config), shutdown.clone());
        Messenger {
            local: ctx.local_device(),
            ctx,
            directory,
            dispatcher,
            groups: Mutex::new(HashMap::new()),
            shutdown,
            dispatcher_task: Mutex::new(Some(task)),
        }
    }

    pub fn local_device(&self) -> DeviceID {
        self.local
    }

    pub fn groups(&self) -> Vec<GroupID> {
        self.groups
            .lock()
            .map(|g| g.keys().copied().collect())
            .unwrap_or_default()
    }

    fn handle(&self, group: &GroupID) -> Result<GroupHandle> {
        let groups = self.groups.lock().map_err(|_| EngineError::Poisoned)?;
        match groups.get(group) {
            Some(handle) if !handle.is_closed() => Ok(handle.clone()),
            _ => Err(EngineError::UnknownGroup(*group)),
        }
    }

    fn start(&self, engine: GroupEngine, initial: Effects) -> Result<GroupHandle> {
        let group_id = engine.group_id();
        let mut groups = self.groups.lock().map_err(|_| EngineError::Poisoned)?;
        if groups.get(&group_id).is_some_and(|h| !h.is_closed()) {
            return Err(EngineError::GroupExists(group_id));
        }
        let (handle, _) = GroupActor::spawn(
            engine,
            initial,
            self.dispatcher.clone(),
            self.directory.clone(),
            &self.ctx.config,
            &self.shutdown,
        );
        groups.insert(group_id, handle.clone());
        Ok(handle)
    }

    // -----------------------------------------------------------------------
    // Lifecycle
    // -----------------------------------------------------------------------

    /// Create a group owned by this device.
    pub async fn create_group(&self, name: &str) -> Result<GroupID> {
        let (engine, effects) = GroupEngine::create(&self.ctx, Some(name))?;
        let group_id = engine.group_id();
        self.start(engine, effects)?;
        Ok(group_id)
    }

    /// Load a group from the op log.
    pub fn load_group(&self, group: GroupID) -> Result<()> {
        let mut engine = GroupEngine::open(&self.ctx, group)?;
        let resumed = engine.resume();
        self.start(engine, resumed)?;
        Ok(())
    }

    /// Load every group in the op log. Groups that fail to load are logged
    /// and skipped.
    pub fn load_all(&self) -> Result<usize> {
        let mut loaded = 0;
        for group in self.ctx.op_log.groups()? {
            match self.load_group(group) {
                Ok(()) => loaded += 1,
                Err(EngineError::GroupExists(_)) => {}
                Err(e) => log::error!("group {}: load failed: {}", group, e),
            }
        }
        Ok(loaded)
    }

    /// Stop the group's actor and its pending retries, then drop its ops,
    /// clock and secrets.
    pub fn delete_group(&self, group: &GroupID) -> Result<()> {
        let handle = self
            .groups
            .lock()
            .map_err(|_| EngineError::Poisoned)?
            .remove(group);
        if let Some(handle) = handle {
            handle.publish(GroupEvent::GroupDeleted);
            handle.cancel_token().cancel();
        }
        self.ctx.op_log.delete_group(group)?;
        self.ctx.clocks.delete_group(group)?;
        self.ctx.keys.delete_group(group)?;
        log::info!("group {}: deleted", group);
        Ok(())
    }

    pub fn subscribe(&self, group: &GroupID) -> Result<broadcast::Receiver<GroupEvent>> {
        Ok(self.handle(group)?.subscribe())
    }

    /// Stop every actor and the dispatcher.
    pub async fn shutdown(&self) {
        self.shutdown.cancel();
        let task = self.dispatcher_task.lock().ok().and_then(|mut t| t.take());
        if let Some(task) = task {
            if let Err(e) = task.await {
                log::warn!("dispatcher task ended abnormally: {}", e);
            }
        }
        if let Ok(mut groups) = self.groups.lock() {
            groups.clear();
        }
    }

    // -----------------------------------------------------------------------
    // Membership
    // -----------------------------------------------------------------------

    pub async fn invite_member(&self, group: &GroupID, pubkey: [u8; 32], role: Role) -> Result<OpID> {
        self.author(group, LocalAction::Invite { pubkey, role }).await
    }

    pub async fn accept_invite(&self, group: &GroupID, invite_op_id: OpID) -> Result<OpID> {
        self.author(group, LocalAction::Accept { invite_op_id }).await
    }

    pub async fn remove_member(&self, group: &GroupID, pubkey: &[u8; 32]) -> Result<OpID> {
        let device = DeviceID::from_pubkey(pubkey);
        self.author(group, LocalAction::Remove { device }).await
    }

    pub async fn leave_group(&self, group: &GroupID) -> Result<OpID> {
        self.author(group, LocalAction::Leave).await
    }

    pub async fn set_role(&self, group: &GroupID, pubkey: &[u8; 32], role: Role) -> Result<OpID> {
        let device = DeviceID::from_pubkey(pubkey);
        self.author(group, LocalAction::SetRole { device, role }).await
    }

    pub async fn mute_member(&self, group: &GroupID, pubkey: &[u8; 32], muted: bool) -> Result<OpID> {
        let device = DeviceID::from_pubkey(pubkey);
        self.author(group, LocalAction::Mute { device, muted }).await
    }

    pub async fn report_member(&self, group: &GroupID, pubkey: &[u8; 32], reason: &str) -> Result<OpID> {
        let device = DeviceID::from_pubkey(pubkey);
        let reason = reason.to_string();
        self.author(group, LocalAction::Report { device, reason }).await
    }

    pub async fn set_metadata(&self, group: &GroupID, key: MetadataKey, value: Vec<u8>) -> Result<OpID> {
        self.author(group, LocalAction::SetMetadata { key, value }).await
    }

    // -----------------------------------------------------------------------
    // Messages
    // -----------------------------------------------------------------------

    /// Returns the op id and the message id.
    pub async fn send_message(&self, group: &GroupID, plaintext: &str) -> Result<(OpID, [u8; 32])> {
        let text = plaintext.to_string();
        let authored = self.handle(group)?.author(LocalAction::SendMessage { text }).await?;
        let msg_id = authored
            .msg_id
            .ok_or_else(|| EngineError::Query("message id missing".into()))?;
        Ok((authored.op.op_id, msg_id))
    }

    pub async fn edit_message(&self, group: &GroupID, msg_id: [u8; 32], text: &str) -> Result<OpID> {
        let text = text.to_string();
        self.author(group, LocalAction::EditMessage { msg_id, text }).await
    }

    pub async fn delete_message(&self, group: &GroupID, msg_id: [u8; 32]) -> Result<OpID> {
        self.author(group, LocalAction::DeleteMessage { msg_id }).await
    }

    pub async fn react(&self, group: &GroupID, msg_id: [u8; 32], emoji: &str, present: bool) -> Result<OpID> {
        let emoji = emoji.to_string();
        self.author(group, LocalAction::React { msg_id, emoji, present })
            .await
    }

    async fn author(&self, group: &GroupID, action: LocalAction) -> Result<OpID> {
        Ok(self.handle(group)?.author(action).await?.op.op_id)
    }

    // -----------------------------------------------------------------------
    // Queries
    // -----------------------------------------------------------------------

    pub async fn query_members(&self, group: &GroupID) -> Result<Vec<MemberEntry>> {
        self.handle(group)?.read(|engine| engine.members()).await
    }

    pub async fn query_and_decrypt_messages(&self, group: &GroupID) -> Result<Vec<ConversationEntry>> {
        self.handle(group)?.read(|engine| engine.conversation()).await
    }

    pub async fn messages_after(&self, group: &GroupID, after_lamport: u64, limit: usize) -> Result<Vec<ConversationEntry>> {
        self.handle(group)?
            .read(move |engine| engine.messages_after(after_lamport, limit))
            .await
    }

    pub async fn query_metadata(&self, group: &GroupID) -> Result<BTreeMap<MetadataKey, MetadataValue>> {
        self.handle(group)?.read(|engine| engine.metadata()).await
    }

    pub async fn query_operation(&self, group: &GroupID, op_id: OpID) -> Result<Option<OperationInfo>> {
        self.handle(group)?
            .read(move |engine| engine.operation(&op_id))
            .await
    }

    pub async fn pending_dependencies(&self, group: &GroupID) -> Result<Vec<PendingInfo>> {
        self.handle(group)?
            .read(|engine| engine.pending_dependencies(Instant::now()))
            .await
    }

    /// JSON view, see [`crate::query`].
    pub async fn query_json(&self, group: &GroupID, query_type: &str, params_json: &str) -> Result<String> {
        let query = Query::parse(query_type, params_json).map_err(|e| EngineError::Query(e.to_string()))?;
        self.handle(group)?
            .read(move |engine| query::run(engine, &query).to_string())
            .await
    }

    // -----------------------------------------------------------------------
    // Inbound
    // -----------------------------------------------------------------------

    /// Ingest one encoded op envelope. An invite to this device for a group
    /// not loaded yet starts that group and syncs it from `from`.
    pub async fn ingest_remote_operation(&self, bytes: &[u8], from: Option<PeerAddress>) -> Result<AppendResult> {
        let op = OpEnvelope::from_bytes(bytes)?;
        let (handle, joined) = match self.handle(&op.group_id) {
            Ok(handle) => (handle, false),
            Err(EngineError::UnknownGroup(_)) => (self.join_invited(&op)?, true),
            Err(e) => return Err(e),
        };
        let result = handle.ingest(op, from.clone()).await?;
        if let (true, Some(peer)) = (joined, from) {
            handle.request_sync(Some(peer)).await?;
        }
        Ok(result)
    }

    /// Decode a frame from `peer` and hand it to its group.
    pub async fn handle_frame(&self, peer: PeerAddress, bytes: &[u8]) -> Result<()> {
        let frame = Frame::from_bytes(bytes)?;
        let group_id = frame.group_id();
        let (handle, joined) = match (self.handle(&group_id), &frame.message) {
            (Ok(handle), _) => (handle, false),
            (Err(EngineError::UnknownGroup(_)), FrameMessage::Operation(op)) => (self.join_invited(op)?, true),
            (Err(e), _) => return Err(e),
        };
        log::trace!("group {}: {} from {}", group_id, frame.message.kind(), peer);
        handle.frame(frame.message, peer.clone()).await?;
        if joined {
            handle.request_sync(Some(peer)).await?;
        }
        Ok(())
    }

    /// Start a group from an invite addressed to this device. Anything else
    /// for an unknown group is refused.
    fn join_invited(&self, op: &OpEnvelope) -> Result<GroupHandle> {
        let for_us = op.op_type == OpType::MemberInvite
            && op
                .decode_payload::<MemberInvitePayload>()
                .is_ok_and(|p| p.invited_device_id == self.local);
        if !for_us {
            return Err(EngineError::UnknownGroup(op.group_id));
        }
        log::info!("group {}: invited by {}, joining", op.group_id, op.author());
        let engine = GroupEngine::open(&self.ctx, op.group_id)?;
        match self.start(engine, Effects::default()) {
            Ok(handle) => Ok(handle),
            Err(EngineError::GroupExists(_)) => self.handle(&op.group_id),
            Err(e) => Err(e),
        }
    }

    /// Feed frames from the transport into the groups until the channel
    /// closes or the messenger shuts down.
    pub fn spawn_inbound(self: &Arc<Self>, mut inbound: mpsc::Receiver<(PeerAddress, Vec<u8>)>) -> JoinHandle<()> {
        let messenger = Arc::clone(self);
        tokio::spawn(async move {
            loop {
                let (peer, bytes) = tokio::select! {
                    _ = messenger.shutdown.cancelled() => break,
                    next = inbound.recv() => match next {
                        Some(next) => next,
                        None => break,
                    },
                };
                if let Err(e) = messenger.handle_frame(peer.clone(), &bytes).await {
                    log::debug!("inbound frame from {} dropped: {}", peer, e);
                }
            }
        })
    }

    // -----------------------------------------------------------------------
    // Sync
    // -----------------------------------------------------------------------

    pub async fn request_sync(&self, group: &GroupID, peer: PeerAddress) -> Result<()> {
        self.handle(group)?.request_sync(Some(peer)).await?;
        Ok(())
    }

    /// Returns the number of members asked.
    pub async fn request_sync_to_all_peers(&self, group: &GroupID) -> Result<usize> {
        self.handle(group)?.request_sync(None).await
    }

    /// Every `every`, tick each group and sync it with its members.
    pub fn spawn_periodic_sync(self: &Arc<Self>, every: Duration) -> JoinHandle<()> {
        let messenger = Arc::clone(self);
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(every);
            interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                tokio::select! {
                    _ = messenger.shutdown.cancelled() => break,
                    _ = interval.tick() => {}
                }
                for group in messenger.groups() {
                    let Ok(handle) = messenger.handle(&group) else { continue };
                    if handle.tick().await.is_err() {
                        continue;
                    }
                    if let Err(e) = handle.request_sync(None).await {
                        log::debug!("group {}: periodic sync failed: {}", group, e);
                    }
                }
            }
        })
    }
}

impl Drop for Messenger {
    fn drop(&mut self) {
        self.shutdown.cancel();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::EngineConfig;
    use crate::crdt::conversation::MessageBody;
    use crate::engine::directory::MemoryDirectory;
    use crate::engine::keystore::{KeyStore, MemoryKeyStore};
    use crate::persistence::{MemoryClockStore, MemoryOpLog};
    use crate::sync::dispatcher::TransportError;
    use async_trait::async_trait;

    type Inbox = mpsc::Sender<(PeerAddress, Vec<u8>)>;

    /// In-memory network: each address has an inbox. Frames are tagged with
    /// the sender's own address.
    #[derive(Default)]
    struct Network {
        inboxes: Mutex<HashMap<PeerAddress, Inbox>>,
    }

    struct Wire {
        network: Arc<Network>,
        me: PeerAddress,
    }

    #[async_trait]
    impl Transport for Wire {
        async fn send(&self, peer: &PeerAddress, frame: Vec<u8>) -> std::result::Result<(), TransportError> {
            let inbox = self.network.inboxes.lock().unwrap().get(peer).cloned();
            let inbox = inbox.ok_or_else(|| TransportError::Unreachable(peer.to_string()))?;
            inbox
                .send((self.me.clone(), frame))
                .await
                .map_err(|_| TransportError::Closed)
        }
    }

    struct Peer {
        messenger: Arc<Messenger>,
        pubkey: [u8; 32],
        op_log: Arc<MemoryOpLog>,
        _inbound: JoinHandle<()>,
    }

    fn config() -> EngineConfig {
        EngineConfig {
            peer_contact_spacing_ms: 0,
            retry_backoff_ms: 10,
            ..EngineConfig::default()
        }
    }

    fn peer(network: &Arc<Network>, directory: &Arc<MemoryDirectory>, name: &str) -> Peer {
        let keys = Arc::new(MemoryKeyStore::generate());
        let op_log = Arc::new(MemoryOpLog::new());
        let address = PeerAddress::new(format!("{}.onion", name));
        let ctx = EngineContext {
            keys: keys.clone(),
            op_log: op_log.clone(),
            clocks: Arc::new(MemoryClockStore::new()),
            config: config(),
        };
        let wire = Wire {
            network: network.clone(),
            me: address.clone(),
        };
        let messenger = Arc::new(Messenger::new(ctx, Arc::new(wire), directory.clone()));
        let (tx, rx) = mpsc::channel(256);
        network.inboxes.lock().unwrap().insert(address.clone(), tx);
        directory.insert(keys.signing_public_key(), address);
        let inbound = messenger.spawn_inbound(rx);
        Peer {
            messenger,
            pubkey: keys.signing_public_key(),
            op_log,
            _inbound: inbound,
        }
    }

    macro_rules! eventually {
        ($cond:expr) => {{
            let mut reached = false;
            for _ in 0..500 {
                if $cond {
                    reached = true;
                    break;
                }
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
            assert!(reached, "condition not reached: {}", stringify!($cond));
        }};
    }

    async fn texts(peer: &Peer, group: &GroupID) -> Vec<MessageBody> {
        peer.messenger
            .query_and_decrypt_messages(group)
            .await
            .map(|entries| {
                entries
                    .into_iter()
                    .filter_map(|e| match e.kind {
                        crate::crdt::conversation::EntryKind::Message { body, .. } => Some(body),
                        _ => None,
                    })
                    .collect()
            })
            .unwrap_or_default()
    }

    #[tokio::test]
    async fn test_end_to_end_over_transport() {
        let network = Arc::new(Network::default());
        let directory = Arc::new(MemoryDirectory::new());
        let owner = peer(&network, &directory, "owner");
        let alice = peer(&network, &directory, "alice");

        let group = owner.messenger.create_group("Weekend").await.unwrap();
        let invite = owner
            .messenger
            .invite_member(&group, alice.pubkey, Role::Member)
            .await
            .unwrap();

        // the invite starts the group on alice's side and she syncs the rest
        eventually!(alice.messenger.groups().contains(&group));
        let mut events = alice.messenger.subscribe(&group).unwrap();
        eventually!(alice.op_log.op_count(&group) >= 3);
        alice.messenger.accept_invite(&group, invite).await.unwrap();

        // secret delivery is asynchronous; sending waits for it
        let mut installed = false;
        for _ in 0..500 {
            match events.try_recv() {
                Ok(GroupEvent::SecretInstalled { .. }) => {
                    installed = true;
                    break;
                }
                Ok(_) => continue,
                Err(_) => tokio::time::sleep(Duration::from_millis(10)).await,
            }
        }
        assert!(installed);

        alice.messenger.send_message(&group, "hello owner").await.unwrap();
        owner.messenger.send_message(&group, "hello alice").await.unwrap();

        eventually!(texts(&owner, &group).await.len() == 2);
        eventually!(texts(&alice, &group).await.len() == 2);
        let from_owner = texts(&owner, &group).await;
        assert_eq!(texts(&alice, &group).await, from_owner);
        assert!(from_owner.contains(&MessageBody::Text("hello owner".into())));
        assert!(from_owner.contains(&MessageBody::Text("hello alice".into())));

        let members = alice.messenger.query_members(&group).await.unwrap();
        assert_eq!(members.iter().filter(|m| m.is_active()).count(), 2);

        let hash = owner.messenger.query_json(&group, "state_hash", "").await.unwrap();
        eventually!(alice.messenger.query_json(&group, "state_hash", "").await.unwrap() == hash);
    }

    #[tokio::test]
    async fn test_unknown_group_refused() {
        let network = Arc::new(Network::default());
        let directory = Arc::new(MemoryDirectory::new());
        let owner = peer(&network, &directory, "owner");
        let stranger = peer(&network, &directory, "stranger");

        let group = owner.messenger.create_group("Private").await.unwrap();
        let (op_id, _) = owner.messenger.send_message(&group, "secret").await.unwrap();
        let op = owner
            .messenger
            .query_operation(&group, op_id)
            .await
            .unwrap()
            .unwrap()
            .op;

        let err = stranger
            .messenger
            .ingest_remote_operation(&op.to_bytes().unwrap(), None)
            .await;
        assert!(matches!(err, Err(EngineError::UnknownGroup(g)) if g == group));
        assert!(stranger.messenger.groups().is_empty());
    }

    #[tokio::test]
    async fn test_delete_group_drops_everything() {
        let network = Arc::new(Network::default());
        let directory = Arc::new(MemoryDirectory::new());
        let owner = peer(&network, &directory, "owner");

        let group = owner.messenger.create_group("Temp").await.unwrap();
        let mut events = owner.messenger.subscribe(&group).unwrap();
        owner.messenger.delete_group(&group).unwrap();

        assert_eq!(owner.op_log.op_count(&group), 0);
        assert!(matches!(
            owner.messenger.send_message(&group, "x").await,
            Err(EngineError::UnknownGroup(_))
        ));
        let mut deleted = false;
        while let Ok(event) = events.try_recv() {
            deleted |= event == GroupEvent::GroupDeleted;
        }
        assert!(deleted);
    }

    #[tokio::test]
    async fn test_reload_from_op_log() {
        let network = Arc::new(Network::default());
        let directory = Arc::new(MemoryDirectory::new());
        let owner = peer(&network, &directory, "owner");

        let group = owner.messenger.create_group("Durable").await.unwrap();
        owner.messenger.send_message(&group, "kept").await.unwrap();
        let before = owner.messenger.query_json(&group, "state_hash", "").await.unwrap();

        let handle = owner.messenger.handle(&group).unwrap();
        handle.shutdown().await.unwrap();
        eventually!(handle.is_closed());

        assert!(matches!(owner.messenger.load_group(group), Ok(())));
        let after = owner.messenger.query_json(&group, "state_hash", "").await.unwrap();
        assert_eq!(before, after);
        assert!(matches!(owner.messenger.load_group(group), Err(EngineError::GroupExists(_))));
    }
}
