//! Per-exchange streaming client.
//!
//! All mutable session state (transport, subscription registry, data models)
//! lives in one spawned session task. Public methods only post commands to it
//! and await the reply, so callers on any task never touch the registry.

use std::{
    collections::HashMap,
    ops::ControlFlow,
    path::Path,
    sync::{
        atomic::{AtomicU64, Ordering},
        Arc,
    },
    time::Instant,
};

use chrono::Utc;
use serde_json::Value;
use tokio::{
    sync::{mpsc, oneshot, watch, Mutex},
    task::JoinHandle,
    time::timeout,
};

use crate::{
    config::ClientConfig,
    credentials::Credentials,
    errors::StreamError,
    exchanges::{
        binance::{rest::BinanceRestSnapshots, BinanceProtocol},
        bitfinex::BitfinexProtocol,
        traits::{ExchangeProtocol, Inbound, SnapshotMode, SnapshotSource},
    },
    model::DataModel,
    models::{
        Callback, Channel, ConnectionState, InfoEvent, InfoHandler, MarketUpdate, Snapshot,
        StreamHandle, StreamId, SubscriberId, SubscriptionKey, UserChannel,
    },
    registry::{Removal, SubscriptionRegistry, SubscriptionState, Waiter},
    transport::{Connector, Transport, WsConnector},
};

#[derive(Clone)]
pub struct ExchangeStreamClient {
    inner: Arc<ClientInner>,
}

struct ClientInner {
    protocol: Arc<dyn ExchangeProtocol>,
    snapshots: Option<Arc<dyn SnapshotSource>>,
    connector: Arc<dyn Connector>,
    config: ClientConfig,
    state: Arc<watch::Sender<ConnectionState>>,
    session: Mutex<Option<SessionHandle>>,
    next_subscriber: AtomicU64,
}

struct SessionHandle {
    commands: mpsc::UnboundedSender<Command>,
    task: JoinHandle<()>,
}

enum Command {
    Subscribe {
        key: SubscriptionKey,
        subscriber: SubscriberId,
        callback: Callback,
        reply: oneshot::Sender<Result<Snapshot, StreamError>>,
    },
    Unsubscribe {
        key: SubscriptionKey,
        subscriber: SubscriberId,
        reply: Option<oneshot::Sender<()>>,
    },
    Authenticate {
        credentials: Credentials,
        reply: oneshot::Sender<Result<(), StreamError>>,
    },
    SnapshotReady {
        key: SubscriptionKey,
        request_id: u64,
        result: Result<MarketUpdate, StreamError>,
    },
    Shutdown,
}

impl ExchangeStreamClient {
    pub fn new(
        protocol: Arc<dyn ExchangeProtocol>,
        snapshots: Option<Arc<dyn SnapshotSource>>,
        connector: Arc<dyn Connector>,
        config: ClientConfig,
    ) -> Self {
        let (state, _) = watch::channel(ConnectionState::Disconnected);
        Self {
            inner: Arc::new(ClientInner {
                protocol,
                snapshots,
                connector,
                config,
                state: Arc::new(state),
                session: Mutex::new(None),
                next_subscriber: AtomicU64::new(1),
            }),
        }
    }

    pub fn bitfinex(config: ClientConfig) -> Self {
        let protocol = Arc::new(BitfinexProtocol::new(config.bitfinex_ws_url.clone()));
        Self::new(protocol, None, Arc::new(WsConnector), config)
    }

    pub fn binance(config: ClientConfig) -> Result<Self, StreamError> {
        let protocol = Arc::new(BinanceProtocol::new(config.binance_ws_url.clone()));
        let snapshots = Arc::new(BinanceRestSnapshots::new(&config)?);
        Ok(Self::new(
            protocol,
            Some(snapshots),
            Arc::new(WsConnector),
            config,
        ))
    }

    /// Sender tag stamped on every event this client fans out.
    pub fn name(&self) -> &'static str {
        self.inner.protocol.name()
    }

    pub fn config(&self) -> &ClientConfig {
        &self.inner.config
    }

    pub fn state(&self) -> ConnectionState {
        *self.inner.state.borrow()
    }

    pub fn state_changes(&self) -> watch::Receiver<ConnectionState> {
        self.inner.state.subscribe()
    }

    /// Opens the transport and starts the session task. Returns once the
    /// exchange handshake has been seen, or `ConnectionTimeout`.
    pub async fn connect(&self, info_handler: InfoHandler) -> Result<(), StreamError> {
        let inner = &self.inner;
        let mut session = inner.session.lock().await;
        if let Some(handle) = session.as_ref() {
            if !handle.commands.is_closed() {
                return Ok(());
            }
        }
        if let Some(stale) = session.take() {
            let _ = stale.task.await;
        }

        let exchange = inner.protocol.name();
        let connect_timeout = inner.config.connect_timeout;
        let started = Instant::now();
        inner.state.send_replace(ConnectionState::Connecting);
        tracing::info!(exchange, ws_endpoint = %inner.protocol.ws_url(), "connecting");

        let transport =
            match timeout(connect_timeout, inner.connector.connect(inner.protocol.ws_url())).await {
                Ok(Ok(transport)) => transport,
                Ok(Err(err)) => {
                    inner.state.send_replace(ConnectionState::Disconnected);
                    return Err(err);
                }
                Err(_) => {
                    inner.state.send_replace(ConnectionState::Disconnected);
                    return Err(StreamError::ConnectionTimeout(connect_timeout));
                }
            };

        let (commands, receiver) = mpsc::unbounded_channel();
        let (ready_sender, ready) = oneshot::channel();
        let handshake = if inner.protocol.requires_handshake() {
            Some(ready_sender)
        } else {
            inner.state.send_replace(ConnectionState::Connected);
            let _ = ready_sender.send(());
            None
        };

        let task = tokio::spawn(
            Session {
                protocol: inner.protocol.clone(),
                snapshots: inner.snapshots.clone(),
                config: inner.config.clone(),
                transport,
                registry: SubscriptionRegistry::new(),
                info_handler,
                state: inner.state.clone(),
                commands: commands.downgrade(),
                handshake,
                pending_auth: None,
                account_rows: HashMap::new(),
                next_request_id: 1,
            }
            .run(receiver),
        );

        let remaining = connect_timeout.saturating_sub(started.elapsed());
        match timeout(remaining, ready).await {
            Ok(Ok(())) => {}
            Ok(Err(_)) => {
                let _ = task.await;
                inner.state.send_replace(ConnectionState::Disconnected);
                return Err(StreamError::Transport(
                    "connection closed before handshake".to_string(),
                ));
            }
            Err(_) => {
                let _ = commands.send(Command::Shutdown);
                let _ = task.await;
                inner.state.send_replace(ConnectionState::Disconnected);
                return Err(StreamError::ConnectionTimeout(connect_timeout));
            }
        }

        tracing::info!(exchange, "connected");
        *session = Some(SessionHandle { commands, task });
        Ok(())
    }

    /// Closes the transport and clears every subscription. Safe to call when
    /// already disconnected.
    pub async fn disconnect(&self) {
        let Some(handle) = self.inner.session.lock().await.take() else {
            return;
        };

        let _ = handle.commands.send(Command::Shutdown);
        if let Err(err) = handle.task.await {
            tracing::warn!(exchange = self.name(), error = %err, "session task ended abnormally");
        }
        self.inner.state.send_replace(ConnectionState::Disconnected);
    }

    pub async fn subscribe_ticker(
        &self,
        symbol: &str,
        callback: Callback,
    ) -> Result<(StreamHandle, Snapshot), StreamError> {
        self.subscribe(SubscriptionKey::new(symbol, Channel::Ticker), callback)
            .await
    }

    /// `depth` defaults to `ClientConfig::book_depth`.
    pub async fn subscribe_order_book(
        &self,
        symbol: &str,
        depth: Option<u32>,
        callback: Callback,
    ) -> Result<(StreamHandle, Snapshot), StreamError> {
        let depth = depth.unwrap_or(self.inner.config.book_depth);
        self.subscribe(SubscriptionKey::new(symbol, Channel::Book { depth }), callback)
            .await
    }

    pub async fn subscribe_trades(
        &self,
        symbol: &str,
        callback: Callback,
    ) -> Result<(StreamHandle, Snapshot), StreamError> {
        self.subscribe(SubscriptionKey::new(symbol, Channel::Trades), callback)
            .await
    }

    pub async fn subscribe_candles(
        &self,
        symbol: &str,
        timeframe: &str,
        callback: Callback,
    ) -> Result<(StreamHandle, Snapshot), StreamError> {
        let channel = Channel::Candles {
            timeframe: timeframe.to_string(),
        };
        self.subscribe(SubscriptionKey::new(symbol, channel), callback)
            .await
    }

    pub async fn subscribe_user(
        &self,
        channel: UserChannel,
        callback: Callback,
    ) -> Result<(StreamHandle, Snapshot), StreamError> {
        self.subscribe(SubscriptionKey::user(channel), callback).await
    }

    /// Registers `callback` for `key`. A new physical stream is opened only
    /// when no other caller already follows the same key; otherwise the
    /// current snapshot is returned straight away.
    pub async fn subscribe(
        &self,
        key: SubscriptionKey,
        callback: Callback,
    ) -> Result<(StreamHandle, Snapshot), StreamError> {
        let key = self.inner.protocol.canonical_key(key)?;
        let commands = self.commands().await?;
        let subscriber = SubscriberId(self.inner.next_subscriber.fetch_add(1, Ordering::Relaxed));
        let (reply, response) = oneshot::channel();

        commands
            .send(Command::Subscribe {
                key: key.clone(),
                subscriber,
                callback,
                reply,
            })
            .map_err(|_| StreamError::NotConnected)?;

        let subscribe_timeout = self.inner.config.subscribe_timeout;
        match timeout(subscribe_timeout, response).await {
            Ok(Ok(Ok(snapshot))) => Ok((StreamHandle { key, subscriber }, snapshot)),
            Ok(Ok(Err(err))) => Err(err),
            Ok(Err(_)) => Err(StreamError::NotConnected),
            Err(_) => {
                tracing::warn!(exchange = self.name(), key = %key, "no initial snapshot in time, withdrawing");
                let _ = commands.send(Command::Unsubscribe {
                    key,
                    subscriber,
                    reply: None,
                });
                Err(StreamError::SubscribeTimeout(subscribe_timeout))
            }
        }
    }

    /// Removes the callback registered under `handle`. The physical stream is
    /// released with its last callback.
    pub async fn unsubscribe(&self, handle: &StreamHandle) {
        let Ok(commands) = self.commands().await else {
            return;
        };
        let (reply, done) = oneshot::channel();
        let sent = commands.send(Command::Unsubscribe {
            key: handle.key.clone(),
            subscriber: handle.subscriber,
            reply: Some(reply),
        });
        if sent.is_ok() {
            let _ = done.await;
        }
    }

    /// Sends the signed auth payload and waits for the exchange verdict.
    pub async fn authenticate(&self, credentials: Credentials) -> Result<(), StreamError> {
        let commands = self
            .commands()
            .await
            .map_err(|_| StreamError::Authentication("no open transport".to_string()))?;
        let (reply, response) = oneshot::channel();
        commands
            .send(Command::Authenticate { credentials, reply })
            .map_err(|_| StreamError::Authentication("no open transport".to_string()))?;

        let auth_timeout = self.inner.config.auth_timeout;
        match timeout(auth_timeout, response).await {
            Ok(Ok(result)) => result,
            Ok(Err(_)) => Err(StreamError::Authentication(
                "connection closed during authentication".to_string(),
            )),
            Err(_) => Err(StreamError::Authentication(format!(
                "no response within {auth_timeout:?}"
            ))),
        }
    }

    pub async fn authenticate_with_key_file(&self, path: impl AsRef<Path>) -> Result<(), StreamError> {
        self.authenticate(Credentials::from_key_file(path)?).await
    }

    async fn commands(&self) -> Result<mpsc::UnboundedSender<Command>, StreamError> {
        self.inner
            .session
            .lock()
            .await
            .as_ref()
            .map(|handle| handle.commands.clone())
            .filter(|commands| !commands.is_closed())
            .ok_or(StreamError::NotConnected)
    }
}

/// Single writer for everything behind one connection.
struct Session {
    protocol: Arc<dyn ExchangeProtocol>,
    snapshots: Option<Arc<dyn SnapshotSource>>,
    config: ClientConfig,
    transport: Box<dyn Transport>,
    registry: SubscriptionRegistry,
    info_handler: InfoHandler,
    state: Arc<watch::Sender<ConnectionState>>,
    commands: mpsc::WeakUnboundedSender<Command>,
    handshake: Option<oneshot::Sender<()>>,
    pending_auth: Option<oneshot::Sender<Result<(), StreamError>>>,
    account_rows: HashMap<UserChannel, Vec<Value>>,
    next_request_id: u64,
}

impl Session {
    async fn run(mut self, mut commands: mpsc::UnboundedReceiver<Command>) {
        loop {
            tokio::select! {
                command = commands.recv() => {
                    let Some(command) = command else {
                        self.shutdown().await;
                        return;
                    };
                    if self.handle_command(command).await.is_break() {
                        return;
                    }
                }
                frame = self.transport.next_frame() => {
                    match frame {
                        Ok(Some(text)) => self.handle_frame(&text).await,
                        Ok(None) => {
                            self.connection_lost("connection closed by peer".to_string());
                            return;
                        }
                        Err(err) => {
                            self.connection_lost(err.to_string());
                            return;
                        }
                    }
                }
            }
        }
    }

    fn exchange(&self) -> &'static str {
        self.protocol.name()
    }

    fn next_request_id(&mut self) -> u64 {
        let request_id = self.next_request_id;
        self.next_request_id += 1;
        request_id
    }

    async fn handle_command(&mut self, command: Command) -> ControlFlow<()> {
        match command {
            Command::Subscribe {
                key,
                subscriber,
                callback,
                reply,
            } => self.subscribe(key, subscriber, callback, reply).await,
            Command::Unsubscribe {
                key,
                subscriber,
                reply,
            } => {
                self.unsubscribe(&key, subscriber).await;
                if let Some(reply) = reply {
                    let _ = reply.send(());
                }
            }
            Command::Authenticate { credentials, reply } => {
                self.authenticate(credentials, reply).await;
            }
            Command::SnapshotReady {
                key,
                request_id,
                result,
            } => self.finish_snapshot(key, request_id, result).await,
            Command::Shutdown => {
                self.shutdown().await;
                return ControlFlow::Break(());
            }
        }
        ControlFlow::Continue(())
    }

    async fn subscribe(
        &mut self,
        key: SubscriptionKey,
        subscriber: SubscriberId,
        callback: Callback,
        reply: oneshot::Sender<Result<Snapshot, StreamError>>,
    ) {
        if key.is_user() {
            let _ = reply.send(self.subscribe_user(key, subscriber, callback));
            return;
        }

        if self.registry.contains(&key) {
            match self.registry.add_subscriber(&key, subscriber, callback) {
                Some(snapshot) => {
                    tracing::debug!(exchange = self.exchange(), key = %key, "reusing live stream");
                    let _ = reply.send(Ok(snapshot));
                }
                None => self.registry.add_waiter(&key, Waiter { subscriber, reply }),
            }
            return;
        }

        let request_id = self.next_request_id();
        let stream_id = self.protocol.stream_id_for(&key);
        if let Err(err) = self
            .registry
            .insert_pending(key.clone(), request_id, stream_id)
        {
            tracing::warn!(exchange = self.exchange(), key = %key, error = %err, "subscription refused");
            let _ = reply.send(Err(err));
            return;
        }

        let message = self.protocol.subscribe_message(&key, request_id);
        if let Err(err) = self.transport.send(message).await {
            self.registry.remove(&key);
            let _ = reply.send(Err(err));
            return;
        }

        tracing::info!(exchange = self.exchange(), key = %key, request_id, "subscribing");
        self.registry.add_subscriber(&key, subscriber, callback);
        self.registry.add_waiter(&key, Waiter { subscriber, reply });
    }

    fn subscribe_user(
        &mut self,
        key: SubscriptionKey,
        subscriber: SubscriberId,
        callback: Callback,
    ) -> Result<Snapshot, StreamError> {
        if *self.state.borrow() != ConnectionState::Authenticated {
            return Err(StreamError::NotAuthenticated);
        }
        let Channel::User { channel } = key.channel else {
            return Err(StreamError::NotAuthenticated);
        };

        if !self.registry.contains(&key) {
            let model = match self.account_rows.get(&channel) {
                Some(rows) => DataModel::seed(
                    &key.channel,
                    MarketUpdate::AccountSnapshot {
                        channel,
                        rows: rows.clone(),
                    },
                    &self.config,
                )?,
                None => DataModel::empty(&key.channel).ok_or_else(|| {
                    StreamError::Snapshot(format!("no empty model for {}", key.channel.name()))
                })?,
            };
            self.registry.insert_live(key.clone(), model);
        }

        self.registry
            .add_subscriber(&key, subscriber, callback)
            .ok_or_else(|| StreamError::Snapshot(format!("{key} is not live")))
    }

    async fn unsubscribe(&mut self, key: &SubscriptionKey, subscriber: SubscriberId) {
        match self.registry.remove_subscriber(key, subscriber) {
            Removal::NotFound => {}
            Removal::Remaining(ref_count) => {
                tracing::debug!(exchange = self.exchange(), key = %key, ref_count, "subscriber removed");
            }
            Removal::Last(subscription) => {
                tracing::info!(exchange = self.exchange(), key = %key, "releasing stream");
                if key.is_user() {
                    return;
                }
                // A Bitfinex stream without a channel id yet is released when
                // its late `subscribed` event shows up.
                if let Some(stream_id) = subscription.stream_id() {
                    self.send_unsubscribe(stream_id).await;
                }
            }
        }
    }

    async fn send_unsubscribe(&mut self, stream_id: &StreamId) {
        let request_id = self.next_request_id();
        let message = self.protocol.unsubscribe_message(stream_id, request_id);
        if let Err(err) = self.transport.send(message).await {
            tracing::warn!(exchange = self.exchange(), stream_id = %stream_id, error = %err, "failed to send unsubscribe");
        }
    }

    async fn authenticate(
        &mut self,
        credentials: Credentials,
        reply: oneshot::Sender<Result<(), StreamError>>,
    ) {
        if *self.state.borrow() == ConnectionState::Authenticated {
            let _ = reply.send(Ok(()));
            return;
        }
        if self.pending_auth.is_some() {
            let _ = reply.send(Err(StreamError::Authentication(
                "authentication already in progress".to_string(),
            )));
            return;
        }

        let nonce = Utc::now().timestamp_millis().max(0) as u64;
        let message = match self.protocol.auth_message(&credentials, nonce) {
            Ok(message) => message,
            Err(err) => {
                let _ = reply.send(Err(err));
                return;
            }
        };
        if let Err(err) = self.transport.send(message).await {
            let _ = reply.send(Err(StreamError::Authentication(err.to_string())));
            return;
        }

        tracing::info!(exchange = self.exchange(), key = credentials.key(), "authenticating");
        self.state.send_replace(ConnectionState::Authenticating);
        self.pending_auth = Some(reply);
    }

    async fn handle_frame(&mut self, text: &str) {
        let inbound = match self.protocol.parse_frame(text) {
            Ok(inbound) => inbound,
            Err(err) => {
                tracing::warn!(exchange = self.exchange(), error = %err, "dropping unparseable frame");
                return;
            }
        };

        for message in inbound {
            self.handle_inbound(message).await;
        }
    }

    async fn handle_inbound(&mut self, message: Inbound) {
        let sender = self.exchange();
        match message {
            Inbound::Info { handshake, message } => {
                if handshake {
                    if let Some(ready) = self.handshake.take() {
                        self.state.send_replace(ConnectionState::Connected);
                        let _ = ready.send(());
                    }
                }
                (self.info_handler)(InfoEvent::Info { sender, message });
            }
            Inbound::Error { code, message } => {
                tracing::warn!(exchange = sender, code, message = %message, "exchange error");
                (self.info_handler)(InfoEvent::Error {
                    sender,
                    code,
                    message,
                });
            }
            Inbound::Subscribed {
                request_id,
                stream_id,
            } => self.confirm(request_id, stream_id).await,
            Inbound::SubscribeFailed {
                request_id,
                code,
                message,
            } => {
                let failed = request_id.and_then(|request_id| self.registry.fail(request_id));
                match failed {
                    Some(mut subscription) => {
                        tracing::warn!(exchange = sender, key = %subscription.key(), code, message = %message, "subscription rejected");
                        answer(
                            subscription.take_waiters(),
                            Err(StreamError::SubscriptionFailure { code, message }),
                        );
                    }
                    None => (self.info_handler)(InfoEvent::Error {
                        sender,
                        code: Some(code),
                        message,
                    }),
                }
            }
            Inbound::Unsubscribed { stream_id } => {
                tracing::debug!(exchange = sender, stream_id = ?stream_id, "unsubscribed");
            }
            Inbound::Data { stream_id, body } => {
                let Some(key) = self.registry.key_for_stream(&stream_id).cloned() else {
                    tracing::debug!(exchange = sender, stream_id = %stream_id, "data for unknown stream");
                    return;
                };
                match self.protocol.decode(&key.channel, &body) {
                    Ok(updates) => {
                        for update in updates {
                            self.route(&key, update);
                        }
                    }
                    Err(err) => {
                        tracing::warn!(exchange = sender, key = %key, error = %err, "dropping undecodable update");
                    }
                }
            }
            Inbound::Account(update) => {
                let channel = match &update {
                    MarketUpdate::AccountSnapshot { channel, rows } => {
                        self.account_rows.insert(*channel, rows.clone());
                        *channel
                    }
                    MarketUpdate::Account { channel, .. } => *channel,
                    _ => return,
                };
                self.route(&SubscriptionKey::user(channel), update);
            }
            Inbound::AuthOk => {
                tracing::info!(exchange = sender, "authenticated");
                self.state.send_replace(ConnectionState::Authenticated);
                if let Some(reply) = self.pending_auth.take() {
                    let _ = reply.send(Ok(()));
                }
            }
            Inbound::AuthFailed { message } => {
                tracing::warn!(exchange = sender, message = %message, "authentication rejected");
                self.state.send_replace(ConnectionState::Connected);
                match self.pending_auth.take() {
                    Some(reply) => {
                        let _ = reply.send(Err(StreamError::Authentication(message)));
                    }
                    None => (self.info_handler)(InfoEvent::Error {
                        sender,
                        code: None,
                        message,
                    }),
                }
            }
            Inbound::Heartbeat => {}
        }
    }

    async fn confirm(&mut self, request_id: u64, stream_id: Option<StreamId>) {
        let Some(key) = self.registry.confirm(request_id, stream_id.clone()) else {
            if let Some(stream_id) = stream_id {
                tracing::debug!(exchange = self.exchange(), stream_id = %stream_id, "releasing stream nobody follows");
                self.send_unsubscribe(&stream_id).await;
            }
            return;
        };

        tracing::info!(exchange = self.exchange(), key = %key, stream_id = ?stream_id, "subscribed");
        if self.protocol.snapshot_mode(&key.channel) == SnapshotMode::Fetch {
            self.spawn_snapshot_fetch(key, request_id).await;
        }
    }

    async fn spawn_snapshot_fetch(&mut self, key: SubscriptionKey, request_id: u64) {
        let Some(source) = self.snapshots.clone() else {
            let result = Err(StreamError::Snapshot(format!(
                "{} has no snapshot source",
                self.exchange()
            )));
            self.finish_snapshot(key, request_id, result).await;
            return;
        };

        let commands = self.commands.clone();
        tokio::spawn(async move {
            let result = source.fetch_snapshot(&key).await;
            if let Some(commands) = commands.upgrade() {
                let _ = commands.send(Command::SnapshotReady {
                    key,
                    request_id,
                    result,
                });
            }
        });
    }

    /// Seeds a fetched-snapshot subscription and replays what was buffered
    /// while the fetch was in flight.
    async fn finish_snapshot(
        &mut self,
        key: SubscriptionKey,
        request_id: u64,
        result: Result<MarketUpdate, StreamError>,
    ) {
        let sender = self.protocol.name();
        let seeded =
            result.and_then(|update| DataModel::seed(&key.channel, update, &self.config));

        let Some(subscription) = self.registry.get_mut(&key) else {
            return;
        };
        if subscription.request_id() != request_id || subscription.is_live() {
            return;
        }

        match seeded {
            Ok(model) => {
                let (waiters, buffered) = subscription.activate(model);
                if let SubscriptionState::Live(model) = subscription.state_mut() {
                    let replayed = buffered.len();
                    for update in buffered {
                        if let Err(err) = model.apply(update) {
                            tracing::debug!(exchange = sender, key = %key, error = %err, "buffered update dropped");
                        }
                    }
                    tracing::info!(exchange = sender, key = %key, replayed, "snapshot seeded");
                }
                if let Some(snapshot) = subscription.snapshot() {
                    answer(waiters, Ok(snapshot));
                }
            }
            Err(err) => {
                tracing::warn!(exchange = sender, key = %key, error = %err, "initial snapshot failed");
                let Some(mut subscription) = self.registry.remove(&key) else {
                    return;
                };
                answer(subscription.take_waiters(), Err(err));
                if let Some(stream_id) = subscription.stream_id() {
                    self.send_unsubscribe(stream_id).await;
                }
            }
        }
    }

    /// Applies one decoded update to its subscription and fans the change out.
    fn route(&mut self, key: &SubscriptionKey, update: MarketUpdate) {
        let sender = self.protocol.name();
        let mode = self.protocol.snapshot_mode(&key.channel);
        let limit = self.config.max_buffered_updates;
        let Some(subscription) = self.registry.get_mut(key) else {
            tracing::debug!(exchange = sender, key = %key, "update for unknown subscription");
            return;
        };

        if let SubscriptionState::Live(model) = subscription.state_mut() {
            match model.apply(update) {
                Ok(change) => subscription.fan_out(sender, change),
                Err(StreamError::StaleUpdate(reason)) => {
                    tracing::debug!(exchange = sender, key = %key, reason = %reason, "stale update dropped");
                }
                Err(err) => {
                    tracing::warn!(exchange = sender, key = %key, error = %err, "update dropped");
                }
            }
            return;
        }

        if mode == SnapshotMode::Fetch {
            if subscription.buffer(update, limit) {
                tracing::warn!(exchange = sender, key = %key, limit, "snapshot buffer full, oldest update dropped");
            }
            return;
        }

        if !update.is_snapshot() {
            tracing::debug!(exchange = sender, key = %key, kind = update.kind(), "update before snapshot dropped");
            return;
        }
        match DataModel::seed(&key.channel, update, &self.config) {
            Ok(model) => {
                let (waiters, _) = subscription.activate(model);
                if let Some(snapshot) = subscription.snapshot() {
                    answer(waiters, Ok(snapshot));
                }
            }
            Err(err) => {
                tracing::warn!(exchange = sender, key = %key, error = %err, "unusable initial snapshot");
            }
        }
    }

    fn teardown(&mut self, error: StreamError) {
        for mut subscription in self.registry.clear() {
            answer(subscription.take_waiters(), Err(error.clone()));
        }
        if let Some(reply) = self.pending_auth.take() {
            let _ = reply.send(Err(error));
        }
        self.account_rows.clear();
    }

    async fn shutdown(&mut self) {
        self.transport.close().await;
        self.teardown(StreamError::NotConnected);
        self.state.send_replace(ConnectionState::Disconnected);
        tracing::info!(exchange = self.exchange(), "disconnected");
    }

    fn connection_lost(&mut self, reason: String) {
        let sender = self.exchange();
        tracing::warn!(exchange = sender, reason = %reason, "upstream websocket lost");
        self.teardown(StreamError::Transport(reason.clone()));
        (self.info_handler)(InfoEvent::Disconnected { sender, reason });
        self.state.send_replace(ConnectionState::Disconnected);
    }
}

fn answer(waiters: Vec<Waiter>, result: Result<Snapshot, StreamError>) {
    for waiter in waiters {
        let _ = waiter.reply.send(result.clone());
    }
}
