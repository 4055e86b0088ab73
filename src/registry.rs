use std::collections::{HashMap, VecDeque};

use tokio::sync::oneshot;

use crate::{
    errors::StreamError,
    model::DataModel,
    models::{
        Callback, Change, MarketUpdate, Snapshot, StreamEvent, StreamId, SubscriberId,
        SubscriptionKey,
    },
};

pub type SubscribeReply = oneshot::Sender<Result<Snapshot, StreamError>>;

/// A caller blocked in `subscribe` until the initial snapshot is known.
pub struct Waiter {
    pub subscriber: SubscriberId,
    pub reply: SubscribeReply,
}

pub enum SubscriptionState {
    /// Subscribe sent; updates that arrive before the snapshot are buffered.
    Pending {
        waiters: Vec<Waiter>,
        buffered: VecDeque<MarketUpdate>,
    },
    Live(DataModel),
}

/// One physical stream shared by every callback registered for its key.
pub struct Subscription {
    key: SubscriptionKey,
    request_id: u64,
    stream_id: Option<StreamId>,
    callbacks: Vec<(SubscriberId, Callback)>,
    state: SubscriptionState,
}

impl Subscription {
    pub fn key(&self) -> &SubscriptionKey {
        &self.key
    }

    pub fn request_id(&self) -> u64 {
        self.request_id
    }

    pub fn stream_id(&self) -> Option<&StreamId> {
        self.stream_id.as_ref()
    }

    pub fn ref_count(&self) -> usize {
        self.callbacks.len()
    }

    pub fn is_live(&self) -> bool {
        matches!(self.state, SubscriptionState::Live(_))
    }

    pub fn state_mut(&mut self) -> &mut SubscriptionState {
        &mut self.state
    }

    pub fn snapshot(&self) -> Option<Snapshot> {
        match &self.state {
            SubscriptionState::Live(model) => Some(model.snapshot()),
            SubscriptionState::Pending { .. } => None,
        }
    }

    /// Hands `change` to every registered callback, in registration order.
    pub fn fan_out(&self, sender: &'static str, change: Change) {
        let event = StreamEvent {
            sender,
            key: self.key.clone(),
            change,
        };
        for (_, callback) in &self.callbacks {
            callback(&event);
        }
    }

    /// Replaces the pending state with `model`, returning the callers that
    /// were waiting and the updates buffered meanwhile.
    pub fn activate(&mut self, model: DataModel) -> (Vec<Waiter>, VecDeque<MarketUpdate>) {
        match std::mem::replace(&mut self.state, SubscriptionState::Live(model)) {
            SubscriptionState::Pending { waiters, buffered } => (waiters, buffered),
            SubscriptionState::Live(_) => (Vec::new(), VecDeque::new()),
        }
    }

    /// Takes waiting callers out of a subscription that is being torn down.
    pub fn take_waiters(&mut self) -> Vec<Waiter> {
        match &mut self.state {
            SubscriptionState::Pending { waiters, .. } => std::mem::take(waiters),
            SubscriptionState::Live(_) => Vec::new(),
        }
    }

    /// Buffers an update while the snapshot is outstanding. Returns `true`
    /// when the oldest buffered update had to be dropped.
    pub fn buffer(&mut self, update: MarketUpdate, limit: usize) -> bool {
        let SubscriptionState::Pending { buffered, .. } = &mut self.state else {
            return false;
        };
        buffered.push_back(update);
        if buffered.len() > limit.max(1) {
            buffered.pop_front();
            return true;
        }
        false
    }
}

pub enum Removal {
    NotFound,
    Remaining(usize),
    /// Last callback gone; the subscription has been dropped from the registry.
    Last(Subscription),
}

/// Logical key to physical stream bookkeeping for one client session.
#[derive(Default)]
pub struct SubscriptionRegistry {
    subscriptions: HashMap<SubscriptionKey, Subscription>,
    streams: HashMap<StreamId, SubscriptionKey>,
    requests: HashMap<u64, SubscriptionKey>,
}

impl SubscriptionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn contains(&self, key: &SubscriptionKey) -> bool {
        self.subscriptions.contains_key(key)
    }

    pub fn len(&self) -> usize {
        self.subscriptions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.subscriptions.is_empty()
    }

    pub fn ref_count(&self, key: &SubscriptionKey) -> usize {
        self.subscriptions
            .get(key)
            .map(Subscription::ref_count)
            .unwrap_or_default()
    }

    pub fn get_mut(&mut self, key: &SubscriptionKey) -> Option<&mut Subscription> {
        self.subscriptions.get_mut(key)
    }

    pub fn key_for_stream(&self, stream_id: &StreamId) -> Option<&SubscriptionKey> {
        self.streams.get(stream_id)
    }

    /// Registers a subscription whose subscribe request `request_id` is in
    /// flight. `stream_id` is set when the exchange names streams up front;
    /// a stream already routed to another key is refused.
    pub fn insert_pending(
        &mut self,
        key: SubscriptionKey,
        request_id: u64,
        stream_id: Option<StreamId>,
    ) -> Result<(), StreamError> {
        if let Some(stream_id) = &stream_id {
            if let Some(owner) = self.streams.get(stream_id).filter(|owner| **owner != key) {
                return Err(StreamError::StreamInUse {
                    stream_id: stream_id.to_string(),
                    owner: owner.to_string(),
                });
            }
            self.streams.insert(stream_id.clone(), key.clone());
        }
        self.requests.insert(request_id, key.clone());
        self.subscriptions.insert(
            key.clone(),
            Subscription {
                key,
                request_id,
                stream_id,
                callbacks: Vec::new(),
                state: SubscriptionState::Pending {
                    waiters: Vec::new(),
                    buffered: VecDeque::new(),
                },
            },
        );
        Ok(())
    }

    /// Registers a subscription that needs no physical stream of its own.
    pub fn insert_live(&mut self, key: SubscriptionKey, model: DataModel) {
        self.subscriptions.insert(
            key.clone(),
            Subscription {
                key,
                request_id: 0,
                stream_id: None,
                callbacks: Vec::new(),
                state: SubscriptionState::Live(model),
            },
        );
    }

    /// Adds a callback. Returns the current snapshot when the subscription is
    /// already live, `None` while it is still waiting for one.
    pub fn add_subscriber(
        &mut self,
        key: &SubscriptionKey,
        subscriber: SubscriberId,
        callback: Callback,
    ) -> Option<Snapshot> {
        let subscription = self.subscriptions.get_mut(key)?;
        subscription.callbacks.push((subscriber, callback));
        subscription.snapshot()
    }

    pub fn add_waiter(&mut self, key: &SubscriptionKey, waiter: Waiter) {
        if let Some(Subscription {
            state: SubscriptionState::Pending { waiters, .. },
            ..
        }) = self.subscriptions.get_mut(key)
        {
            waiters.push(waiter);
        }
    }

    /// Removes exactly one registration; the subscription itself goes away
    /// only with its last callback.
    pub fn remove_subscriber(
        &mut self,
        key: &SubscriptionKey,
        subscriber: SubscriberId,
    ) -> Removal {
        let Some(subscription) = self.subscriptions.get_mut(key) else {
            return Removal::NotFound;
        };
        let Some(position) = subscription
            .callbacks
            .iter()
            .position(|(id, _)| *id == subscriber)
        else {
            return Removal::NotFound;
        };

        subscription.callbacks.remove(position);
        if let SubscriptionState::Pending { waiters, .. } = &mut subscription.state {
            waiters.retain(|waiter| waiter.subscriber != subscriber);
        }

        if subscription.callbacks.is_empty() {
            return match self.remove(key) {
                Some(subscription) => Removal::Last(subscription),
                None => Removal::NotFound,
            };
        }
        Removal::Remaining(subscription.callbacks.len())
    }

    /// Matches an exchange acknowledgement to its request. Returns `None` for
    /// requests nobody is waiting on any more.
    pub fn confirm(
        &mut self,
        request_id: u64,
        stream_id: Option<StreamId>,
    ) -> Option<SubscriptionKey> {
        let key = self.requests.remove(&request_id)?;
        let subscription = self.subscriptions.get_mut(&key)?;

        if let Some(stream_id) = stream_id {
            if let Some(previous) = subscription.stream_id.replace(stream_id.clone()) {
                self.streams.remove(&previous);
            }
            self.streams.insert(stream_id, key.clone());
        }

        Some(key)
    }

    /// Drops the subscription behind a rejected request.
    pub fn fail(&mut self, request_id: u64) -> Option<Subscription> {
        let key = self.requests.get(&request_id)?.clone();
        self.remove(&key)
    }

    pub fn remove(&mut self, key: &SubscriptionKey) -> Option<Subscription> {
        let subscription = self.subscriptions.remove(key)?;
        if let Some(stream_id) = &subscription.stream_id {
            if self.streams.get(stream_id) == Some(key) {
                self.streams.remove(stream_id);
            }
        }
        if self.requests.get(&subscription.request_id) == Some(key) {
            self.requests.remove(&subscription.request_id);
        }
        Some(subscription)
    }

    /// Tears every subscription down, e.g. once the connection is gone.
    pub fn clear(&mut self) -> Vec<Subscription> {
        self.streams.clear();
        self.requests.clear();
        self.subscriptions.drain().map(|(_, subscription)| subscription).collect()
    }
}
