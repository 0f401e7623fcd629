//! Subscription registry
//!
//! Tracks user subscriptions, the routing index the dispatcher reads and the
//! reference-counted set of wire topics that is replayed after a reconnect.

use crate::core::types::{
    Channel, ChannelScope, Payload, RouteKey, SubscriptionId, SubscriptionOptions, Topic,
};
use parking_lot::Mutex;
use std::collections::{BTreeSet, HashMap};
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::debug;

/// Callback invoked with every payload routed to a subscription.
pub type Callback = Arc<dyn Fn(&Payload) + Send + Sync>;

/// Public view of one registered subscription.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SubscriptionInfo {
    pub id: SubscriptionId,
    pub channel: Channel,
    /// Sorted, de-duplicated; always empty outside per-symbol channels
    pub symbols: Vec<String>,
    /// Address for user-keyed channels
    pub user: Option<String>,
    pub options: SubscriptionOptions,
}

impl SubscriptionInfo {
    /// Wire topics this subscription expands to.
    ///
    /// Per-symbol channels get one topic per symbol and none at all when the
    /// symbol set is empty: the server requires a coin, so such a
    /// subscription only listens to coins other subscriptions pull in.
    /// User-keyed channels likewise need an address.
    pub fn topics(&self) -> Vec<Topic> {
        match self.channel.scope() {
            ChannelScope::Symbol => self
                .symbols
                .iter()
                .map(|symbol| Topic::new(self.channel, Some(symbol.clone()), self.options.clone()))
                .collect(),
            ChannelScope::User => self
                .user
                .iter()
                .map(|user| Topic::for_user(self.channel, user.clone(), self.options.clone()))
                .collect(),
            ChannelScope::Global => vec![Topic::new(self.channel, None, self.options.clone())],
        }
    }

    /// True when the subscription sends nothing on the wire and only
    /// receives data routed to it by other subscriptions.
    pub fn is_route_only(&self) -> bool {
        self.topics().is_empty()
    }

    fn routes(&self) -> Vec<RouteKey> {
        let topics = self.topics();
        if topics.is_empty() {
            return vec![RouteKey::channel_wide(self.channel)];
        }
        topics.iter().map(Topic::route_key).collect()
    }
}

/// Wire change produced by the registry while a stream is attached.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RegistryCommand {
    Subscribe(Topic),
    Unsubscribe(Topic),
}

type IdentityKey = (Channel, Vec<String>, Option<String>, SubscriptionOptions);

struct Entry {
    info: SubscriptionInfo,
    callback: Callback,
}

#[derive(Default)]
struct Inner {
    next_id: u64,
    entries: HashMap<SubscriptionId, Entry>,
    by_key: HashMap<IdentityKey, SubscriptionId>,
    routes: HashMap<RouteKey, Vec<SubscriptionId>>,
    wire_refs: HashMap<Topic, usize>,
    outbox: Option<mpsc::UnboundedSender<RegistryCommand>>,
}

impl Inner {
    fn emit(&self, command: RegistryCommand) {
        if let Some(outbox) = &self.outbox {
            // A closed receiver means the stream task is gone; the next
            // attach resyncs from `wire_refs` anyway.
            let _ = outbox.send(command);
        }
    }
}

/// Registry shared by the stream facade and its background task.
#[derive(Default)]
pub struct Registry {
    inner: Mutex<Inner>,
}

impl std::fmt::Debug for Registry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let inner = self.inner.lock();
        f.debug_struct("Registry")
            .field("subscriptions", &inner.entries.len())
            .field("topics", &inner.wire_refs.len())
            .field("attached", &inner.outbox.is_some())
            .finish()
    }
}

impl Registry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a subscription. Returns the existing id when the same
    /// channel, symbol set and options are already registered; the new
    /// callback is dropped in that case.
    ///
    /// Symbols are ignored on channels that are not subscribed per coin.
    pub fn add(
        &self,
        channel: Channel,
        symbols: &[String],
        options: SubscriptionOptions,
        callback: Callback,
    ) -> SubscriptionId {
        let symbols = if channel.is_per_symbol() {
            normalize_symbols(symbols)
        } else {
            Vec::new()
        };
        self.insert(channel, symbols, None, options, callback)
    }

    /// Register a subscription on a user-keyed channel such as `userFills`.
    pub fn add_for_user(
        &self,
        channel: Channel,
        user: &str,
        options: SubscriptionOptions,
        callback: Callback,
    ) -> SubscriptionId {
        let user = Some(user.trim())
            .filter(|user| !user.is_empty() && channel.is_per_user())
            .map(str::to_string);
        self.insert(channel, Vec::new(), user, options, callback)
    }

    fn insert(
        &self,
        channel: Channel,
        symbols: Vec<String>,
        user: Option<String>,
        options: SubscriptionOptions,
        callback: Callback,
    ) -> SubscriptionId {
        let key: IdentityKey = (channel, symbols.clone(), user.clone(), options.clone());

        let mut inner = self.inner.lock();
        if let Some(existing) = inner.by_key.get(&key) {
            debug!(id = %existing, %channel, "duplicate subscription");
            return *existing;
        }

        inner.next_id += 1;
        let id = SubscriptionId(inner.next_id);
        let info = SubscriptionInfo {
            id,
            channel,
            symbols,
            user,
            options,
        };

        for topic in info.topics() {
            let refs = inner.wire_refs.entry(topic.clone()).or_insert(0);
            *refs += 1;
            if *refs == 1 {
                inner.emit(RegistryCommand::Subscribe(topic));
            }
        }
        for route in info.routes() {
            inner.routes.entry(route).or_default().push(id);
        }

        debug!(%id, %channel, symbols = ?info.symbols, user = ?info.user, "subscription added");
        inner.by_key.insert(key, id);
        inner.entries.insert(id, Entry { info, callback });
        id
    }

    /// Remove a subscription. Returns `false` if it was already gone.
    pub fn remove(&self, id: SubscriptionId) -> bool {
        let mut inner = self.inner.lock();
        let Some(entry) = inner.entries.remove(&id) else {
            return false;
        };
        let info = entry.info;

        inner
            .by_key
            .remove(&(info.channel, info.symbols.clone(), info.user.clone(), info.options.clone()));

        for route in info.routes() {
            if let Some(ids) = inner.routes.get_mut(&route) {
                ids.retain(|other| *other != id);
                if ids.is_empty() {
                    inner.routes.remove(&route);
                }
            }
        }

        for topic in info.topics() {
            let Some(refs) = inner.wire_refs.get_mut(&topic) else {
                continue;
            };
            *refs -= 1;
            if *refs == 0 {
                inner.wire_refs.remove(&topic);
                inner.emit(RegistryCommand::Unsubscribe(topic));
            }
        }

        debug!(%id, "subscription removed");
        true
    }

    /// Snapshot of every live subscription, ordered by id. Each call takes a
    /// fresh snapshot under the registry lock.
    pub fn all_active(&self) -> impl Iterator<Item = SubscriptionInfo> {
        let inner = self.inner.lock();
        let mut snapshot: Vec<SubscriptionInfo> =
            inner.entries.values().map(|entry| entry.info.clone()).collect();
        drop(inner);
        snapshot.sort_by_key(|info| info.id);
        snapshot.into_iter()
    }

    /// Distinct wire topics currently subscribed.
    pub fn active_topics(&self) -> BTreeSet<Topic> {
        self.inner.lock().wire_refs.keys().cloned().collect()
    }

    /// Callbacks for an inbound route: the exact route first, then
    /// channel-wide subscribers.
    pub fn callbacks_for(&self, route: &RouteKey) -> Vec<(SubscriptionId, Callback)> {
        let inner = self.inner.lock();
        let mut callbacks = Vec::new();
        let mut collect = |key: &RouteKey| {
            if let Some(ids) = inner.routes.get(key) {
                callbacks.extend(ids.iter().filter_map(|id| {
                    inner
                        .entries
                        .get(id)
                        .map(|entry| (*id, entry.callback.clone()))
                }));
            }
        };

        collect(route);
        if !route.is_channel_wide() {
            collect(&RouteKey::channel_wide(route.channel));
        }
        callbacks
    }

    /// Start emitting wire commands for the running stream task.
    pub fn attach(&self) -> mpsc::UnboundedReceiver<RegistryCommand> {
        let (tx, rx) = mpsc::unbounded_channel();
        self.inner.lock().outbox = Some(tx);
        rx
    }

    /// Drop queued commands and return the topics to (re)send on a fresh
    /// connection. Both happen under one lock, so every later mutation shows
    /// up on `commands` exactly once.
    pub fn resync(&self, commands: &mut mpsc::UnboundedReceiver<RegistryCommand>) -> Vec<Topic> {
        let inner = self.inner.lock();
        while commands.try_recv().is_ok() {}
        let mut topics: Vec<Topic> = inner.wire_refs.keys().cloned().collect();
        topics.sort();
        topics
    }

    pub fn detach(&self) {
        self.inner.lock().outbox = None;
    }

    /// Remove every subscription without emitting wire commands.
    pub fn clear(&self) {
        let mut inner = self.inner.lock();
        inner.entries.clear();
        inner.by_key.clear();
        inner.routes.clear();
        inner.wire_refs.clear();
    }

    pub fn len(&self) -> usize {
        self.inner.lock().entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

fn normalize_symbols(symbols: &[String]) -> Vec<String> {
    let set: BTreeSet<String> = symbols
        .iter()
        .map(|symbol| symbol.trim())
        .filter(|symbol| !symbol.is_empty())
        .map(str::to_string)
        .collect();
    set.into_iter().collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn noop() -> Callback {
        Arc::new(|_: &Payload| {})
    }

    fn symbols(list: &[&str]) -> Vec<String> {
        list.iter().map(|s| (*s).to_string()).collect()
    }

    #[test]
    fn test_duplicate_add_returns_existing_id() {
        let registry = Registry::new();
        let first = registry.add(
            Channel::Trades,
            &symbols(&["ETH", "BTC"]),
            SubscriptionOptions::default(),
            noop(),
        );
        let second = registry.add(
            Channel::Trades,
            &symbols(&["BTC", " ETH ", "BTC"]),
            SubscriptionOptions::default(),
            noop(),
        );

        assert_eq!(first, second);
        assert_eq!(registry.len(), 1);
        assert_eq!(registry.active_topics().len(), 2);
    }

    #[test]
    fn test_options_are_part_of_identity() {
        let registry = Registry::new();
        let a = registry.add(
            Channel::L2Book,
            &symbols(&["BTC"]),
            SubscriptionOptions::default().with_n_sig_figs(5),
            noop(),
        );
        let b = registry.add(
            Channel::L2Book,
            &symbols(&["BTC"]),
            SubscriptionOptions::default().with_n_sig_figs(3),
            noop(),
        );
        assert_ne!(a, b);
        assert_eq!(registry.active_topics().len(), 2);

        // Book frames carry no aggregation, so both hear both feeds
        let btc = RouteKey::new(Channel::L2Book, Some("BTC".to_string()));
        assert_eq!(registry.callbacks_for(&btc).len(), 2);
    }

    #[test]
    fn test_remove_is_idempotent() {
        let registry = Registry::new();
        let id = registry.add(Channel::Blocks, &[], SubscriptionOptions::default(), noop());
        assert!(registry.remove(id));
        assert!(!registry.remove(id));
        assert!(registry.is_empty());
        assert!(registry.active_topics().is_empty());
    }

    #[test]
    fn test_shared_topic_is_reference_counted() {
        let registry = Registry::new();
        let mut commands = registry.attach();

        let a = registry.add(
            Channel::Trades,
            &symbols(&["BTC"]),
            SubscriptionOptions::default(),
            noop(),
        );
        let b = registry.add(
            Channel::Trades,
            &symbols(&["BTC", "ETH"]),
            SubscriptionOptions::default(),
            noop(),
        );

        let btc = Topic::new(Channel::Trades, Some("BTC".to_string()), SubscriptionOptions::default());
        let eth = Topic::new(Channel::Trades, Some("ETH".to_string()), SubscriptionOptions::default());
        assert_eq!(commands.try_recv().unwrap(), RegistryCommand::Subscribe(btc.clone()));
        assert_eq!(commands.try_recv().unwrap(), RegistryCommand::Subscribe(eth.clone()));
        assert!(commands.try_recv().is_err());

        registry.remove(a);
        assert!(commands.try_recv().is_err());

        registry.remove(b);
        let mut rest = vec![commands.try_recv().unwrap(), commands.try_recv().unwrap()];
        rest.sort_by_key(|command| format!("{:?}", command));
        assert_eq!(
            rest,
            vec![RegistryCommand::Unsubscribe(btc), RegistryCommand::Unsubscribe(eth)]
        );
    }

    #[test]
    fn test_detached_registry_emits_nothing() {
        let registry = Registry::new();
        let mut commands = registry.attach();
        registry.detach();
        registry.add(Channel::AllMids, &[], SubscriptionOptions::default(), noop());
        assert!(commands.try_recv().is_err());
    }

    #[test]
    fn test_resync_discards_stale_commands() {
        let registry = Registry::new();
        let mut commands = registry.attach();
        registry.add(
            Channel::Trades,
            &symbols(&["SOL"]),
            SubscriptionOptions::default(),
            noop(),
        );

        let topics = registry.resync(&mut commands);
        assert_eq!(topics.len(), 1);
        assert!(commands.try_recv().is_err());
    }

    #[test]
    fn test_callbacks_include_channel_wide_routes() {
        let registry = Registry::new();
        let hits = Arc::new(AtomicUsize::new(0));
        let counter = hits.clone();
        registry.add(
            Channel::Trades,
            &symbols(&["BTC"]),
            SubscriptionOptions::default(),
            Arc::new(move |_: &Payload| {
                counter.fetch_add(1, Ordering::SeqCst);
            }),
        );
        registry.add(Channel::Trades, &[], SubscriptionOptions::default(), noop());

        let btc = RouteKey::new(Channel::Trades, Some("BTC".to_string()));
        let eth = RouteKey::new(Channel::Trades, Some("ETH".to_string()));
        assert_eq!(registry.callbacks_for(&btc).len(), 2);
        assert_eq!(registry.callbacks_for(&eth).len(), 1);

        for (_, callback) in registry.callbacks_for(&btc) {
            callback(&Payload::Null);
        }
        assert_eq!(hits.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_empty_symbols_on_per_symbol_channel_is_route_only() {
        let registry = Registry::new();
        let mut commands = registry.attach();
        let id = registry.add(Channel::Trades, &[], SubscriptionOptions::default(), noop());

        assert!(commands.try_recv().is_err());
        assert!(registry.active_topics().is_empty());
        let info = registry.all_active().next().unwrap();
        assert_eq!(info.id, id);
        assert!(info.is_route_only());

        // Still hears coins that another subscription brings onto the wire
        registry.add(
            Channel::Trades,
            &symbols(&["ETH"]),
            SubscriptionOptions::default(),
            noop(),
        );
        let eth = RouteKey::new(Channel::Trades, Some("ETH".to_string()));
        assert_eq!(registry.callbacks_for(&eth).len(), 2);
    }

    #[test]
    fn test_symbols_are_ignored_on_global_channels() {
        let registry = Registry::new();
        let a = registry.add(Channel::AllMids, &symbols(&["BTC"]), SubscriptionOptions::default(), noop());
        let b = registry.add(Channel::AllMids, &[], SubscriptionOptions::default(), noop());
        assert_eq!(a, b);
        assert_eq!(
            registry.active_topics().into_iter().collect::<Vec<_>>(),
            vec![Topic::new(Channel::AllMids, None, SubscriptionOptions::default())]
        );
    }

    #[test]
    fn test_candle_intervals_route_separately() {
        let registry = Registry::new();
        let minute = registry.add(
            Channel::Candle,
            &symbols(&["SOL"]),
            SubscriptionOptions::default().with_interval("1m"),
            noop(),
        );
        let hour = registry.add(
            Channel::Candle,
            &symbols(&["SOL"]),
            SubscriptionOptions::default().with_interval("1h"),
            noop(),
        );

        let route = |interval: &str| {
            RouteKey::new(Channel::Candle, Some("SOL".to_string()))
                .with_interval(Some(interval.to_string()))
        };
        let ids = |key: &RouteKey| -> Vec<SubscriptionId> {
            registry.callbacks_for(key).into_iter().map(|(id, _)| id).collect()
        };
        assert_eq!(ids(&route("1m")), vec![minute]);
        assert_eq!(ids(&route("1h")), vec![hour]);
    }

    #[test]
    fn test_user_subscriptions_are_keyed_by_address() {
        let registry = Registry::new();
        let mut commands = registry.attach();
        let a = registry.add_for_user(Channel::UserFills, "0xabc", SubscriptionOptions::default(), noop());
        let again = registry.add_for_user(Channel::UserFills, " 0xabc ", SubscriptionOptions::default(), noop());
        let b = registry.add_for_user(Channel::UserFills, "0xdef", SubscriptionOptions::default(), noop());

        assert_eq!(a, again);
        assert_ne!(a, b);
        assert_eq!(
            commands.try_recv().unwrap(),
            RegistryCommand::Subscribe(Topic::for_user(
                Channel::UserFills,
                "0xabc",
                SubscriptionOptions::default()
            ))
        );
        assert_eq!(registry.active_topics().len(), 2);

        // User payloads are not tagged, so both listeners hear the channel
        assert_eq!(
            registry
                .callbacks_for(&RouteKey::channel_wide(Channel::UserFills))
                .len(),
            2
        );
    }

    #[test]
    fn test_all_active_is_a_snapshot() {
        let registry = Registry::new();
        let a = registry.add(Channel::Blocks, &[], SubscriptionOptions::default(), noop());
        let snapshot = registry.all_active();
        registry.add(Channel::AllMids, &[], SubscriptionOptions::default(), noop());
        registry.remove(a);

        let ids: Vec<SubscriptionId> = snapshot.map(|info| info.id).collect();
        assert_eq!(ids, vec![a]);
        assert_eq!(registry.all_active().count(), 1);
    }
}
