//! Three-level subscription directory: class → security → parameter.
//!
//! Each level sits behind its own mutex. Lookups go top-down hand-over-hand:
//! the parent lock is released as soon as the child `Arc` is cloned out, so
//! an update to one security never blocks a sibling. Nodes are never removed
//! (empty leaves keep the last pushed value cached), which makes a cloned
//! child `Arc` valid for as long as the caller needs it.

use crate::lock;
use crate::session::{ConnectionSession, ParamKey, SessionId};

use serde_json::Value;
use std::collections::HashMap;
use std::fmt;
use std::sync::{Arc, Mutex};

/// One consumer of a parameter: the session and the id it subscribed with.
#[derive(Clone)]
pub struct Consumer {
    /// Subscribed session.
    pub session: Arc<ConnectionSession>,
    /// Subscription id to put in push frames.
    pub id: i64,
}

impl fmt::Debug for Consumer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Consumer")
            .field("session", &self.session.id())
            .field("id", &self.id)
            .finish()
    }
}

#[derive(Debug, Default)]
struct LeafState {
    value: Option<Value>,
    consumers: HashMap<SessionId, Consumer>,
}

/// Leaf of the directory: consumers of one (class, security, parameter).
#[derive(Debug)]
pub struct ParamSubscription {
    param: String,
    state: Mutex<LeafState>,
}

impl ParamSubscription {
    fn new(param: &str) -> Self {
        Self {
            param: param.to_string(),
            state: Mutex::new(LeafState::default()),
        }
    }

    /// Parameter name.
    pub fn param(&self) -> &str {
        &self.param
    }

    /// Adds or re-ids a consumer. One entry per session.
    pub fn add_consumer(&self, session: &Arc<ConnectionSession>, id: i64) {
        lock(&self.state).consumers.insert(
            session.id(),
            Consumer {
                session: session.clone(),
                id,
            },
        );
    }

    /// Removes a consumer; `false` if the session was not subscribed.
    pub fn del_consumer(&self, session_id: SessionId) -> bool {
        lock(&self.state).consumers.remove(&session_id).is_some()
    }

    /// Subscription id of `session_id`, if subscribed.
    pub fn consumer_id(&self, session_id: SessionId) -> Option<i64> {
        lock(&self.state)
            .consumers
            .get(&session_id)
            .map(|consumer| consumer.id)
    }

    /// Snapshot of the consumers.
    pub fn consumers(&self) -> Vec<Consumer> {
        lock(&self.state).consumers.values().cloned().collect()
    }

    /// Number of consumers.
    pub fn consumer_count(&self) -> usize {
        lock(&self.state).consumers.len()
    }

    /// Whether nobody is subscribed.
    pub fn is_empty(&self) -> bool {
        self.consumer_count() == 0
    }

    /// Last pushed value, if any.
    pub fn value(&self) -> Option<Value> {
        lock(&self.state).value.clone()
    }

    /// Caches `value` unless a value is already cached.
    pub fn seed_value(&self, value: Value) {
        lock(&self.state).value.get_or_insert(value);
    }

    /// Stores a new value and snapshots the consumers in one step.
    pub fn update(&self, value: Value) -> Vec<Consumer> {
        let mut state = lock(&self.state);
        state.value = Some(value);
        state.consumers.values().cloned().collect()
    }

    /// Like [`update`](Self::update), but returns `None` when `value`
    /// equals the cached one.
    pub fn update_if_changed(&self, value: Value) -> Option<Vec<Consumer>> {
        let mut state = lock(&self.state);
        if state.value.as_ref() == Some(&value) {
            return None;
        }
        state.value = Some(value);
        Some(state.consumers.values().cloned().collect())
    }
}

/// Parameters of one security.
#[derive(Debug)]
pub struct SecuritySubscriptions {
    security: String,
    params: Mutex<HashMap<String, Arc<ParamSubscription>>>,
}

impl SecuritySubscriptions {
    fn new(security: &str) -> Self {
        Self {
            security: security.to_string(),
            params: Mutex::new(HashMap::new()),
        }
    }

    /// Security code.
    pub fn security(&self) -> &str {
        &self.security
    }

    fn leaf(&self, param: &str) -> Arc<ParamSubscription> {
        lock(&self.params)
            .entry(param.to_string())
            .or_insert_with(|| Arc::new(ParamSubscription::new(param)))
            .clone()
    }

    /// Looks up a parameter leaf.
    pub fn find(&self, param: &str) -> Option<Arc<ParamSubscription>> {
        lock(&self.params).get(param).cloned()
    }

    /// All parameter leaves of this security, sorted by name.
    pub fn params(&self) -> Vec<Arc<ParamSubscription>> {
        let mut params: Vec<_> = lock(&self.params).values().cloned().collect();
        params.sort_by(|a, b| a.param.cmp(&b.param));
        params
    }
}

/// Securities of one class.
#[derive(Debug)]
pub struct ClassSubscriptions {
    class: String,
    securities: Mutex<HashMap<String, Arc<SecuritySubscriptions>>>,
}

impl ClassSubscriptions {
    fn new(class: &str) -> Self {
        Self {
            class: class.to_string(),
            securities: Mutex::new(HashMap::new()),
        }
    }

    /// Class code.
    pub fn class(&self) -> &str {
        &self.class
    }

    fn node(&self, security: &str) -> Arc<SecuritySubscriptions> {
        lock(&self.securities)
            .entry(security.to_string())
            .or_insert_with(|| Arc::new(SecuritySubscriptions::new(security)))
            .clone()
    }

    /// Looks up a security node.
    pub fn find(&self, security: &str) -> Option<Arc<SecuritySubscriptions>> {
        lock(&self.securities).get(security).cloned()
    }
}

/// The whole directory.
#[derive(Debug, Default)]
pub struct SubscriptionDirectory {
    classes: Mutex<HashMap<String, Arc<ClassSubscriptions>>>,
}

impl SubscriptionDirectory {
    /// Creates an empty directory.
    pub fn new() -> Self {
        Self::default()
    }

    fn class_node(&self, class: &str) -> Arc<ClassSubscriptions> {
        lock(&self.classes)
            .entry(class.to_string())
            .or_insert_with(|| Arc::new(ClassSubscriptions::new(class)))
            .clone()
    }

    fn find_key(&self, key: &ParamKey) -> Option<Arc<ParamSubscription>> {
        self.find(&key.class, &key.security, &key.param)
    }

    /// Subscribes `session` to a parameter under `id`.
    ///
    /// Idempotent per session: subscribing again only replaces the id.
    pub fn subscribe(
        &self,
        session: &Arc<ConnectionSession>,
        class: &str,
        security: &str,
        param: &str,
        id: i64,
    ) -> Arc<ParamSubscription> {
        let mut local = session.param_subscriptions();
        let leaf = self.class_node(class).node(security).leaf(param);
        leaf.add_consumer(session, id);
        local.insert(ParamKey::new(class, security, param), id);
        log::debug!(
            "Session {} subscribed to {}/{}/{} with id {}",
            session.id(),
            class,
            security,
            param,
            id
        );
        leaf
    }

    /// Removes the session's subscription to a parameter.
    ///
    /// Returns the id it was subscribed with, or `None` if it was not.
    pub fn unsubscribe(
        &self,
        session: &ConnectionSession,
        class: &str,
        security: &str,
        param: &str,
    ) -> Option<i64> {
        let mut local = session.param_subscriptions();
        let key = ParamKey::new(class, security, param);
        let id = local.remove(&key)?;
        if let Some(leaf) = self.find_key(&key) {
            leaf.del_consumer(session.id());
        }
        log::debug!("Session {} unsubscribed from {}", session.id(), key);
        Some(id)
    }

    /// Removes every subscription held by `session`; returns how many.
    ///
    /// Walks the session's own index, so the cost is proportional to that
    /// session's subscriptions rather than to the whole directory.
    pub fn clear_all(&self, session: &ConnectionSession) -> usize {
        let mut local = session.param_subscriptions();
        let count = local.len();
        for (key, _) in local.drain() {
            if let Some(leaf) = self.find_key(&key) {
                leaf.del_consumer(session.id());
            }
        }
        if count > 0 {
            log::debug!(
                "Cleared {} subscriptions of session {}",
                count,
                session.id()
            );
        }
        count
    }

    /// Looks up a parameter leaf.
    pub fn find(&self, class: &str, security: &str, param: &str) -> Option<Arc<ParamSubscription>> {
        self.find_security(class, security)?.find(param)
    }

    /// Looks up a security node.
    pub fn find_security(&self, class: &str, security: &str) -> Option<Arc<SecuritySubscriptions>> {
        let class_node = lock(&self.classes).get(class).cloned()?;
        class_node.find(security)
    }

    /// Total number of (session, parameter) consumer entries.
    pub fn consumer_count(&self) -> usize {
        let classes: Vec<_> = lock(&self.classes).values().cloned().collect();
        classes
            .iter()
            .flat_map(|class| {
                lock(&class.securities)
                    .values()
                    .cloned()
                    .collect::<Vec<_>>()
            })
            .flat_map(|security| security.params())
            .map(|leaf| leaf.consumer_count())
            .sum()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::test_session;
    use rand::rngs::StdRng;
    use rand::{Rng, SeedableRng};
    use serde_json::json;
    use std::thread;

    /// Checks that the session's index and the directory agree both ways.
    fn assert_consistent(dir: &SubscriptionDirectory, session: &ConnectionSession) {
        let local = session.param_subscription_list();
        for (key, id) in &local {
            let leaf = dir.find(&key.class, &key.security, &key.param).unwrap();
            assert_eq!(leaf.consumer_id(session.id()), Some(*id), "{}", key);
        }
        let classes: Vec<_> = lock(&dir.classes).values().cloned().collect();
        for class in classes {
            let securities: Vec<_> = lock(&class.securities).values().cloned().collect();
            for security in securities {
                for leaf in security.params() {
                    if let Some(id) = leaf.consumer_id(session.id()) {
                        let key = ParamKey::new(class.class(), security.security(), leaf.param());
                        assert_eq!(session.param_subscription(&key), Some(id), "{}", key);
                    }
                }
            }
        }
    }

    #[test]
    fn test_subscribe_and_find() {
        let dir = SubscriptionDirectory::new();
        let (a, _) = test_session(1);
        dir.subscribe(&a, "TQBR", "SBER", "LAST", 5);

        let leaf = dir.find("TQBR", "SBER", "LAST").unwrap();
        assert_eq!(leaf.consumer_id(1), Some(5));
        assert!(dir.find("TQBR", "SBER", "BID").is_none());
        assert!(dir.find_security("TQBR", "GAZP").is_none());
        assert_eq!(dir.find_security("TQBR", "SBER").unwrap().security(), "SBER");
        assert_consistent(&dir, &a);
    }

    #[test]
    fn test_resubscribe_is_idempotent() {
        let dir = SubscriptionDirectory::new();
        let (a, _) = test_session(1);
        dir.subscribe(&a, "TQBR", "SBER", "LAST", 5);
        dir.subscribe(&a, "TQBR", "SBER", "LAST", 9);

        let leaf = dir.find("TQBR", "SBER", "LAST").unwrap();
        assert_eq!(leaf.consumer_count(), 1);
        assert_eq!(leaf.consumer_id(1), Some(9));
        assert_eq!(a.param_subscription_list().len(), 1);
        assert_consistent(&dir, &a);
    }

    #[test]
    fn test_unsubscribe() {
        let dir = SubscriptionDirectory::new();
        let (a, _) = test_session(1);
        let (b, _) = test_session(2);
        dir.subscribe(&a, "TQBR", "SBER", "LAST", 5);
        dir.subscribe(&b, "TQBR", "SBER", "LAST", 6);

        assert_eq!(dir.unsubscribe(&a, "TQBR", "SBER", "LAST"), Some(5));
        assert_eq!(dir.unsubscribe(&a, "TQBR", "SBER", "LAST"), None);
        assert_eq!(dir.unsubscribe(&a, "SPBFUT", "SiZ6", "LAST"), None);

        let leaf = dir.find("TQBR", "SBER", "LAST").unwrap();
        assert_eq!(leaf.consumer_count(), 1);
        assert_eq!(leaf.consumer_id(2), Some(6));
        assert_consistent(&dir, &a);
        assert_consistent(&dir, &b);
    }

    #[test]
    fn test_clear_all_touches_only_own_entries() {
        let dir = SubscriptionDirectory::new();
        let (a, _) = test_session(1);
        let (b, _) = test_session(2);
        dir.subscribe(&a, "TQBR", "SBER", "LAST", 1);
        dir.subscribe(&a, "TQBR", "GAZP", "BID", 2);
        dir.subscribe(&a, "SPBFUT", "SiZ6", "LAST", 3);
        dir.subscribe(&b, "TQBR", "SBER", "LAST", 4);

        assert_eq!(dir.clear_all(&a), 3);
        assert!(a.param_subscription_list().is_empty());
        assert_eq!(dir.consumer_count(), 1);
        assert_eq!(dir.find("TQBR", "SBER", "LAST").unwrap().consumer_id(2), Some(4));
        assert_eq!(dir.clear_all(&a), 0);
    }

    #[test]
    fn test_empty_leaf_keeps_last_value() {
        let dir = SubscriptionDirectory::new();
        let (a, _) = test_session(1);
        let leaf = dir.subscribe(&a, "TQBR", "SBER", "LAST", 1);
        leaf.update(json!(250.5));
        dir.unsubscribe(&a, "TQBR", "SBER", "LAST");

        let leaf = dir.find("TQBR", "SBER", "LAST").unwrap();
        assert!(leaf.is_empty());
        assert_eq!(leaf.value(), Some(json!(250.5)));
        assert!(leaf.update_if_changed(json!(250.5)).is_none());
        assert!(leaf.update_if_changed(json!(251.0)).is_some());
    }

    #[test]
    fn test_random_sequences_stay_consistent() {
        let dir = SubscriptionDirectory::new();
        let sessions: Vec<_> = (1..=3).map(|i| test_session(i).0).collect();
        let classes = ["TQBR", "SPBFUT"];
        let securities = ["SBER", "GAZP", "LKOH"];
        let params = ["LAST", "BID", "OFFER"];
        let mut rng = StdRng::seed_from_u64(42);

        for step in 0..500 {
            let session = &sessions[rng.gen_range(0..sessions.len())];
            let class = classes[rng.gen_range(0..classes.len())];
            let security = securities[rng.gen_range(0..securities.len())];
            let param = params[rng.gen_range(0..params.len())];
            match rng.gen_range(0..10) {
                0..=5 => {
                    dir.subscribe(session, class, security, param, step);
                }
                6..=8 => {
                    dir.unsubscribe(session, class, security, param);
                }
                _ => {
                    dir.clear_all(session);
                }
            }
        }

        let mut total = 0;
        for session in &sessions {
            assert_consistent(&dir, session);
            total += session.param_subscription_list().len();
        }
        assert_eq!(dir.consumer_count(), total);
    }

    #[test]
    fn test_concurrent_subscribers_on_sibling_securities() {
        let dir = Arc::new(SubscriptionDirectory::new());
        let handles: Vec<_> = (1..=8)
            .map(|i| {
                let dir = dir.clone();
                thread::spawn(move || {
                    let (session, _) = test_session(i);
                    for n in 0..50 {
                        let security = format!("SEC{}", n % 5);
                        dir.subscribe(&session, "TQBR", &security, "LAST", n);
                    }
                    session
                })
            })
            .collect();

        let sessions: Vec<_> = handles.into_iter().map(|h| h.join().unwrap()).collect();
        assert_eq!(dir.consumer_count(), 8 * 5);
        for session in &sessions {
            assert_consistent(&dir, session);
        }
    }
}
