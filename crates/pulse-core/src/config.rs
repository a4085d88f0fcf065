use std::collections::{BTreeMap, HashMap};
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use tokio::sync::watch;

use crate::ids::SessionId;

/// Default production reporting interval when the server has not pushed one.
pub const DEFAULT_REPORTING_INTERVAL: Duration = Duration::from_secs(60);

/// Where the remote config stands. `Pending` means the session id may still
/// arrive; `TimedOut` means it never will and sessionless events can be
/// dropped instead of retried forever.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ConfigLoadState {
    Pending,
    Loaded,
    TimedOut,
}

impl ConfigLoadState {
    pub fn is_settled(self) -> bool {
        !matches!(self, Self::Pending)
    }
}

/// One server-pushed suppression rule. An event is suppressed when every
/// criteria pair is present and equal in its metadata. A rule with no
/// criteria suppresses its whole event kind.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct EventFilter {
    #[serde(default)]
    pub criteria: BTreeMap<String, serde_json::Value>,
}

impl EventFilter {
    pub fn suppress_kind() -> Self {
        Self::default()
    }

    pub fn with_criterion(mut self, key: impl Into<String>, value: serde_json::Value) -> Self {
        self.criteria.insert(key.into(), value);
        self
    }

    pub fn matches(&self, metadata: Option<&serde_json::Value>) -> bool {
        if self.criteria.is_empty() {
            return true;
        }
        let Some(meta) = metadata else {
            return false;
        };
        self.criteria.iter().all(|(key, want)| meta.get(key) == Some(want))
    }
}

/// Remote-config/session collaborator as the pipeline sees it. Everything
/// the server controls about delivery cadence and suppression comes in
/// through this seam.
#[async_trait]
pub trait RemoteConfig: Send + Sync {
    /// Session assigned by the server for the current app run, if any yet.
    fn current_session(&self) -> Option<SessionId>;

    /// Session from the previous run, used as a fallback tag.
    fn last_session(&self) -> Option<SessionId>;

    fn is_live_mode(&self) -> bool;

    fn reporting_interval(&self) -> Duration;

    fn load_state(&self) -> ConfigLoadState;

    /// Suppression rules for one event kind. Empty when nothing is filtered.
    fn disabled_filters(&self, kind: &str) -> Vec<EventFilter>;

    /// Resolves once the load state leaves `Pending` and returns the settled
    /// state. Resolves immediately when already settled.
    async fn wait_until_settled(&self) -> ConfigLoadState;
}

/// Session resolved the way records are stamped at persistence time:
/// current session, else last-known session, else none.
pub fn resolve_session(config: &dyn RemoteConfig) -> Option<SessionId> {
    config.current_session().or_else(|| config.last_session())
}

#[derive(Debug)]
struct ConfigState {
    current_session: Option<SessionId>,
    last_session: Option<SessionId>,
    live_mode: bool,
    reporting_interval: Duration,
    filters: HashMap<String, Vec<EventFilter>>,
}

/// In-process `RemoteConfig` backed by plain fields. The host app's config
/// fetcher writes into it as responses arrive; tests drive it directly.
#[derive(Debug)]
pub struct StaticConfig {
    state: RwLock<ConfigState>,
    load_tx: watch::Sender<ConfigLoadState>,
}

impl StaticConfig {
    /// Config that already has its session, as after a completed fetch.
    pub fn loaded(session: SessionId) -> Self {
        let config = Self::pending();
        config.set_current_session(Some(session));
        config.mark_loaded();
        config
    }

    /// Config still waiting on the server.
    pub fn pending() -> Self {
        let (load_tx, _) = watch::channel(ConfigLoadState::Pending);
        Self {
            state: RwLock::new(ConfigState {
                current_session: None,
                last_session: None,
                live_mode: false,
                reporting_interval: DEFAULT_REPORTING_INTERVAL,
                filters: HashMap::new(),
            }),
            load_tx,
        }
    }

    pub fn set_current_session(&self, session: Option<SessionId>) {
        self.state.write().current_session = session;
    }

    pub fn set_last_session(&self, session: Option<SessionId>) {
        self.state.write().last_session = session;
    }

    pub fn set_live_mode(&self, live: bool) {
        self.state.write().live_mode = live;
    }

    pub fn set_reporting_interval(&self, interval: Duration) {
        self.state.write().reporting_interval = interval;
    }

    /// Replace the full suppression rule set, keyed by event kind.
    pub fn set_filters(&self, filters: HashMap<String, Vec<EventFilter>>) {
        self.state.write().filters = filters;
    }

    pub fn mark_loaded(&self) {
        self.load_tx.send_replace(ConfigLoadState::Loaded);
    }

    pub fn mark_timed_out(&self) {
        self.load_tx.send_replace(ConfigLoadState::TimedOut);
    }
}

#[async_trait]
impl RemoteConfig for StaticConfig {
    fn current_session(&self) -> Option<SessionId> {
        self.state.read().current_session.clone()
    }

    fn last_session(&self) -> Option<SessionId> {
        self.state.read().last_session.clone()
    }

    fn is_live_mode(&self) -> bool {
        self.state.read().live_mode
    }

    fn reporting_interval(&self) -> Duration {
        self.state.read().reporting_interval
    }

    fn load_state(&self) -> ConfigLoadState {
        *self.load_tx.borrow()
    }

    fn disabled_filters(&self, kind: &str) -> Vec<EventFilter> {
        self.state
            .read()
            .filters
            .get(kind)
            .cloned()
            .unwrap_or_default()
    }

    async fn wait_until_settled(&self) -> ConfigLoadState {
        let mut rx = self.load_tx.subscribe();
        loop {
            let state = *rx.borrow_and_update();
            if state.is_settled() {
                return state;
            }
            if rx.changed().await.is_err() {
                return *rx.borrow();
            }
        }
    }
}
