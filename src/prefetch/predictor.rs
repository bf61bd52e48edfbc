//! Behavior prediction from navigation history.
//!
//! Keeps the last N visited routes, derives a previous-route to next-routes
//! adjacency map from them and suggests the followers of the current route.
//! A suggested route is held back from re-suggestion until its prediction
//! times out.

use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::time::Duration;

use tokio::time::Instant;
use tracing::{debug, warn};

use crate::storage::KeyValueStorage;

/// Storage key of the persisted navigation history.
pub const HISTORY_STORAGE_KEY: &str = "prefetch:navigation-history";

pub struct BehaviorPredictor {
    history: VecDeque<String>,
    limit: usize,
    /// previous route -> next route -> transitions observed
    patterns: HashMap<String, HashMap<String, u32>>,
    /// Predicted routes and when they were queued
    pending: HashMap<String, Instant>,
    prediction_timeout: Duration,
    storage: Option<Arc<dyn KeyValueStorage>>,
}

impl BehaviorPredictor {
    /// Creates a predictor, restoring history from `storage` when present.
    pub fn new(
        limit: usize,
        prediction_timeout: Duration,
        storage: Option<Arc<dyn KeyValueStorage>>,
    ) -> Self {
        let mut predictor = Self {
            history: VecDeque::with_capacity(limit),
            limit: limit.max(1),
            patterns: HashMap::new(),
            pending: HashMap::new(),
            prediction_timeout,
            storage,
        };
        predictor.restore();
        predictor
    }

    /// Records a navigation and returns the followers to prefetch.
    ///
    /// Followers already pending are skipped; returned ones become pending.
    pub fn record(&mut self, route: &str) -> Vec<String> {
        self.history.push_back(route.to_string());
        while self.history.len() > self.limit {
            self.history.pop_front();
        }
        self.rebuild_patterns();
        self.persist();

        self.expire_pending();
        let now = Instant::now();
        let predicted: Vec<String> = self
            .followers(route)
            .into_iter()
            .filter(|next| !self.pending.contains_key(next))
            .collect();
        for next in &predicted {
            self.pending.insert(next.clone(), now);
        }

        if !predicted.is_empty() {
            debug!(route, ?predicted, "predicted next routes");
        }
        predicted
    }

    /// Routes observed after `route`, most frequent first.
    pub fn followers(&self, route: &str) -> Vec<String> {
        let Some(next) = self.patterns.get(route) else {
            return Vec::new();
        };
        let mut ranked: Vec<(&String, &u32)> = next.iter().collect();
        ranked.sort_by(|a, b| b.1.cmp(a.1).then_with(|| a.0.cmp(b.0)));
        ranked.into_iter().map(|(route, _)| route.clone()).collect()
    }

    pub fn history(&self) -> Vec<String> {
        self.history.iter().cloned().collect()
    }

    pub fn history_len(&self) -> usize {
        self.history.len()
    }

    /// Number of distinct routes with at least one observed follower.
    pub fn pattern_count(&self) -> usize {
        self.patterns.len()
    }

    pub fn pending_count(&mut self) -> usize {
        self.expire_pending();
        self.pending.len()
    }

    fn expire_pending(&mut self) {
        let timeout = self.prediction_timeout;
        self.pending
            .retain(|_, queued_at| queued_at.elapsed() < timeout);
    }

    fn rebuild_patterns(&mut self) {
        self.patterns.clear();
        let routes: Vec<&String> = self.history.iter().collect();
        for pair in routes.windows(2) {
            let (from, to) = (pair[0], pair[1]);
            if from == to {
                continue;
            }
            *self
                .patterns
                .entry(from.clone())
                .or_default()
                .entry(to.clone())
                .or_insert(0) += 1;
        }
    }

    fn restore(&mut self) {
        let Some(storage) = &self.storage else {
            return;
        };
        let Some(raw) = storage.get(HISTORY_STORAGE_KEY) else {
            return;
        };
        match serde_json::from_str::<Vec<String>>(&raw) {
            Ok(routes) => {
                let skip = routes.len().saturating_sub(self.limit);
                self.history = routes.into_iter().skip(skip).collect();
                self.rebuild_patterns();
            }
            Err(err) => warn!(error = %err, "ignoring unreadable navigation history"),
        }
    }

    fn persist(&self) {
        let Some(storage) = &self.storage else {
            return;
        };
        let result = serde_json::to_string(&self.history)
            .map_err(anyhow::Error::from)
            .and_then(|raw| storage.set(HISTORY_STORAGE_KEY, &raw));
        if let Err(err) = result {
            warn!(error = %err, "could not persist navigation history");
        }
    }
}

impl std::fmt::Debug for BehaviorPredictor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BehaviorPredictor")
            .field("history", &self.history)
            .field("patterns", &self.patterns.len())
            .field("pending", &self.pending.len())
            .finish()
    }
}
