// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

use std::collections::HashSet;

use tracing::{debug, info, warn};

use crate::cursor::{CursorKind, CursorStore};
use crate::device::Device;
use crate::error::{ItemError, SyncError};
use crate::http::HttpClient;
use crate::progress::{ProgressEvent, SharedProgressReporter};
use crate::remote::{GpodderTransport, SubscriptionChanges, SubscriptionSnapshot};
use crate::retry::{RetryPolicy, with_backoff};
use crate::store::SubscriptionStore;

/// What a remote snapshot asks of the local library
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SubscriptionDelta {
    /// Remote additions not yet subscribed locally
    pub to_add: Vec<String>,
    /// Local subscriptions the remote has removed
    pub to_remove: Vec<String>,
}

/// Compute `add − local` and `local ∩ remove`, keeping remote order
pub fn diff(local: &[String], snapshot: &SubscriptionSnapshot) -> SubscriptionDelta {
    let local: HashSet<&str> = local.iter().map(String::as_str).collect();

    let mut seen = HashSet::new();
    let to_add = snapshot
        .add
        .iter()
        .filter(|url| !local.contains(url.as_str()) && seen.insert(url.as_str()))
        .cloned()
        .collect();

    let mut seen = HashSet::new();
    let to_remove = snapshot
        .remove
        .iter()
        .filter(|url| local.contains(url.as_str()) && seen.insert(url.as_str()))
        .cloned()
        .collect();

    SubscriptionDelta { to_add, to_remove }
}

/// Result of one reconciliation
#[derive(Debug, Default)]
pub struct ReconcileOutcome {
    /// URLs subscribed during this pass
    pub added: Vec<String>,
    /// URLs unsubscribed during this pass
    pub removed: Vec<String>,
    /// Size of the list sent by a full overwrite
    pub overwritten: Option<usize>,
    pub errors: Vec<ItemError>,
}

/// Applies remote subscription changes to the local library and reports
/// the applied delta back.
pub struct SubscriptionReconciler<'a> {
    store: &'a dyn SubscriptionStore,
    cursors: &'a CursorStore,
    retry: RetryPolicy,
    system_user_id: i64,
    reporter: SharedProgressReporter,
}

impl<'a> SubscriptionReconciler<'a> {
    pub fn new(
        store: &'a dyn SubscriptionStore,
        cursors: &'a CursorStore,
        retry: RetryPolicy,
        system_user_id: i64,
        reporter: SharedProgressReporter,
    ) -> Self {
        Self {
            store,
            cursors,
            retry,
            system_user_id,
            reporter,
        }
    }

    /// Incremental pull, apply and push.
    ///
    /// Never fails the pass: every problem lands in the outcome's errors.
    pub async fn reconcile<C: HttpClient>(
        &self,
        transport: &GpodderTransport<C>,
        user_id: i64,
        device: &Device,
        since: i64,
    ) -> ReconcileOutcome {
        let mut outcome = ReconcileOutcome::default();
        if user_id == self.system_user_id {
            debug!(user_id, "skipping subscriptions of the system user");
            return outcome;
        }

        let snapshot = match transport.pull_subscriptions(&device.name, since).await {
            Ok(snapshot) => snapshot,
            Err(e) => {
                warn!(error = %e, "subscription pull failed");
                outcome.errors.push(ItemError::RemoteCall {
                    call: "pull_subscriptions",
                    source: e,
                });
                return outcome;
            }
        };

        let local = match self.store.list_subscription_urls(user_id).await {
            Ok(local) => local,
            Err(e) => {
                warn!(error = %e, "could not list local subscriptions");
                outcome.errors.push(ItemError::LocalStore {
                    call: "list_subscription_urls",
                    source: e,
                });
                return outcome;
            }
        };

        let delta = diff(&local, &snapshot);
        info!(
            to_add = delta.to_add.len(),
            to_remove = delta.to_remove.len(),
            since,
            "subscription delta"
        );
        self.reporter.report(ProgressEvent::SubscriptionsPulled {
            to_add: delta.to_add.len(),
            to_remove: delta.to_remove.len(),
        });

        for url in &delta.to_add {
            match self.add(user_id, url).await {
                Ok(title) => {
                    self.reporter.report(ProgressEvent::SubscriptionApplied {
                        url: url.clone(),
                        title,
                        added: true,
                    });
                    outcome.added.push(url.clone());
                }
                Err(e) => self.record_failure(&mut outcome, e),
            }
        }

        for url in &delta.to_remove {
            match self.remove(user_id, url).await {
                Ok(title) => {
                    self.reporter.report(ProgressEvent::SubscriptionApplied {
                        url: url.clone(),
                        title: Some(title),
                        added: false,
                    });
                    outcome.removed.push(url.clone());
                }
                Err(e) => self.record_failure(&mut outcome, e),
            }
        }

        let mut cursor = snapshot.timestamp;
        let changes = SubscriptionChanges {
            add: outcome.added.clone(),
            remove: outcome.removed.clone(),
        };
        if !changes.is_empty() {
            match transport
                .push_subscription_changes(&device.name, &changes)
                .await
            {
                Ok(Some(timestamp)) => cursor = cursor.max(timestamp),
                Ok(None) => {}
                Err(e) => {
                    warn!(error = %e, "pushing applied subscription changes failed");
                    outcome.errors.push(ItemError::RemoteCall {
                        call: "push_subscription_changes",
                        source: e,
                    });
                }
            }
        }

        if let Err(e) = self
            .cursors
            .advance_cursor(user_id, device.id, CursorKind::Subscriptions, cursor)
        {
            warn!(error = %e, "could not persist subscription cursor");
            outcome.errors.push(ItemError::Cursor(e));
        }

        outcome
    }

    /// Replace the server's list with the full local list, without reading
    /// remote state first.
    pub async fn force_full<C: HttpClient>(
        &self,
        transport: &GpodderTransport<C>,
        user_id: i64,
        device: &Device,
    ) -> Result<ReconcileOutcome, SyncError> {
        let mut outcome = ReconcileOutcome::default();
        if user_id == self.system_user_id {
            debug!(user_id, "skipping subscriptions of the system user");
            return Ok(outcome);
        }

        let local = match self.store.list_subscription_urls(user_id).await {
            Ok(local) => local,
            Err(e) => {
                warn!(error = %e, "could not list local subscriptions");
                outcome.errors.push(ItemError::LocalStore {
                    call: "list_subscription_urls",
                    source: e,
                });
                return Ok(outcome);
            }
        };

        transport
            .overwrite_subscriptions(&device.name, &local)
            .await
            .map_err(SyncError::OverwriteFailed)?;

        info!(count = local.len(), device = %device.name, "overwrote remote subscriptions");
        self.reporter.report(ProgressEvent::SubscriptionsOverwritten { count: local.len() });
        outcome.overwritten = Some(local.len());
        Ok(outcome)
    }

    async fn add(&self, user_id: i64, url: &str) -> Result<Option<String>, ItemError> {
        let store = self.store;
        with_backoff(&self.retry, "add_from_feed", move || {
            store.add_from_feed(user_id, url)
        })
        .await
        .map_err(|e| ItemError::Subscription {
            url: url.to_string(),
            action: "add",
            reason: e.to_string(),
        })?;

        Ok(store.podcast_title(user_id, url).await.ok().flatten())
    }

    /// Returns the display name of the removed podcast
    async fn remove(&self, user_id: i64, url: &str) -> Result<String, ItemError> {
        let store = self.store;
        let title = match store.podcast_title(user_id, url).await {
            Ok(Some(title)) => title,
            Ok(None) => url.to_string(),
            Err(e) => {
                debug!(url, error = %e, "title lookup failed");
                url.to_string()
            }
        };

        with_backoff(&self.retry, "remove_by_url", move || {
            store.remove_by_url(user_id, url)
        })
        .await
        .map_err(|e| ItemError::Subscription {
            url: url.to_string(),
            action: "remove",
            reason: e.to_string(),
        })?;

        info!(url, title, "removed subscription");
        Ok(title)
    }

    fn record_failure(&self, outcome: &mut ReconcileOutcome, error: ItemError) {
        warn!(error = %error, "skipping subscription");
        if let ItemError::Subscription { url, reason, .. } = &error {
            self.reporter.report(ProgressEvent::SubscriptionFailed {
                url: url.clone(),
                error: reason.clone(),
            });
        }
        outcome.errors.push(error);
    }
}
