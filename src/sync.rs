// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

use std::sync::Arc;

use tokio_util::sync::CancellationToken;
use tracing::{info, instrument, warn};

use crate::config::{RemoteServer, SyncSettings};
use crate::cursor::CursorStore;
use crate::device::{Device, DeviceRegistry, DeviceSelector, REMOTE_DEVICE_TYPE};
use crate::episodes::{EpisodeSynchronizer, UploadOptions};
use crate::error::{ItemError, SyncError, VaultError};
use crate::http::SessionFactory;
use crate::progress::{NoopReporter, ProgressEvent, SharedProgressReporter};
use crate::remote::{AuthMode, Credentials, GpodderTransport};
use crate::state::StateFile;
use crate::store::{PlaybackStore, SubscriptionStore};
use crate::subscriptions::SubscriptionReconciler;
use crate::vault::CredentialVault;

/// Options for one sync invocation
#[derive(Debug, Clone)]
pub struct SyncOptions {
    /// Which local device the pass runs as
    pub selector: DeviceSelector,
    /// Zero the cursors and overwrite the server's subscription list
    pub force_full: bool,
}

impl Default for SyncOptions {
    fn default() -> Self {
        Self {
            selector: DeviceSelector::Default,
            force_full: false,
        }
    }
}

/// What one pass achieved.
///
/// A pass that returns a report always ran to the end; pass-fatal problems
/// come back as [`SyncError`] instead.
#[derive(Debug)]
pub struct SyncReport {
    pub server: String,
    pub device: Device,
    pub auth_mode: AuthMode,
    pub subscriptions_added: usize,
    pub subscriptions_removed: usize,
    /// Set when the pass replaced the server's list
    pub subscriptions_overwritten: Option<usize>,
    pub actions_applied: usize,
    pub actions_uploaded: usize,
    /// Recoverable failures, in the order they happened
    pub errors: Vec<ItemError>,
}

impl SyncReport {
    fn new(server: String, device: Device, auth_mode: AuthMode) -> Self {
        Self {
            server,
            device,
            auth_mode,
            subscriptions_added: 0,
            subscriptions_removed: 0,
            subscriptions_overwritten: None,
            actions_applied: 0,
            actions_uploaded: 0,
            errors: Vec::new(),
        }
    }

    /// Nothing changed locally and nothing failed
    pub fn is_in_sync(&self) -> bool {
        self.subscriptions_added == 0
            && self.subscriptions_removed == 0
            && self.actions_applied == 0
            && self.errors.is_empty()
    }

    pub fn has_errors(&self) -> bool {
        !self.errors.is_empty()
    }
}

/// Outcome of the pass against one configured server
#[derive(Debug)]
pub struct PassResult {
    pub server: String,
    pub result: Result<SyncReport, SyncError>,
}

/// Runs sync passes for users against their configured servers
pub struct SyncEngine<F> {
    sessions: F,
    registry: DeviceRegistry,
    cursors: CursorStore,
    subscriptions: Arc<dyn SubscriptionStore>,
    playback: Arc<dyn PlaybackStore>,
    vault: Arc<CredentialVault>,
    system_user_id: i64,
    reporter: SharedProgressReporter,
}

impl<F: SessionFactory> SyncEngine<F> {
    pub fn new<L>(
        sessions: F,
        state: Arc<StateFile>,
        library: Arc<L>,
        vault: Arc<CredentialVault>,
        system_user_id: i64,
    ) -> Self
    where
        L: SubscriptionStore + PlaybackStore + 'static,
    {
        Self {
            sessions,
            registry: DeviceRegistry::new(state.clone(), system_user_id),
            cursors: CursorStore::new(state),
            subscriptions: library.clone(),
            playback: library,
            vault,
            system_user_id,
            reporter: NoopReporter::shared(),
        }
    }

    pub fn with_reporter(mut self, reporter: SharedProgressReporter) -> Self {
        self.reporter = reporter;
        self
    }

    pub fn registry(&self) -> &DeviceRegistry {
        &self.registry
    }

    pub fn cursors(&self) -> &CursorStore {
        &self.cursors
    }

    /// One pass per server selected by the user's sync mode.
    ///
    /// Each server gets its own result; a failure on one does not skip the
    /// next.
    pub async fn sync_user(
        &self,
        user_id: i64,
        settings: &SyncSettings,
        options: &SyncOptions,
        cancel: &CancellationToken,
    ) -> Result<Vec<PassResult>, SyncError> {
        let targets = settings.targets();
        if targets.is_empty() {
            info!(user_id, mode = ?settings.mode, "sync disabled");
            return Err(SyncError::Disabled);
        }

        let mut results = Vec::with_capacity(targets.len());
        for server in targets {
            let result = self.run_pass(user_id, server, settings, options, cancel).await;
            if let Err(e) = &result {
                warn!(user_id, server = %server.label(), error = %e, "sync pass failed");
            }
            results.push(PassResult {
                server: server.label(),
                result,
            });
        }
        Ok(results)
    }

    /// A single pass against `server`, bounded by the configured deadline
    pub async fn run_pass(
        &self,
        user_id: i64,
        server: &RemoteServer,
        settings: &SyncSettings,
        options: &SyncOptions,
        cancel: &CancellationToken,
    ) -> Result<SyncReport, SyncError> {
        let deadline = settings.pass_timeout();
        match tokio::time::timeout(deadline, self.pass(user_id, server, settings, options, cancel))
            .await
        {
            Ok(result) => result,
            Err(_) => Err(SyncError::TimedOut(deadline)),
        }
    }

    /// Negotiate authentication against `server` without syncing
    pub async fn connect(
        &self,
        server: &RemoteServer,
        settings: &SyncSettings,
    ) -> Result<GpodderTransport<F::Client>, SyncError> {
        connect(&self.sessions, &self.vault, server, settings).await
    }

    #[instrument(skip_all, fields(user_id = user_id, server = %server.login))]
    async fn pass(
        &self,
        user_id: i64,
        server: &RemoteServer,
        settings: &SyncSettings,
        options: &SyncOptions,
        cancel: &CancellationToken,
    ) -> Result<SyncReport, SyncError> {
        check(cancel)?;

        let device = self
            .registry
            .resolve(
                user_id,
                &options.selector,
                &settings.device_name,
                settings.device_caption.as_deref(),
            )
            .map_err(SyncError::DeviceResolutionFailed)?;

        let cursors = self.cursors.for_server(&server.label());
        if options.force_full {
            info!(device = %device.name, "full resync requested, resetting cursors");
            cursors
                .reset_cursors(user_id, device.id)
                .map_err(SyncError::CursorUnavailable)?;
        }
        let cursor = cursors
            .get_cursors(user_id, device.id)
            .map_err(SyncError::CursorUnavailable)?;

        self.reporter.report(ProgressEvent::PassStarting {
            server: server.label(),
            device: device.name.clone(),
        });

        let transport = self.connect(server, settings).await?;
        self.reporter.report(ProgressEvent::Connected {
            server: server.label(),
            auth_mode: transport.auth_mode().to_string(),
        });
        let mut report = SyncReport::new(server.label(), device.clone(), transport.auth_mode());

        if device.device_type != REMOTE_DEVICE_TYPE
            && let Err(e) = transport.publish_device(&device).await
        {
            warn!(error = %e, "could not publish device");
            report.errors.push(ItemError::RemoteCall {
                call: "publish_device",
                source: e,
            });
        }

        check(cancel)?;
        let reconciler = SubscriptionReconciler::new(
            self.subscriptions.as_ref(),
            &cursors,
            settings.store_retry,
            self.system_user_id,
            self.reporter.clone(),
        );
        let subscriptions = if options.force_full {
            reconciler.force_full(&transport, user_id, &device).await?
        } else {
            reconciler
                .reconcile(&transport, user_id, &device, cursor.last_timestamp)
                .await
        };
        report.subscriptions_added = subscriptions.added.len();
        report.subscriptions_removed = subscriptions.removed.len();
        report.subscriptions_overwritten = subscriptions.overwritten;
        report.errors.extend(subscriptions.errors);

        check(cancel)?;
        let episodes = EpisodeSynchronizer::new(
            self.subscriptions.as_ref(),
            self.playback.as_ref(),
            &cursors,
            settings.store_retry,
            self.reporter.clone(),
        );
        let pulled = episodes
            .pull(&transport, user_id, &device, cursor.episodes_timestamp)
            .await;
        report.actions_applied = pulled.applied;
        report.errors.extend(pulled.errors);

        check(cancel)?;
        let upload = UploadOptions {
            batch_size: settings.upload_batch_size,
            concurrency: settings.upload_concurrency,
            with_guid: server.flavor.requires_episode_guid(),
        };
        let pushed = episodes
            .push(&transport, user_id, &device, upload, cancel)
            .await?;
        report.actions_uploaded = pushed.uploaded;
        report.errors.extend(pushed.errors);

        if let Err(e) = self.registry.touch_last_sync(user_id, device.id) {
            report.errors.push(ItemError::Cursor(e));
        }

        info!(
            added = report.subscriptions_added,
            removed = report.subscriptions_removed,
            applied = report.actions_applied,
            uploaded = report.actions_uploaded,
            errors = report.errors.len(),
            "sync pass finished"
        );
        self.reporter.report(ProgressEvent::PassCompleted {
            server: report.server.clone(),
            subscriptions_added: report.subscriptions_added,
            subscriptions_removed: report.subscriptions_removed,
            actions_applied: report.actions_applied,
            actions_uploaded: report.actions_uploaded,
            errors: report.errors.len(),
        });
        Ok(report)
    }
}

/// Open a session against `server` with fresh clients from `sessions`
pub async fn connect<F: SessionFactory>(
    sessions: &F,
    vault: &CredentialVault,
    server: &RemoteServer,
    settings: &SyncSettings,
) -> Result<GpodderTransport<F::Client>, SyncError> {
    let credentials = open_credentials(vault, server)?;
    GpodderTransport::connect(sessions, settings.request_timeout(), server, credentials).await
}

/// Open the stored token.
///
/// A token that cannot be read at all counts as absent; one that is
/// well-formed but fails authentication under our key is fatal.
fn open_credentials(
    vault: &CredentialVault,
    server: &RemoteServer,
) -> Result<Option<Credentials>, SyncError> {
    let Some(token) = server.encrypted_token.as_deref().filter(|t| !t.is_empty()) else {
        return Ok(None);
    };

    match vault.decrypt(token) {
        Ok(password) => Ok(Some(Credentials {
            username: server.login.clone(),
            password,
        })),
        Err(VaultError::DecryptionFailed) => {
            Err(SyncError::DecryptionFailed(VaultError::DecryptionFailed))
        }
        Err(e) => {
            warn!(server = %server.label(), error = %e, "stored token unusable, treating as absent");
            Ok(None)
        }
    }
}

fn check(cancel: &CancellationToken) -> Result<(), SyncError> {
    if cancel.is_cancelled() {
        return Err(SyncError::Cancelled);
    }
    Ok(())
}
