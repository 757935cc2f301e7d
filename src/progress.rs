use std::sync::Arc;

/// Events emitted during a sync pass for progress reporting
#[derive(Debug, Clone)]
pub enum ProgressEvent {
    /// A pass against one server is starting
    PassStarting { server: String, device: String },

    /// Authentication was negotiated
    Connected { server: String, auth_mode: String },

    /// The remote subscription snapshot has been diffed against the library
    SubscriptionsPulled { to_add: usize, to_remove: usize },

    /// A subscription was added or removed locally
    SubscriptionApplied {
        url: String,
        /// Podcast title, known for removals and successful adds
        title: Option<String>,
        added: bool,
    },

    /// A single subscription could not be applied
    SubscriptionFailed { url: String, error: String },

    /// The full local list replaced the server's list
    SubscriptionsOverwritten { count: usize },

    /// Remote episode actions have been processed
    EpisodeActionsPulled {
        received: usize,
        applied: usize,
        skipped: usize,
    },

    /// Local playback is about to be uploaded
    UploadStarting { actions: usize, chunks: usize },

    /// One upload chunk was accepted
    ChunkUploaded { chunk: usize, size: usize },

    /// One upload chunk failed; the upload continues
    ChunkFailed {
        chunk: usize,
        size: usize,
        error: String,
    },

    /// The pass finished; errors counts recoverable failures only
    PassCompleted {
        server: String,
        subscriptions_added: usize,
        subscriptions_removed: usize,
        actions_applied: usize,
        actions_uploaded: usize,
        errors: usize,
    },
}

/// Trait for reporting progress events during synchronization.
///
/// Implementations can use this to display progress bars, log messages,
/// or collect statistics.
pub trait ProgressReporter: Send + Sync {
    /// Report a progress event
    fn report(&self, event: ProgressEvent);
}

/// A shared reference to a progress reporter
pub type SharedProgressReporter = Arc<dyn ProgressReporter>;

/// A no-op progress reporter that silently ignores all events.
/// Useful for tests or quiet mode.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoopReporter;

impl ProgressReporter for NoopReporter {
    fn report(&self, _event: ProgressEvent) {}
}

impl NoopReporter {
    /// Create a new NoopReporter wrapped in an Arc
    pub fn shared() -> SharedProgressReporter {
        Arc::new(Self)
    }
}


#[cfg(test)]
mod tests {
    use super::recording::RecordingReporter;
    use super::*;

    #[test]
    fn noop_reporter_handles_all_events() {
        let reporter = NoopReporter;

        reporter.report(ProgressEvent::PassStarting {
            server: "alice@https://gpodder.net/".to_string(),
            device: "podsync".to_string(),
        });
        reporter.report(ProgressEvent::SubscriptionsPulled {
            to_add: 2,
            to_remove: 1,
        });
        reporter.report(ProgressEvent::ChunkFailed {
            chunk: 1,
            size: 50,
            error: "HTTP error 500".to_string(),
        });
    }

    #[test]
    fn recording_reporter_keeps_order() {
        let reporter = RecordingReporter::default();
        reporter.report(ProgressEvent::UploadStarting {
            actions: 3,
            chunks: 1,
        });
        reporter.report(ProgressEvent::ChunkUploaded { chunk: 0, size: 3 });

        let events = reporter.events();
        assert_eq!(events.len(), 2);
        assert!(matches!(events[0], ProgressEvent::UploadStarting { .. }));
        assert!(matches!(events[1], ProgressEvent::ChunkUploaded { chunk: 0, size: 3 }));
    }
}
