use tokio::sync::broadcast;
use tracing::{debug, info};

const NOTICE_CAPACITY: usize = 32;

/// Non-blocking, user-visible notices for the UI layer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Notice {
    SavedOffline { endpoint: String },
    SyncSummary { synced: usize, failed: usize },
}

impl Notice {
    pub fn message(&self) -> String {
        match self {
            Notice::SavedOffline { .. } => {
                "Saved offline. Changes will sync when you're back online.".to_string()
            }
            Notice::SyncSummary { synced, failed } => {
                let mut parts = Vec::new();
                if *synced > 0 {
                    parts.push(format!("{synced} synced"));
                }
                if *failed > 0 {
                    parts.push(format!("{failed} failed"));
                }
                parts.join(", ")
            }
        }
    }
}

#[derive(Clone)]
pub struct Notifier {
    tx: broadcast::Sender<Notice>,
}

impl Default for Notifier {
    fn default() -> Self {
        Self::new()
    }
}

impl Notifier {
    pub fn new() -> Self {
        let (tx, _rx) = broadcast::channel(NOTICE_CAPACITY);
        Self { tx }
    }

    pub fn emit(&self, notice: Notice) {
        info!(message = %notice.message(), "notice");
        if self.tx.send(notice).is_err() {
            debug!("no notice subscribers");
        }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<Notice> {
        self.tx.subscribe()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn summary_lists_only_non_zero_counts() {
        assert_eq!(
            Notice::SyncSummary { synced: 2, failed: 0 }.message(),
            "2 synced"
        );
        assert_eq!(
            Notice::SyncSummary { synced: 1, failed: 3 }.message(),
            "1 synced, 3 failed"
        );
    }

    #[tokio::test]
    async fn emit_without_subscribers_does_not_block() {
        let notifier = Notifier::new();
        notifier.emit(Notice::SyncSummary { synced: 1, failed: 0 });

        let mut rx = notifier.subscribe();
        notifier.emit(Notice::SavedOffline {
            endpoint: "/api/v1/feedback".into(),
        });
        assert_eq!(
            rx.recv().await.unwrap(),
            Notice::SavedOffline {
                endpoint: "/api/v1/feedback".into()
            }
        );
    }
}
