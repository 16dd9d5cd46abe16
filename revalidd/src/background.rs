use std::fmt::Display;
use std::future::Future;
use std::sync::{Arc, Mutex};

use tokio::task::JoinHandle;
use tracing::warn;

/// Where swallowed background failures end up.
pub trait FailureSink: Send + Sync {
    fn report(&self, task: &str, error: &str);
}

#[derive(Debug, Default, Clone, Copy)]
pub struct TracingSink;

impl FailureSink for TracingSink {
    fn report(&self, task: &str, error: &str) {
        warn!(task, error, "background task failed");
    }
}

/// Keeps every reported failure in memory.
#[derive(Debug, Default)]
pub struct RecordingSink {
    entries: Mutex<Vec<(String, String)>>,
}

impl RecordingSink {
    pub fn entries(&self) -> Vec<(String, String)> {
        match self.entries.lock() {
            Ok(guard) => guard.clone(),
            Err(poisoned) => poisoned.into_inner().clone(),
        }
    }
}

impl FailureSink for RecordingSink {
    fn report(&self, task: &str, error: &str) {
        let entry = (task.to_string(), error.to_string());
        match self.entries.lock() {
            Ok(mut guard) => guard.push(entry),
            Err(poisoned) => poisoned.into_inner().push(entry),
        }
        warn!(task, error, "background task failed");
    }
}

/// Fire-and-forget runner: spawned work never propagates its error, it is
/// handed to the sink instead.
#[derive(Clone)]
pub struct Background {
    sink: Arc<dyn FailureSink>,
}

impl Default for Background {
    fn default() -> Self {
        Self::new(Arc::new(TracingSink))
    }
}

impl Background {
    pub fn new(sink: Arc<dyn FailureSink>) -> Self {
        Self { sink }
    }

    pub fn spawn<F, E>(&self, task: impl Into<String>, work: F) -> JoinHandle<()>
    where
        F: Future<Output = Result<(), E>> + Send + 'static,
        E: Display,
    {
        let task = task.into();
        let sink = Arc::clone(&self.sink);
        tokio::spawn(async move {
            if let Err(err) = work.await {
                sink.report(&task, &err.to_string());
            }
        })
    }

    pub fn report(&self, task: &str, error: &dyn Display) {
        self.sink.report(task, &error.to_string());
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn failures_reach_the_sink_and_successes_do_not() {
        let sink = Arc::new(RecordingSink::default());
        let background = Background::new(sink.clone());

        background
            .spawn("ok", async { Ok::<(), String>(()) })
            .await
            .unwrap();
        background
            .spawn("refresh /api/v1/feedback", async {
                Err::<(), _>("connection reset".to_string())
            })
            .await
            .unwrap();
        background.report("optimistic", &"no such item");

        assert_eq!(
            sink.entries(),
            vec![
                (
                    "refresh /api/v1/feedback".to_string(),
                    "connection reset".to_string()
                ),
                ("optimistic".to_string(), "no such item".to_string()),
            ]
        );
    }
}
