use std::sync::Arc;
use std::time::Duration;

use reqwest::Client;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, info};
use url::Url;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Reachability {
    Online,
    Offline,
}

impl Reachability {
    pub fn is_online(self) -> bool {
        matches!(self, Reachability::Online)
    }
}

#[derive(Clone)]
struct Probe {
    http: Client,
    url: Url,
    timeout: Duration,
}

/// Last known reachability plus a transition feed.
///
/// Without a probe the host pushes status with [`ConnectivityMonitor::set`];
/// with one, [`ConnectivityMonitor::check`] asks the network directly.
#[derive(Clone)]
pub struct ConnectivityMonitor {
    status: Arc<watch::Sender<Reachability>>,
    probe: Option<Probe>,
}

impl ConnectivityMonitor {
    pub fn manual(initial: Reachability) -> Self {
        let (tx, _rx) = watch::channel(initial);
        Self {
            status: Arc::new(tx),
            probe: None,
        }
    }

    pub fn with_probe(url: Url, timeout: Duration, initial: Reachability) -> Self {
        let mut monitor = Self::manual(initial);
        monitor.probe = Some(Probe {
            http: Client::new(),
            url,
            timeout,
        });
        monitor
    }

    pub fn current(&self) -> Reachability {
        *self.status.borrow()
    }

    pub fn is_online(&self) -> bool {
        self.current().is_online()
    }

    pub fn set(&self, status: Reachability) {
        let changed = self.status.send_if_modified(|current| {
            if *current == status {
                false
            } else {
                *current = status;
                true
            }
        });
        if changed {
            info!(?status, "connectivity changed");
        }
    }

    /// Independent reachability check. Any HTTP answer from the probe counts as
    /// online; only a failed exchange counts as offline.
    pub async fn check(&self) -> Reachability {
        let Some(probe) = &self.probe else {
            return self.current();
        };
        let status = match probe
            .http
            .head(probe.url.clone())
            .timeout(probe.timeout)
            .send()
            .await
        {
            Ok(_) => Reachability::Online,
            Err(err) => {
                debug!(error = %err, "connectivity probe failed");
                Reachability::Offline
            }
        };
        self.set(status);
        status
    }

    pub fn subscribe(&self) -> watch::Receiver<Reachability> {
        self.status.subscribe()
    }

    pub fn spawn_probe_loop(&self, interval: Duration) -> JoinHandle<()> {
        let monitor = self.clone();
        tokio::spawn(async move {
            loop {
                monitor.check().await;
                tokio::time::sleep(interval).await;
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use wiremock::matchers::method;
    use wiremock::{Mock, MockServer, ResponseTemplate};

    #[tokio::test]
    async fn manual_monitor_reports_and_broadcasts_transitions() {
        let monitor = ConnectivityMonitor::manual(Reachability::Offline);
        let mut rx = monitor.subscribe();

        assert_eq!(monitor.check().await, Reachability::Offline);
        monitor.set(Reachability::Online);

        rx.changed().await.unwrap();
        assert_eq!(*rx.borrow_and_update(), Reachability::Online);
        assert!(monitor.is_online());
    }

    #[tokio::test]
    async fn repeated_status_does_not_notify() {
        let monitor = ConnectivityMonitor::manual(Reachability::Online);
        let mut rx = monitor.subscribe();
        rx.borrow_and_update();

        monitor.set(Reachability::Online);
        assert!(!rx.has_changed().unwrap());
    }

    #[tokio::test]
    async fn probe_treats_any_http_answer_as_online() {
        let server = MockServer::start().await;
        Mock::given(method("HEAD"))
            .respond_with(ResponseTemplate::new(503))
            .mount(&server)
            .await;

        let url = Url::parse(&format!("{}/health", server.uri())).unwrap();
        let monitor =
            ConnectivityMonitor::with_probe(url, Duration::from_secs(2), Reachability::Offline);

        assert_eq!(monitor.check().await, Reachability::Online);
        assert!(monitor.is_online());
    }

    #[tokio::test]
    async fn probe_failure_is_offline() {
        let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap();
        drop(listener);
        let url = Url::parse(&format!("http://{addr}/health")).unwrap();
        let monitor =
            ConnectivityMonitor::with_probe(url, Duration::from_secs(2), Reachability::Online);

        assert_eq!(monitor.check().await, Reachability::Offline);
        assert_eq!(monitor.current(), Reachability::Offline);
    }
}
