//! Connectivity Monitor
//!
//! Holds the latest `NetworkState` and announces offline → online edges.
//! Platform integrations push states in through `update`; headless
//! deployments can run a `ReachabilityProbe` against the API instead.

use super::models::{ConnectionType, NetworkState};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{broadcast, watch};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

/// Edge signals emitted by the monitor
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectivityEvent {
    /// Previously offline/unreachable, now connected and reachable
    Restored,
    Lost,
}

pub struct ConnectivityMonitor {
    state: watch::Sender<NetworkState>,
    events: broadcast::Sender<ConnectivityEvent>,
}

impl Default for ConnectivityMonitor {
    fn default() -> Self {
        Self::new()
    }
}

impl ConnectivityMonitor {
    /// Starts offline until the first notification arrives
    pub fn new() -> Self {
        Self::with_state(NetworkState::offline())
    }

    pub fn with_state(initial: NetworkState) -> Self {
        let (state, _) = watch::channel(initial);
        let (events, _) = broadcast::channel(16);
        Self { state, events }
    }

    pub fn current(&self) -> NetworkState {
        *self.state.borrow()
    }

    pub fn is_online(&self) -> bool {
        self.current().is_online()
    }

    /// Apply a platform notification; returns the edge it caused, if any
    pub fn update(&self, next: NetworkState) -> Option<ConnectivityEvent> {
        let previous = self.state.send_replace(next);

        let event = match (previous.is_online(), next.is_online()) {
            (false, true) => Some(ConnectivityEvent::Restored),
            (true, false) => Some(ConnectivityEvent::Lost),
            _ => None,
        };

        match event {
            Some(ConnectivityEvent::Restored) => {
                log::info!("Connectivity restored ({:?})", next.connection_type);
            }
            Some(ConnectivityEvent::Lost) => log::info!("Connectivity lost"),
            None => {}
        }

        if let Some(event) = event {
            let _ = self.events.send(event);
        }

        event
    }

    pub fn subscribe(&self) -> broadcast::Receiver<ConnectivityEvent> {
        self.events.subscribe()
    }
}

// ============================================================================
// Reachability Probe
// ============================================================================

/// Polls the API with `HEAD` and feeds the result into a monitor
///
/// Any HTTP response counts as reachable; a transport error or timeout
/// counts as offline.
pub struct ReachabilityProbe {
    client: reqwest::Client,
    target: url::Url,
    interval: Duration,
}

impl ReachabilityProbe {
    pub fn new(target: url::Url, interval: Duration, timeout: Duration) -> reqwest::Result<Self> {
        Ok(Self {
            client: reqwest::Client::builder().timeout(timeout).build()?,
            target,
            interval,
        })
    }

    /// One probe round
    pub async fn check(&self) -> NetworkState {
        match self.client.head(self.target.clone()).send().await {
            Ok(_) => NetworkState::online(ConnectionType::Unknown),
            Err(e) => {
                log::debug!("Reachability probe failed: {}", e);
                NetworkState {
                    is_connected: !e.is_connect(),
                    is_internet_reachable: false,
                    connection_type: ConnectionType::Unknown,
                }
            }
        }
    }

    /// Probe on an interval until `cancel` fires
    pub fn spawn(
        self,
        monitor: Arc<ConnectivityMonitor>,
        cancel: CancellationToken,
    ) -> JoinHandle<()> {
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(self.interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

            loop {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    _ = ticker.tick() => {
                        let state = self.check().await;
                        monitor.update(state);
                    }
                }
            }

            log::info!("Reachability probe stopped");
        })
    }
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    fn captive_wifi() -> NetworkState {
        NetworkState {
            is_connected: true,
            is_internet_reachable: false,
            connection_type: ConnectionType::Wifi,
        }
    }

    #[test]
    fn test_defaults_to_offline() {
        let monitor = ConnectivityMonitor::new();
        assert!(!monitor.is_online());
    }

    #[test]
    fn test_restored_only_on_edge() {
        let monitor = ConnectivityMonitor::new();
        let mut rx = monitor.subscribe();

        assert_eq!(monitor.update(captive_wifi()), None);
        assert_eq!(
            monitor.update(NetworkState::online(ConnectionType::Wifi)),
            Some(ConnectivityEvent::Restored)
        );
        // Transport change while online is not a new edge
        assert_eq!(monitor.update(NetworkState::online(ConnectionType::Cellular)), None);
        assert_eq!(
            monitor.update(NetworkState::offline()),
            Some(ConnectivityEvent::Lost)
        );

        assert_eq!(rx.try_recv().unwrap(), ConnectivityEvent::Restored);
        assert_eq!(rx.try_recv().unwrap(), ConnectivityEvent::Lost);
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_reachability_reports_reachable_server() {
        let mut server = mockito::Server::new_async().await;
        let _mock = server
            .mock("HEAD", "/")
            .with_status(404)
            .create_async()
            .await;

        let probe = ReachabilityProbe::new(
            url::Url::parse(&server.url()).unwrap(),
            Duration::from_secs(30),
            Duration::from_secs(2),
        )
        .unwrap();

        assert!(probe.check().await.is_online());
    }

    #[tokio::test]
    async fn test_reachability_reports_unreachable_host() {
        // Port 9 (discard) on loopback is not expected to be listening
        let probe = ReachabilityProbe::new(
            url::Url::parse("http://127.0.0.1:9/").unwrap(),
            Duration::from_secs(30),
            Duration::from_secs(2),
        )
        .unwrap();

        assert!(!probe.check().await.is_online());
    }
}
