//! Cluster health monitor.
//!
//! Two independent timers: a 1 s leader probe and a 5 s liveness ping.
//! Loss of leadership first reads as `electing`; if the cluster still has
//! no leader after two election timeouts it reads as `dead`. The ping is
//! skipped on learners (they cannot write) and its 2 s timeout comes from
//! the store layer. Listeners subscribe to a broadcast channel; both
//! timers stop on one shared shutdown signal.

use std::time::Duration;

use serde::Serialize;
use tokio::sync::{broadcast, watch};
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use super::Cluster;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum HealthStatus {
    Electing,
    Dead,
    Healthy,
    Learner,
}

impl std::fmt::Display for HealthStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            Self::Electing => "electing",
            Self::Dead => "dead",
            Self::Healthy => "healthy",
            Self::Learner => "learner",
        };
        f.write_str(name)
    }
}

const LEADER_PROBE_INTERVAL: Duration = Duration::from_secs(1);
const LIVENESS_INTERVAL: Duration = Duration::from_secs(5);

pub struct HealthMonitor {
    status: broadcast::Sender<HealthStatus>,
    shutdown: watch::Sender<bool>,
    tasks: Vec<JoinHandle<()>>,
}

impl HealthMonitor {
    #[must_use]
    pub fn spawn(cluster: Cluster, election_timeout: Duration) -> Self {
        let (status, _) = broadcast::channel(16);
        let (shutdown, _) = watch::channel(false);

        let leader_task = {
            let cluster = cluster.clone();
            let status = status.clone();
            let mut shutdown = shutdown.subscribe();

            tokio::spawn(async move {
                let mut ticker = tokio::time::interval(LEADER_PROBE_INTERVAL);
                ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

                loop {
                    tokio::select! {
                        _ = shutdown.changed() => break,
                        _ = ticker.tick() => {
                            match cluster.leader_id().await {
                                Ok(0) => {
                                    let _ = status.send(HealthStatus::Electing);

                                    // Give the election two full timeouts
                                    // before declaring the cluster dead.
                                    tokio::time::sleep(election_timeout * 2).await;
                                    if matches!(cluster.leader_id().await, Ok(0) | Err(_)) {
                                        let _ = status.send(HealthStatus::Dead);
                                    }
                                }
                                Ok(_) => {}
                                Err(err) => {
                                    debug!("leader probe failed: {err:#}");
                                    let _ = status.send(HealthStatus::Dead);
                                }
                            }
                        }
                    }
                }
            })
        };

        let liveness_task = {
            let status = status.clone();
            let mut shutdown = shutdown.subscribe();

            tokio::spawn(async move {
                let mut ticker = tokio::time::interval(LIVENESS_INTERVAL);
                ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

                loop {
                    tokio::select! {
                        _ = shutdown.changed() => break,
                        _ = ticker.tick() => {
                            // Learners cannot write to the cluster; just
                            // wait for promotion.
                            match cluster.is_learner().await {
                                Ok(true) => {
                                    let _ = status.send(HealthStatus::Learner);
                                    continue;
                                }
                                Ok(false) => {}
                                Err(err) => {
                                    debug!("learner probe failed: {err:#}");
                                    let _ = status.send(HealthStatus::Dead);
                                    continue;
                                }
                            }

                            if let Err(err) = cluster.ping().await {
                                warn!("unable to write liveness value: {err:#}");
                                let _ = status.send(HealthStatus::Dead);
                            } else {
                                let _ = status.send(HealthStatus::Healthy);
                            }
                        }
                    }
                }
            })
        };

        Self {
            status,
            shutdown,
            tasks: vec![leader_task, liveness_task],
        }
    }

    #[must_use]
    pub fn subscribe(&self) -> broadcast::Receiver<HealthStatus> {
        self.status.subscribe()
    }

    /// Stop both timers; running probes finish their current tick.
    pub async fn shutdown(self) {
        let _ = self.shutdown.send(true);
        for task in self.tasks {
            if let Err(err) = task.await {
                debug!("health task did not stop cleanly: {err}");
            }
        }
    }
}
