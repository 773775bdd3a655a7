// src/monitor/scheduler.rs
//! One periodic task per source. A failing source backs off on its own and
//! never delays the others.

use metrics::counter;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;

use super::{ChangeMonitor, RawContent};
use crate::config::AutoUpdateConfig;

pub const DEFAULT_INITIAL_BACKOFF: Duration = Duration::from_secs(5);

#[derive(Clone, Copy, Debug)]
pub struct BackoffCfg {
    pub initial: Duration,
    pub max: Duration,
}

impl BackoffCfg {
    pub fn from_config(cfg: &AutoUpdateConfig) -> Self {
        Self {
            initial: DEFAULT_INITIAL_BACKOFF.min(cfg.max_backoff()),
            max: cfg.max_backoff(),
        }
    }

    /// Delay after `failures` consecutive failures (`failures >= 1`).
    pub fn delay(&self, failures: u32) -> Duration {
        let exp = failures.saturating_sub(1).min(31);
        self.initial
            .checked_mul(1u32 << exp)
            .unwrap_or(self.max)
            .min(self.max)
    }
}

/// Spawn a poll loop for every configured source. Tasks end when `stop`
/// flips to true or the receiving side of `tx` is dropped.
pub fn spawn_source_tasks(
    monitor: Arc<ChangeMonitor>,
    cfg: &AutoUpdateConfig,
    backoff: BackoffCfg,
    tx: mpsc::Sender<RawContent>,
    stop: watch::Receiver<bool>,
) -> Vec<JoinHandle<()>> {
    monitor
        .source_names()
        .iter()
        .filter_map(|name| monitor.source(name))
        .map(|source| {
            let interval = cfg.poll_interval(&source);
            spawn_one(
                Arc::clone(&monitor),
                source.name,
                interval,
                backoff,
                tx.clone(),
                stop.clone(),
            )
        })
        .collect()
}

fn spawn_one(
    monitor: Arc<ChangeMonitor>,
    name: String,
    interval: Duration,
    backoff: BackoffCfg,
    tx: mpsc::Sender<RawContent>,
    mut stop: watch::Receiver<bool>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        tracing::info!(target: "monitor", source = %name, interval_secs = interval.as_secs(), "source task started");
        let mut failures: u32 = 0;
        loop {
            if *stop.borrow() {
                break;
            }
            let delay = match monitor.poll(&name).await {
                Ok(Some(raw)) => {
                    failures = 0;
                    if tx.send(raw).await.is_err() {
                        break;
                    }
                    interval
                }
                Ok(None) => {
                    failures = 0;
                    interval
                }
                Err(e) => {
                    failures += 1;
                    counter!("autoupdate_fetch_errors_total").increment(1);
                    let d = backoff.delay(failures);
                    tracing::warn!(
                        target: "monitor",
                        source = %name,
                        failures,
                        retry_in_secs = d.as_secs_f64(),
                        "fetch failed: {e}"
                    );
                    d
                }
            };
            tokio::select! {
                _ = tokio::time::sleep(delay) => {}
                changed = stop.changed() => {
                    if changed.is_err() || *stop.borrow() {
                        break;
                    }
                }
            }
        }
        tracing::info!(target: "monitor", source = %name, "source task stopped");
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::FetchError;
    use crate::model::{Priority, SourceConfig};
    use crate::monitor::fetcher::ScriptedFetcher;

    #[test]
    fn backoff_doubles_and_caps() {
        let b = BackoffCfg {
            initial: Duration::from_secs(5),
            max: Duration::from_secs(60),
        };
        assert_eq!(b.delay(1), Duration::from_secs(5));
        assert_eq!(b.delay(2), Duration::from_secs(10));
        assert_eq!(b.delay(4), Duration::from_secs(40));
        assert_eq!(b.delay(5), Duration::from_secs(60));
        assert_eq!(b.delay(200), Duration::from_secs(60));
    }

    #[tokio::test]
    async fn failing_source_does_not_block_others() {
        let sources = vec![
            SourceConfig {
                name: "bad".into(),
                url: "https://x.invalid/bad".into(),
                priority: Priority::High,
                poll_interval_secs: Some(1),
            },
            SourceConfig {
                name: "good".into(),
                url: "https://x.invalid/good".into(),
                priority: Priority::Low,
                poll_interval_secs: Some(1),
            },
        ];
        let f = Arc::new(ScriptedFetcher::new());
        for _ in 0..3 {
            f.push(
                "bad",
                Err(FetchError::Transport {
                    source_name: "bad".into(),
                    message: "refused".into(),
                }),
            );
        }
        f.push_body("good", "tracker.example\n");

        let cfg = AutoUpdateConfig {
            sources: sources.clone(),
            ..AutoUpdateConfig::default()
        };
        let monitor = Arc::new(ChangeMonitor::new(f, &sources, Duration::from_secs(1)));
        let (tx, mut rx) = mpsc::channel(4);
        let (stop_tx, stop_rx) = watch::channel(false);
        let backoff = BackoffCfg {
            initial: Duration::from_secs(30),
            max: Duration::from_secs(60),
        };
        let handles = spawn_source_tasks(monitor, &cfg, backoff, tx, stop_rx);

        let raw = tokio::time::timeout(Duration::from_secs(2), rx.recv())
            .await
            .expect("good source delivers")
            .expect("channel open");
        assert_eq!(raw.source, "good");

        stop_tx.send(true).unwrap();
        for h in handles {
            tokio::time::timeout(Duration::from_secs(2), h)
                .await
                .expect("task stops")
                .unwrap();
        }
    }
}
