//! Scheduled polling loop tying fetcher, engine, and state store together.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context as _;
use rand::Rng;
use tokio::sync::Notify;
use tracing::{error, info, warn};

use crate::engine::Reconciler;
use crate::fetch::DataFetcher;
use crate::models::{Fluid, FluidResult};
use crate::store::StateStore;

/// How many quick retries an HTTP 401 earns before the poller falls back
/// to the regular interval.
const AUTH_RETRY_MAX: u32 = 3;
const AUTH_RETRY_DELAY: Duration = Duration::from_secs(30);

/// Never poll more often than this regardless of configuration.
const MIN_INTERVAL_SECS: i64 = 60;

pub struct Poller {
    fetcher: DataFetcher,
    reconciler: Reconciler,
    store: Arc<dyn StateStore>,
    refresh: Arc<Notify>,
}

impl Poller {
    pub fn new(
        fetcher: DataFetcher,
        reconciler: Reconciler,
        store: Arc<dyn StateStore>,
    ) -> Self {
        Self {
            fetcher,
            reconciler,
            store,
            refresh: Arc::new(Notify::new()),
        }
    }

    /// Handle used to trigger an immediate poll from outside the loop.
    pub fn refresh_handle(&self) -> Arc<Notify> {
        self.refresh.clone()
    }

    /// One full cycle: load state, fetch, reconcile every fluid, save.
    ///
    /// Polls are serial by construction; nothing else mutates the state
    /// between load and save.
    pub async fn poll_once(&self) -> anyhow::Result<BTreeMap<Fluid, FluidResult>> {
        let mut state = self.store.load().await.context("loading collector state")?;
        let snapshots = self.fetcher.fetch().await?;

        let mut results = BTreeMap::new();
        for fluid in Fluid::ALL {
            let Some(snapshot) = snapshots.get(&fluid) else {
                continue;
            };
            let fluid_state = state.fluids.entry(fluid.key().to_string()).or_default();
            let result = self.reconciler.reconcile(fluid, snapshot, fluid_state).await;
            results.insert(fluid, result);
        }

        self.store
            .save(&state)
            .await
            .context("saving collector state")?;
        Ok(results)
    }

    /// Serial polling loop. Runs until the task is dropped or aborted.
    ///
    /// Jitter is drawn once at startup so all configured accounts do not
    /// hit the provider in lockstep; the effective interval never drops
    /// below one minute.
    pub async fn run(&self, base_secs: u64, jitter_secs: u64) {
        let jitter = if jitter_secs == 0 {
            0
        } else {
            rand::thread_rng().gen_range(-(jitter_secs as i64)..=jitter_secs as i64)
        };
        let effective = (base_secs as i64 + jitter).max(MIN_INTERVAL_SECS) as u64;
        let interval = Duration::from_secs(effective);
        info!(interval_secs = effective, "polling started");

        let mut auth_retries = 0u32;
        loop {
            match self.poll_once().await {
                Ok(results) => {
                    auth_retries = 0;
                    info!(fluids = results.len(), "poll completed");
                }
                Err(err) if is_unauthorized(&err) && auth_retries < AUTH_RETRY_MAX => {
                    auth_retries += 1;
                    warn!(
                        attempt = auth_retries,
                        max = AUTH_RETRY_MAX,
                        "authentication failed; retrying shortly"
                    );
                    tokio::time::sleep(AUTH_RETRY_DELAY).await;
                    continue;
                }
                Err(err) if is_unauthorized(&err) => {
                    error!(%err, "authentication retries exhausted; waiting for next cycle");
                }
                Err(err) => {
                    auth_retries = 0;
                    error!(%err, "poll failed");
                }
            }

            tokio::select! {
                _ = tokio::time::sleep(interval) => {}
                _ = self.refresh.notified() => {
                    info!("manual refresh requested");
                }
            }
        }
    }
}

fn is_unauthorized(err: &anyhow::Error) -> bool {
    err.downcast_ref::<crate::error::Error>()
        .map(crate::error::Error::is_unauthorized)
        .unwrap_or(false)
}
