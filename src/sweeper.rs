//! Background deletion of expired identifiers.
//!
//! Reads already hide expired data; the sweeper reclaims the space. Each run
//! purges in fixed-size batches and stops after `max_batches_per_run` so a
//! large backlog cannot monopolize the store.

use std::sync::Arc;
use std::time::Duration;
use tokio::time::{interval, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::config::SweepConfig;
use crate::store::ExpirySweep;

/// Start the sweeper. Cancel the returned token to stop it.
pub fn spawn_expiry_sweeper<S: ExpirySweep>(
    store: Arc<S>,
    config: SweepConfig,
) -> CancellationToken {
    let cancel = CancellationToken::new();
    let token = cancel.clone();

    tokio::spawn(async move {
        run_sweep_loop(store, config, token).await;
    });

    cancel
}

async fn run_sweep_loop<S: ExpirySweep>(
    store: Arc<S>,
    config: SweepConfig,
    cancel: CancellationToken,
) {
    let mut ticker = interval(config.interval().max(Duration::from_millis(1)));
    ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

    info!(
        interval_secs = config.interval_secs,
        batch_size = config.batch_size,
        max_batches = config.max_batches_per_run,
        "expiry sweeper started"
    );

    loop {
        tokio::select! {
            _ = cancel.cancelled() => {
                info!("expiry sweeper shutting down");
                break;
            }
            _ = ticker.tick() => {
                sweep_once(store.as_ref(), &config).await;
            }
        }
    }
}

/// One sweep run; returns how many identifiers were purged.
pub async fn sweep_once<S: ExpirySweep + ?Sized>(store: &S, config: &SweepConfig) -> u64 {
    let mut total: u64 = 0;
    let mut batches: u32 = 0;

    while batches < config.max_batches_per_run {
        match store.purge_expired(config.batch_size).await {
            Ok(purged) => {
                total += purged;
                batches += 1;
                if purged < u64::from(config.batch_size) {
                    break;
                }
            }
            Err(e) => {
                warn!(error = %e, "expiry sweep batch failed");
                break;
            }
        }
    }

    if total > 0 {
        info!(total, batches, "expiry sweep completed");
    } else {
        debug!("expiry sweep: nothing to purge");
    }
    total
}
