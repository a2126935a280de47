use crate::db::{self, Pool};
use crate::discord::ChannelGateway;
use crate::github::SourceGateway;
use crate::reconciler;
use anyhow::Result;
use std::time::Duration;
use tokio::time::MissedTickBehavior;
use tracing::{error, info, instrument};

/// One pass over every tracked account. A failing account is logged and the
/// walk continues, so one bad remote never starves the rest. Returns the
/// number of accounts polled without error.
#[instrument(skip_all)]
pub async fn tick(
    pool: &Pool,
    source: &dyn SourceGateway,
    channels: &dyn ChannelGateway,
) -> Result<usize> {
    let tracked = db::list_tracked(pool).await?;
    let mut polled = 0;
    for (guild_id, account) in tracked {
        match reconciler::poll_account(pool, source, channels, &guild_id, &account).await {
            Ok(report) => {
                polled += 1;
                if !report.announced.is_empty() {
                    info!(
                        guild_id,
                        account,
                        announced = report.announced.len(),
                        "poll announced releases"
                    );
                }
            }
            Err(err) => {
                error!(?err, guild_id, account, "poll failed");
            }
        }
    }
    Ok(polled)
}

/// Fixed-interval poll loop. Runs until the process shuts down; a failed
/// tick (e.g. the store is unreadable) is logged loudly and retried on the
/// next interval rather than crashing the bot.
pub async fn run(
    pool: &Pool,
    source: &dyn SourceGateway,
    channels: &dyn ChannelGateway,
    period: Duration,
) {
    let mut interval = tokio::time::interval(period);
    interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
    loop {
        interval.tick().await;
        if let Err(err) = tick(pool, source, channels).await {
            error!(?err, "scheduler tick failed");
        }
    }
}
