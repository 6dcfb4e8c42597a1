//! Periodic idle keep-alive.

use std::sync::Weak;
use std::time::Duration;

use tokio::io::AsyncWrite;
use tokio::time::{Instant, MissedTickBehavior};
use tracing::debug;

use crate::connection::ping::IdlePingOp;
use crate::connection::shared::Shared;

/// Fire an idle ping every `period` until the connection is closed or
/// dropped. A tick that lands while the previous ping is still queued is a
/// no-op.
pub(crate) async fn run_keepalive<W>(shared: Weak<Shared<W>>, period: Duration)
where
    W: AsyncWrite + Unpin + Send + 'static,
{
    let mut ticker = tokio::time::interval_at(Instant::now() + period, period);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        ticker.tick().await;
        let Some(strong) = shared.upgrade() else {
            break;
        };
        if !strong.state().is_active() {
            break;
        }
        if let Some(op) = IdlePingOp::start(&strong) {
            tokio::spawn(op.run());
        }
    }
    debug!(?period, "keepalive stopped");
}
