//! Delays between delivery attempts.

use crate::core::Clock;
use async_trait::async_trait;
use std::time::Duration;

/// A `Clock` backed by the tokio timer.
#[derive(Debug, Clone, Copy, Default)]
pub struct TokioClock;

#[async_trait]
impl Clock for TokioClock {
    async fn sleep(&self, duration: Duration) {
        tokio::time::sleep(duration).await;
    }
}
