//! Tokio Yield Adapter
//!
//! Implements the `YieldHook` port by giving the worker back to the tokio
//! scheduler. A cancelled token turns the next yield into a teardown.

use std::ops::ControlFlow;

use async_trait::async_trait;
use tokio_util::sync::CancellationToken;

use crate::domain::ports::YieldHook;

/// Yields to tokio; breaks once `cancel` fires.
#[derive(Debug, Clone, Default)]
pub struct TokioYieldHook {
    cancel: CancellationToken,
}

impl TokioYieldHook {
    pub fn new(cancel: CancellationToken) -> Self {
        Self { cancel }
    }
}

#[async_trait]
impl YieldHook for TokioYieldHook {
    async fn yield_now(&self) -> ControlFlow<()> {
        tokio::task::yield_now().await;
        if self.cancel.is_cancelled() {
            ControlFlow::Break(())
        } else {
            ControlFlow::Continue(())
        }
    }
}
