use chrono::{DateTime, Utc};
use futures::future::BoxFuture;
use std::time::Duration;

/// Source of wall-clock timestamps and delays for the orchestrator.
pub trait Timer: Send + Sync {
    fn now(&self) -> DateTime<Utc>;

    /// A future that resolves once `duration` has elapsed. Dropping it cancels the wait.
    fn sleep(&self, duration: Duration) -> BoxFuture<'static, ()>;
}

#[derive(Debug, Default, Clone)]
pub struct TokioTimer;

impl Timer for TokioTimer {
    fn now(&self) -> DateTime<Utc> {
        Utc::now()
    }

    fn sleep(&self, duration: Duration) -> BoxFuture<'static, ()> {
        Box::pin(tokio::time::sleep(duration))
    }
}
