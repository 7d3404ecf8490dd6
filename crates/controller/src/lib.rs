//! kview controller: hosts `ReconciliationView`s. Watches the types their
//! ownership rules mention, maps changed objects back to views, and keeps each
//! view's status (trees, change log, summary, dry-run plan) current.

#![forbid(unsafe_code)]

use std::time::Duration;

pub mod controller;
pub mod live;
pub mod resources;
pub mod status;

pub use controller::{ControllerEvent, ViewController};
pub use resources::{
    target_ref, view_key, CelExpression, ConfigMapRef, Definition, DryRun, ReconciliationView, ReconciliationViewSpec,
    ReconciliationViewStatus, StateEvaluationExpression, TargetObject, ViewDefinition, ViewDefinitionSpec,
};
pub use status::{delete_unused_revisions, status_patch, KubeStatusWriter, StatusWriter, ViewContext, ViewState, REASON_INVALID_DESIRED_SPEC};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ControllerConfig {
    /// Flush interval of the change batcher and the update scheduler.
    pub batch: Duration,
    /// Capacity of the watch event and completion channels.
    pub queue_cap: usize,
    /// Delay before a failed view update is retried.
    pub retry: Duration,
}

impl Default for ControllerConfig {
    fn default() -> Self {
        Self { batch: Duration::from_millis(50), queue_cap: 2048, retry: Duration::from_secs(2) }
    }
}

impl ControllerConfig {
    pub fn from_env() -> Self {
        let d = Self::default();
        let ms = |var: &str| std::env::var(var).ok().and_then(|s| s.parse::<u64>().ok()).map(Duration::from_millis);
        Self {
            batch: ms("KVIEW_BATCH_MS").unwrap_or(d.batch),
            queue_cap: std::env::var("KVIEW_QUEUE_CAP").ok().and_then(|s| s.parse().ok()).unwrap_or(d.queue_cap),
            retry: ms("KVIEW_RETRY_MS").unwrap_or(d.retry),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults() {
        let c = ControllerConfig::default();
        assert_eq!(c.batch, Duration::from_millis(50));
        assert_eq!(c.queue_cap, 2048);
    }
}
