//! Plan Generator: drives reconcile logic against a sandbox until the simulated
//! cluster stops changing, then reports what would happen.

use std::sync::Arc;
use std::time::{Duration, Instant};

use kube::core::DynamicObject;
use kview_core::object::{from_value, generation_of, to_value};
use kview_core::{
    sort_changes, DryRunPhase, DryRunResult, Error, ObjectClient, ObjectReader, ObjectRef, ObjectTreeDiffSummary,
    ReconciliationCycleState, Result, TypeRegistry, REASON_RECONCILE_ERROR, REASON_TIMEOUT,
};
use kview_ownership::{OwnershipRules, TreeBuilder, TreeConfig};
use kview_store::{CaptureStore, DescriptionFormatter};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::diff::{parse_desired_spec, render_spec_diff, spec_revision};
use crate::mock::MockClient;
use crate::reconciler::ReconcilerSet;
use crate::summary::build_object_summaries;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PlanConfig {
    /// Wall-clock budget for the fixed-point loop.
    pub timeout: Duration,
    /// Hard cap on passes; reaching it counts as a timeout.
    pub max_passes: usize,
}

impl Default for PlanConfig {
    fn default() -> Self {
        Self { timeout: Duration::from_millis(1000), max_passes: 64 }
    }
}

impl PlanConfig {
    pub fn from_env() -> Self {
        let d = Self::default();
        let timeout_ms = std::env::var("KVIEW_PLAN_TIMEOUT_MS").ok().and_then(|s| s.parse::<u64>().ok());
        Self {
            timeout: timeout_ms.map(Duration::from_millis).unwrap_or(d.timeout),
            max_passes: std::env::var("KVIEW_PLAN_MAX_PASSES").ok().and_then(|s| s.parse().ok()).unwrap_or(d.max_passes),
        }
    }
}

/// Why the fixed-point loop stopped early.
enum Halt {
    Timeout(String),
    ReconcileError(String),
}

pub struct PlanGenerator {
    rules: Arc<OwnershipRules>,
    registry: Arc<TypeRegistry>,
    reconcilers: Arc<ReconcilerSet>,
    formatter: DescriptionFormatter,
    config: PlanConfig,
    tree: TreeConfig,
}

impl PlanGenerator {
    pub fn new(rules: Arc<OwnershipRules>, registry: Arc<TypeRegistry>, reconcilers: Arc<ReconcilerSet>) -> Self {
        Self {
            rules,
            registry,
            reconcilers,
            formatter: DescriptionFormatter::default(),
            config: PlanConfig::default(),
            tree: TreeConfig::default(),
        }
    }

    pub fn with_config(mut self, config: PlanConfig) -> Self {
        self.config = config;
        self
    }

    pub fn with_tree_config(mut self, tree: TreeConfig) -> Self {
        self.tree = tree;
        self
    }

    pub fn with_formatter(mut self, formatter: DescriptionFormatter) -> Self {
        self.formatter = formatter;
        self
    }

    /// Simulate applying `desired_spec` (YAML, merged into the root's spec) and
    /// return the resulting plan.
    ///
    /// Reconcile failures and timeouts come back as a `Failed` result. Failing to
    /// read the starting state, an unparsable desired spec and cancellation are
    /// errors.
    pub async fn generate(
        &self,
        root: &ObjectRef,
        desired_spec: &str,
        real: &dyn ObjectReader,
        cancel: &CancellationToken,
    ) -> Result<DryRunResult> {
        let t0 = Instant::now();
        metrics::counter!("plan_runs_total", 1u64);

        let current = real.get(root).await?;
        let builder = TreeBuilder::new(&self.rules, &self.registry, self.tree);
        let baseline = builder.build(&current, real).await?;
        let mut capture = CaptureStore::new(self.formatter.clone());
        for obj in baseline.objects.values() {
            capture.load(obj.clone())?;
        }

        let patch = parse_desired_spec(desired_spec)?;
        let (patched, spec_diff) = apply_desired_spec(&current, &patch)?;
        let mut result = DryRunResult {
            desired_spec_revision: spec_revision(desired_spec),
            observed_target_generation: generation_of(&current),
            spec_diff,
            ..Default::default()
        };

        let mock = MockClient::new(real, capture, cancel.clone());
        mock.update(patched).await?;

        let halt = self.run_to_fixed_point(&mock, cancel, t0).await?;
        match halt {
            None => result.phase = DryRunPhase::Succeeded,
            Some(Halt::Timeout(message)) => {
                warn!(root = %root, %message, "plan did not converge");
                metrics::counter!("plan_failures_total", 1u64, "reason" => REASON_TIMEOUT);
                result.phase = DryRunPhase::Failed;
                result.reason = Some(REASON_TIMEOUT.to_string());
                result.message = Some(message);
            }
            Some(Halt::ReconcileError(message)) => {
                warn!(root = %root, %message, "reconcile failed during plan");
                metrics::counter!("plan_failures_total", 1u64, "reason" => REASON_RECONCILE_ERROR);
                result.phase = DryRunPhase::Failed;
                result.reason = Some(REASON_RECONCILE_ERROR.to_string());
                result.message = Some(message);
            }
        }

        result.plan = self.final_state(root, &mock).await?;
        metrics::histogram!("plan_latency_ms", t0.elapsed().as_secs_f64() * 1000.0);
        info!(
            root = %root,
            phase = ?result.phase,
            changes = result.plan.changes.len(),
            took_ms = %t0.elapsed().as_millis(),
            "plan generated"
        );
        Ok(result)
    }

    /// Reconcile every overlay object of a registered type, pass after pass, until a
    /// pass records no change. Cancellation is checked before each reconcile.
    async fn run_to_fixed_point(&self, mock: &MockClient<'_>, cancel: &CancellationToken, t0: Instant) -> Result<Option<Halt>> {
        let deadline = t0 + self.config.timeout;
        for pass in 1..=self.config.max_passes {
            let before = mock.change_count();
            for key in mock.keys() {
                if cancel.is_cancelled() {
                    return Err(Error::Cancelled);
                }
                let Some(reconciler) = self.reconcilers.get(&key.object_type) else { continue };
                if !mock.contains(&key) {
                    continue;
                }
                let remaining = deadline.saturating_duration_since(Instant::now());
                if remaining.is_zero() {
                    return Ok(Some(Halt::Timeout(format!("no fixed point within {:?} ({} passes)", self.config.timeout, pass))));
                }
                let outcome = tokio::select! {
                    _ = cancel.cancelled() => return Err(Error::Cancelled),
                    r = tokio::time::timeout(remaining, reconciler.reconcile(mock, &key)) => r,
                };
                match outcome {
                    Ok(Ok(())) => {}
                    Ok(Err(e)) => {
                        if matches!(e.downcast_ref::<Error>(), Some(Error::Cancelled)) {
                            return Err(Error::Cancelled);
                        }
                        return Ok(Some(Halt::ReconcileError(format!("{key}: {e:#}"))));
                    }
                    Err(_) => {
                        return Ok(Some(Halt::Timeout(format!("reconcile of {key} exceeded the {:?} budget", self.config.timeout))));
                    }
                }
            }
            let produced = mock.change_count() - before;
            debug!(pass, produced, "plan pass finished");
            if produced == 0 {
                metrics::histogram!("plan_passes", pass as f64);
                return Ok(None);
            }
        }
        Ok(Some(Halt::Timeout(format!("still changing after {} passes", self.config.max_passes))))
    }

    async fn final_state(&self, root: &ObjectRef, mock: &MockClient<'_>) -> Result<ReconciliationCycleState> {
        let object_tree = match mock.get_opt(root).await? {
            Some(obj) => Some(TreeBuilder::new(&self.rules, &self.registry, self.tree).build(&obj, mock).await?.tree),
            // Deleted by the simulation.
            None => None,
        };
        let (initial, current) = mock.object_sets();
        let mut changes = mock.changes();
        sort_changes(&mut changes);
        Ok(ReconciliationCycleState {
            summary: ObjectTreeDiffSummary { object_summaries: build_object_summaries(&initial, &current) },
            object_tree,
            changes,
        })
    }
}

/// Merge `patch` into the root's `spec`; returns the patched object and the
/// rendered spec diff.
pub fn apply_desired_spec(root: &DynamicObject, patch: &serde_json::Value) -> Result<(DynamicObject, String)> {
    let mut doc = to_value(root)?;
    let current_spec = doc.get("spec").cloned().unwrap_or(serde_json::Value::Null);
    let mut spec = current_spec.clone();
    json_patch::merge(&mut spec, patch);
    let diff = render_spec_diff(&current_spec, &spec);
    if let Some(o) = doc.as_object_mut() {
        o.insert("spec".to_string(), spec);
    }
    Ok((from_value(doc)?, diff))
}
