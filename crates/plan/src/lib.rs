//! kview plan: dry-run reconciliation against a sandboxed view of the cluster.
//!
//! The [`PlanGenerator`] loads a root's current object tree into a
//! [`kview_store::CaptureStore`], applies a hypothetical spec to the root through
//! a [`MockClient`], then runs registered [`Reconciler`]s against the mock until
//! a pass produces no new change or the time budget runs out.

#![forbid(unsafe_code)]

pub mod diff;
pub mod generator;
pub mod mock;
pub mod reconciler;
pub mod summary;

pub use diff::{parse_desired_spec, render_spec_diff, spec_revision};
pub use generator::{apply_desired_spec, PlanConfig, PlanGenerator};
pub use mock::MockClient;
pub use reconciler::{Reconciler, ReconcilerSet};
pub use summary::build_object_summaries;
