//! Per-element reconciliation: diffing, update-or-create and child
//! collections.

pub mod diff;
pub mod element;
pub mod sites;

pub use diff::{AttributeDiff, FieldChange};
pub use element::ElementReconciler;
pub use sites::{missing_members, reconcile_children};
