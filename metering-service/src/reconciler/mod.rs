//! Diff of an expected order against the persisted one.

mod rules;

pub use rules::reconcile;
