//! JSON operational diff, patch, and transform algebra.
//!
//! Documents are `serde_json` values; a change between two documents is an
//! [`OperationSet`] mapping top-level keys to recursive [`Operation`]s.
//! Three entry points cover the algebra:
//!
//! - [`object_diff`] computes the change set between two objects,
//! - [`apply_object_diff`] replays a change set onto a document,
//! - [`transform_object_diff`] rebases a local change set over a concurrent
//!   upstream one.
//!
//! String edits travel as diff-match-patch patch text (the [`dmp`] module);
//! numeric edits as commuting increments; nested objects and lists recurse.

pub mod apply;
pub mod diff;
pub mod dmp;
pub mod error;
pub mod operation;
pub mod transform;

pub use apply::apply_object_diff;
pub use diff::{object_diff, value_diff};
pub use error::DiffError;
pub use operation::{set_from_value, set_to_value, Operation, OperationSet};
pub use transform::transform_object_diff;
