pub mod labels;
pub mod types;

pub use labels::{LabelSet, ObjectKind, ServiceLabels, keys};
pub use types::*;
