//! Background reclamation of idle lab sandboxes.

pub mod optimizer;
pub mod policy;

pub use optimizer::{Optimizer, TickRecord, TickReport};
pub use policy::{ReclamationPolicy, UnobservedPolicy, Verdict};
