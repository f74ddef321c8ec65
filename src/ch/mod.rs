mod engine;
mod rule;

pub use engine::ChEngine;
pub use rule::{OwnerSpec, PermAction, PermSpec, Rule, RuleSet};
