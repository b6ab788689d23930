pub mod engine;
pub mod rules;

pub use engine::{PolicyDecision, PolicyEngine, PolicyFeatures};
pub use rules::{load_rules, PolicyRule, RuleScope};
