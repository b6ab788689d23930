pub mod engine;
pub mod risk_gate;

pub use engine::{BounceEngine, EngineEvent};
pub use risk_gate::RiskGate;
