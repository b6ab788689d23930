pub mod ledger;
pub mod state;

pub use ledger::{EntryPlan, PositionLedger};
pub use state::{PositionState, TpTarget};
