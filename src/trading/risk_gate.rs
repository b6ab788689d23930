// =============================================================================
// Risk gate — pre-entry limits protecting capital
// =============================================================================
//
// Checks run in order: duplicate coin, max open positions, daily open cap.
// The daily counter resets automatically when the calendar date rolls over.
// =============================================================================

use chrono::Utc;
use tracing::{info, warn};

/// Entry gate consulted before every position open.
#[derive(Debug)]
pub struct RiskGate {
    max_open_positions: usize,
    /// Daily cap on opened positions; `None` disables the cap.
    max_daily_opens: Option<u32>,
    daily_opens: u32,
    current_date: String,
}

impl RiskGate {
    pub fn new(max_open_positions: usize, max_daily_opens: Option<u32>) -> Self {
        Self {
            max_open_positions,
            max_daily_opens,
            daily_opens: 0,
            current_date: Utc::now().format("%Y-%m-%d").to_string(),
        }
    }

    /// Check whether a position may be opened for `coin` right now.
    ///
    /// Returns `(true, None)` when all gates are clear, or `(false,
    /// Some(reason))` naming the tripped gate.
    pub fn can_open_position(
        &mut self,
        coin: &str,
        open_positions: usize,
        coin_already_open: bool,
    ) -> (bool, Option<String>) {
        self.maybe_reset_daily();

        if coin_already_open {
            return (false, Some(format!("{coin}: position already open")));
        }

        if open_positions >= self.max_open_positions {
            let msg = format!(
                "max open positions reached: {open_positions} (limit {})",
                self.max_open_positions
            );
            warn!("{}", msg);
            return (false, Some(msg));
        }

        if let Some(cap) = self.max_daily_opens {
            if self.daily_opens >= cap {
                let msg = format!("daily open cap reached: {} (limit {cap})", self.daily_opens);
                warn!("{}", msg);
                return (false, Some(msg));
            }
        }

        (true, None)
    }

    /// Record a successful open.
    pub fn record_open(&mut self) {
        self.maybe_reset_daily();
        self.daily_opens += 1;
    }

    fn maybe_reset_daily(&mut self) {
        let today = Utc::now().format("%Y-%m-%d").to_string();
        if self.current_date != today {
            info!(
                old_date = %self.current_date,
                new_date = %today,
                "date rolled — resetting daily open counter"
            );
            self.daily_opens = 0;
            self.current_date = today;
        }
    }
}
