// =============================================================================
// Policy engine — ordered rule evaluation over context features
// =============================================================================
//
// Rules run in ascending priority. Multiplier actions compose by
// multiplication across every matched rule; `allowTrade` is overwritten, and
// the first matched rule that sets `allowTrade: false` stops evaluation with
// that rule's name as the decision reason.
// =============================================================================

use serde::Serialize;
use tracing::debug;

use super::rules::{Cmp, Feature, PolicyRule, RuleScope};

/// Feature values the engine compares rules against.
#[derive(Debug, Clone, Copy, Default)]
pub struct PolicyFeatures {
    pub shock_30m_natr: f64,
    pub shock_60m_natr: f64,
    pub anchor_trade_count: f64,
    pub anchor_win_count: f64,
    /// Minutes since the anchor's last recorded trade; `None` for anchors
    /// with no history (conditions on this feature then never match).
    pub anchor_last_trade_ago_min: Option<f64>,
    pub time_in_anchor_zone_min: f64,
    pub time_since_entry_min: f64,
    pub tp_hits_count: f64,
}

impl PolicyFeatures {
    fn value(&self, feature: Feature) -> Option<f64> {
        match feature {
            Feature::Shock30mNatr => Some(self.shock_30m_natr),
            Feature::Shock60mNatr => Some(self.shock_60m_natr),
            Feature::AnchorTradeCount => Some(self.anchor_trade_count),
            Feature::AnchorWinCount => Some(self.anchor_win_count),
            Feature::AnchorLastTradeAgoMin => self.anchor_last_trade_ago_min,
            Feature::TimeInAnchorZoneMin => Some(self.time_in_anchor_zone_min),
            Feature::TpHitsCount => Some(self.tp_hits_count),
        }
    }
}

/// The composed outcome of a policy evaluation.
#[derive(Debug, Clone, Serialize)]
pub struct PolicyDecision {
    pub allow_trade: bool,
    pub size_multiplier: f64,
    pub tp_natr_multiplier: f64,
    pub sl_natr_multiplier: f64,
    pub reason: String,
}

impl Default for PolicyDecision {
    fn default() -> Self {
        Self {
            allow_trade: true,
            size_multiplier: 1.0,
            tp_natr_multiplier: 1.0,
            sl_natr_multiplier: 1.0,
            reason: "default".to_string(),
        }
    }
}

/// Rule set holder. Constructed once at startup; rules are immutable after.
#[derive(Debug)]
pub struct PolicyEngine {
    rules: Vec<PolicyRule>,
    enabled: bool,
}

impl PolicyEngine {
    pub fn new(mut rules: Vec<PolicyRule>, enabled: bool) -> Self {
        // Pre-sort ascending by priority; stable so equal priorities keep
        // file order.
        rules.sort_by(|a, b| {
            a.priority
                .partial_cmp(&b.priority)
                .unwrap_or(std::cmp::Ordering::Equal)
        });
        Self { rules, enabled }
    }

    pub fn rule_count(&self) -> usize {
        self.rules.len()
    }

    /// Evaluate all rules of `scope` against `features`.
    pub fn evaluate(&self, scope: RuleScope, features: &PolicyFeatures) -> PolicyDecision {
        let mut decision = PolicyDecision::default();
        if !self.enabled {
            return decision;
        }

        let mut matched_names: Vec<&str> = Vec::new();

        for rule in self.rules.iter().filter(|r| r.scope == scope) {
            if !rule_matches(rule, features) {
                continue;
            }

            debug!(rule = %rule.name, "policy rule matched");

            if let Some(allow) = rule.then.allow_trade {
                decision.allow_trade = allow;
                if !allow {
                    decision.reason = rule.name.clone();
                    return decision;
                }
            }
            if let Some(m) = rule.then.size_multiplier {
                decision.size_multiplier *= m;
            }
            if let Some(m) = rule.then.tp_natr_multiplier {
                decision.tp_natr_multiplier *= m;
            }
            if let Some(m) = rule.then.sl_natr_multiplier {
                decision.sl_natr_multiplier *= m;
            }
            matched_names.push(&rule.name);
        }

        if !matched_names.is_empty() {
            decision.reason = matched_names.join(",");
        }
        decision
    }
}

fn rule_matches(rule: &PolicyRule, features: &PolicyFeatures) -> bool {
    rule.when.iter().all(|cond| {
        let Some(actual) = features.value(cond.feature) else {
            return false;
        };
        match cond.cmp {
            Cmp::Gte => actual >= cond.value,
            Cmp::Lte => actual <= cond.value,
            Cmp::Eq => actual == cond.value,
        }
    })
}
