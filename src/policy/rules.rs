// =============================================================================
// Policy rules — declarative (condition, action) pairs loaded from YAML
// =============================================================================
//
// The rule grammar is closed: only the feature keys and action keys listed in
// the tables below are accepted. A file containing anything else is rejected
// as a whole and the engine runs with an empty rule set — misconfiguration
// surfaces at load time, never at trade time.
//
// File shape:
//
//   rules:
//     - name: veto_hot_anchor
//       priority: 10
//       scope: new_entry
//       when:
//         anchorWinCountGte: 5
//       then:
//         allowTrade: false
// =============================================================================

use std::path::Path;

use anyhow::{bail, Context, Result};
use tracing::{info, warn};

/// Which decision point a rule applies to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RuleScope {
    NewEntry,
    OpenPosition,
    NewEntryBreakdown,
}

impl RuleScope {
    fn parse(s: &str) -> Option<Self> {
        match s {
            "new_entry" => Some(Self::NewEntry),
            "open_position" => Some(Self::OpenPosition),
            "new_entry_breakdown" => Some(Self::NewEntryBreakdown),
            _ => None,
        }
    }
}

/// Features a condition can test.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Feature {
    Shock30mNatr,
    Shock60mNatr,
    AnchorTradeCount,
    AnchorWinCount,
    AnchorLastTradeAgoMin,
    TimeInAnchorZoneMin,
    TpHitsCount,
}

/// Comparison direction encoded in the condition key suffix.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Cmp {
    Gte,
    Lte,
    Eq,
}

/// One `when` entry: `feature <cmp> value`.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RuleCondition {
    pub feature: Feature,
    pub cmp: Cmp,
    pub value: f64,
}

/// Parse a condition key like `anchorWinCountGte` into (feature, cmp).
fn parse_condition_key(key: &str) -> Option<(Feature, Cmp)> {
    Some(match key {
        "shock30mNatrGte" => (Feature::Shock30mNatr, Cmp::Gte),
        "shock30mNatrLte" => (Feature::Shock30mNatr, Cmp::Lte),
        "shock60mNatrGte" => (Feature::Shock60mNatr, Cmp::Gte),
        "shock60mNatrLte" => (Feature::Shock60mNatr, Cmp::Lte),
        "anchorTradeCountGte" => (Feature::AnchorTradeCount, Cmp::Gte),
        "anchorTradeCountLte" => (Feature::AnchorTradeCount, Cmp::Lte),
        "anchorWinCountGte" => (Feature::AnchorWinCount, Cmp::Gte),
        "anchorWinCountLte" => (Feature::AnchorWinCount, Cmp::Lte),
        "anchorLastTradeAgoMinGte" => (Feature::AnchorLastTradeAgoMin, Cmp::Gte),
        "anchorLastTradeAgoMinLte" => (Feature::AnchorLastTradeAgoMin, Cmp::Lte),
        "timeInAnchorZoneMinGte" => (Feature::TimeInAnchorZoneMin, Cmp::Gte),
        "timeInAnchorZoneMinLte" => (Feature::TimeInAnchorZoneMin, Cmp::Lte),
        "tpHitsCountEq" => (Feature::TpHitsCount, Cmp::Eq),
        _ => return None,
    })
}

/// Actions a matched rule contributes to the decision.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct RuleActions {
    pub allow_trade: Option<bool>,
    pub size_multiplier: Option<f64>,
    pub tp_natr_multiplier: Option<f64>,
    pub sl_natr_multiplier: Option<f64>,
}

impl RuleActions {
    pub fn is_empty(&self) -> bool {
        self.allow_trade.is_none()
            && self.size_multiplier.is_none()
            && self.tp_natr_multiplier.is_none()
            && self.sl_natr_multiplier.is_none()
    }
}

/// A validated policy rule.
#[derive(Debug, Clone, PartialEq)]
pub struct PolicyRule {
    pub name: String,
    pub priority: f64,
    pub scope: RuleScope,
    pub when: Vec<RuleCondition>,
    pub then: RuleActions,
}

// ---------------------------------------------------------------------------
// Loading
// ---------------------------------------------------------------------------

/// Load and validate a rules file. Any validation failure yields an empty
/// rule set with a warning; this function never errors out to the caller.
pub fn load_rules(path: impl AsRef<Path>) -> Vec<PolicyRule> {
    let path = path.as_ref();

    let content = match std::fs::read_to_string(path) {
        Ok(c) => c,
        Err(e) => {
            warn!(path = %path.display(), error = %e, "policy rules file unreadable — running without rules");
            return Vec::new();
        }
    };

    match parse_rules(&content) {
        Ok(rules) => {
            info!(path = %path.display(), count = rules.len(), "policy rules loaded");
            rules
        }
        Err(e) => {
            warn!(path = %path.display(), error = %e, "policy rules invalid — running without rules");
            Vec::new()
        }
    }
}

/// Parse and validate the YAML document. Strict: unknown keys anywhere in a
/// rule reject the entire document.
pub fn parse_rules(content: &str) -> Result<Vec<PolicyRule>> {
    let doc: serde_yaml::Value =
        serde_yaml::from_str(content).context("rules file is not valid YAML")?;

    let mapping = doc
        .as_mapping()
        .context("rules file must be a mapping with a `rules` key")?;

    let raw_rules = mapping
        .get(serde_yaml::Value::from("rules"))
        .context("rules file is missing the `rules` key")?
        .as_sequence()
        .context("`rules` must be a sequence")?;

    let mut rules = Vec::with_capacity(raw_rules.len());
    for (index, raw) in raw_rules.iter().enumerate() {
        let rule = parse_rule(raw).with_context(|| format!("rule #{index} is invalid"))?;
        rules.push(rule);
    }
    Ok(rules)
}

fn parse_rule(raw: &serde_yaml::Value) -> Result<PolicyRule> {
    let map = raw.as_mapping().context("rule must be a mapping")?;

    let mut name = None;
    let mut priority = None;
    let mut scope = None;
    let mut when = None;
    let mut then = None;

    for (key, value) in map {
        let key = key.as_str().context("rule keys must be strings")?;
        match key {
            "name" => {
                name = Some(
                    value
                        .as_str()
                        .context("`name` must be a string")?
                        .to_string(),
                )
            }
            "priority" => priority = Some(value.as_f64().context("`priority` must be a number")?),
            "scope" => {
                let s = value.as_str().context("`scope` must be a string")?;
                scope =
                    Some(RuleScope::parse(s).with_context(|| format!("unknown scope `{s}`"))?);
            }
            "when" => when = Some(parse_when(value)?),
            "then" => then = Some(parse_then(value)?),
            other => bail!("unknown rule key `{other}`"),
        }
    }

    let name = name.context("rule is missing `name`")?;
    let priority = priority.context("rule is missing `priority`")?;
    let scope = scope.context("rule is missing `scope`")?;
    let when = when.context("rule is missing `when`")?;
    let then = then.context("rule is missing `then`")?;

    if when.is_empty() {
        bail!("`when` must not be empty");
    }
    if then.is_empty() {
        bail!("`then` must not be empty");
    }

    Ok(PolicyRule {
        name,
        priority,
        scope,
        when,
        then,
    })
}

fn parse_when(value: &serde_yaml::Value) -> Result<Vec<RuleCondition>> {
    let map = value.as_mapping().context("`when` must be a mapping")?;
    let mut conditions = Vec::with_capacity(map.len());

    for (key, value) in map {
        let key = key.as_str().context("`when` keys must be strings")?;
        let (feature, cmp) =
            parse_condition_key(key).with_context(|| format!("unknown condition `{key}`"))?;
        let value = value
            .as_f64()
            .with_context(|| format!("condition `{key}` must be a number"))?;
        conditions.push(RuleCondition {
            feature,
            cmp,
            value,
        });
    }
    Ok(conditions)
}

fn parse_then(value: &serde_yaml::Value) -> Result<RuleActions> {
    let map = value.as_mapping().context("`then` must be a mapping")?;
    let mut actions = RuleActions::default();

    for (key, value) in map {
        let key = key.as_str().context("`then` keys must be strings")?;
        match key {
            "allowTrade" => {
                actions.allow_trade = Some(value.as_bool().context("`allowTrade` must be a bool")?)
            }
            "sizeMultiplier" => {
                actions.size_multiplier =
                    Some(value.as_f64().context("`sizeMultiplier` must be a number")?)
            }
            "tpNatrMultiplier" => {
                actions.tp_natr_multiplier =
                    Some(value.as_f64().context("`tpNatrMultiplier` must be a number")?)
            }
            "slNatrMultiplier" => {
                actions.sl_natr_multiplier =
                    Some(value.as_f64().context("`slNatrMultiplier` must be a number")?)
            }
            other => bail!("unknown action `{other}`"),
        }
    }
    Ok(actions)
}
