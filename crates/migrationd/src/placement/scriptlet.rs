//! Placement scriptlets.
//!
//! A scriptlet is a YAML rule table evaluated against one instance. Rules
//! run in order; each rule whose `when` expression matches applies its
//! `set` actions on top of what earlier rules set, and `stop: true` ends
//! evaluation. Whatever no rule sets falls back to the batch defaults.
//!
//! ```yaml
//! rules:
//!   - set:
//!       project: migrated
//!   - when: os_type == "windows"
//!     set:
//!       target: incus-win
//!       pool: fast
//!       pools:
//!         "Hard disk 2": bulk
//!       networks:
//!         "00:50:56:aa:bb:cc": br-mgmt
//!     stop: true
//! ```
//!
//! Evaluation is a pure function of the instance: no I/O, at most
//! [`MAX_RULES`] rules and expressions bounded by
//! [`MAX_EXPRESSION_LEN`](crate::expr::MAX_EXPRESSION_LEN).

use crate::error::{MigrationError, MigrationResult};
use crate::expr::Expr;
use migration_types::Instance;
use serde::Deserialize;
use std::collections::BTreeMap;

pub const MAX_RULES: usize = 64;

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct Document {
    #[serde(default)]
    rules: Vec<RuleDocument>,
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct RuleDocument {
    #[serde(default)]
    when: Option<String>,
    #[serde(default)]
    set: PlacementDraft,
    #[serde(default)]
    stop: bool,
}

/// Placement fields set by a scriptlet; `None` means "use the default".
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct PlacementDraft {
    pub target: Option<String>,
    pub project: Option<String>,
    /// Pool for every disk without an entry in `pools`.
    pub pool: Option<String>,
    /// Pool per disk name.
    #[serde(default)]
    pub pools: BTreeMap<String, String>,
    /// Network for every NIC without an entry in `networks`.
    pub network: Option<String>,
    /// Network per NIC hardware address.
    #[serde(default)]
    pub networks: BTreeMap<String, String>,
}

impl PlacementDraft {
    fn apply(&mut self, other: &PlacementDraft) {
        if other.target.is_some() {
            self.target.clone_from(&other.target);
        }
        if other.project.is_some() {
            self.project.clone_from(&other.project);
        }
        if other.pool.is_some() {
            self.pool.clone_from(&other.pool);
        }
        if other.network.is_some() {
            self.network.clone_from(&other.network);
        }
        self.pools
            .extend(other.pools.iter().map(|(k, v)| (k.clone(), v.clone())));
        self.networks
            .extend(other.networks.iter().map(|(k, v)| (k.clone(), v.clone())));
    }
}

#[derive(Debug, Clone)]
struct Rule {
    when: Expr,
    set: PlacementDraft,
    stop: bool,
}

/// A compiled scriptlet.
#[derive(Debug, Clone)]
pub struct Scriptlet {
    rules: Vec<Rule>,
}

impl Scriptlet {
    pub fn compile(text: &str) -> MigrationResult<Self> {
        let document: Document = serde_yaml::from_str(text)
            .map_err(|e| MigrationError::Scriptlet(e.to_string()))?;

        if document.rules.len() > MAX_RULES {
            return Err(MigrationError::Scriptlet(format!(
                "{} rules exceed the limit of {}",
                document.rules.len(),
                MAX_RULES
            )));
        }

        let rules = document
            .rules
            .into_iter()
            .enumerate()
            .map(|(index, rule)| {
                let when = match rule.when.as_deref() {
                    None => Expr::always(),
                    Some(text) => Expr::parse(text).map_err(|e| {
                        MigrationError::Scriptlet(format!("rule {}: {}", index + 1, e))
                    })?,
                };
                Ok(Rule {
                    when,
                    set: rule.set,
                    stop: rule.stop,
                })
            })
            .collect::<MigrationResult<Vec<_>>>()?;

        Ok(Self { rules })
    }

    pub fn len(&self) -> usize {
        self.rules.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rules.is_empty()
    }

    /// Evaluates the rules against `instance`.
    pub fn evaluate(&self, instance: &Instance) -> PlacementDraft {
        let mut draft = PlacementDraft::default();
        for rule in &self.rules {
            if !rule.when.matches(instance) {
                continue;
            }
            draft.apply(&rule.set);
            if rule.stop {
                break;
            }
        }
        draft
    }
}
