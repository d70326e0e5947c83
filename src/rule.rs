//! Rules and recipes.  A rule decides whether it can build a target under
//! an action (`matches`) and prepares a recipe for it (`apply`); the
//! registry holds per-scope registrations keyed by meta-operation,
//! operation, and target type, with wildcards losing to exact entries.

use std::sync::Arc;

use hashbrown::HashMap;

use crate::action::{Action, MetaOpId, OpId};
use crate::context::Build;
use crate::target::{TargetId, TargetState, TargetType};

pub type RecipeFn =
    dyn Fn(&Build, Action, TargetId) -> anyhow::Result<TargetState> + Send + Sync;

/// What to run to realise a target under an action.  The sentinel
/// identities are recognised by the execute engine.
#[derive(Clone)]
pub enum Recipe {
    /// Nothing to do; the target is unchanged by construction.
    Noop,
    /// Execute prerequisites and aggregate their state.
    Default,
    /// Delegate to the target's group.
    Group,
    Func(Arc<RecipeFn>),
}

impl Recipe {
    pub fn func(
        f: impl Fn(&Build, Action, TargetId) -> anyhow::Result<TargetState> + Send + Sync + 'static,
    ) -> Recipe {
        Recipe::Func(Arc::new(f))
    }

    pub fn is_noop(&self) -> bool {
        matches!(self, Recipe::Noop)
    }
}

impl std::fmt::Debug for Recipe {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(match self {
            Recipe::Noop => "noop",
            Recipe::Default => "default",
            Recipe::Group => "group",
            Recipe::Func(_) => "fn",
        })
    }
}

pub trait Rule: Send + Sync {
    /// Whether this rule can handle the target under this action.  The
    /// hint carries the rule name the registration was looked up under
    /// (registrations may share an implementation).
    fn matches(&self, b: &Build, a: Action, t: TargetId, hint: &str) -> anyhow::Result<bool>;

    /// Prepare a recipe.  May search and match prerequisites; runs with
    /// the target lock held.
    fn apply(&self, b: &Build, a: Action, t: TargetId) -> anyhow::Result<Recipe>;
}

/// Wildcard sentinel for meta-operation or operation registrations.
pub const ANY: u8 = 0;

#[derive(PartialEq, Eq, Hash)]
struct RuleKey {
    meta_op: MetaOpId,
    op: OpId,
    /// None is the any-type wildcard.
    type_name: Option<&'static str>,
}

/// Per-scope rule registrations: meta-op × op × target-type → ordered
/// list of named rules.
pub struct RuleMap {
    map: HashMap<RuleKey, Vec<(String, Arc<dyn Rule>)>>,
}

impl RuleMap {
    pub fn new() -> RuleMap {
        RuleMap {
            map: HashMap::new(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.map.is_empty()
    }

    /// Register a rule.  `ANY` for meta-op or op and `None` for the type
    /// registers a wildcard.
    pub fn register(
        &mut self,
        meta_op: MetaOpId,
        op: OpId,
        tt: Option<&'static TargetType>,
        name: &str,
        rule: Arc<dyn Rule>,
    ) {
        self.map
            .entry(RuleKey {
                meta_op,
                op,
                type_name: tt.map(|t| t.name),
            })
            .or_default()
            .push((name.to_string(), rule));
    }

    /// Candidates for (action, target type) in tie-break order: most
    /// derived type first, exact meta-op/op before wildcards, then
    /// declaration order.
    pub fn candidates(
        &self,
        a: Action,
        tt: &'static TargetType,
    ) -> impl Iterator<Item = &(String, Arc<dyn Rule>)> {
        let mut out: Vec<&(String, Arc<dyn Rule>)> = Vec::new();
        let mut chain: Vec<Option<&'static str>> = Vec::new();
        let mut t = Some(tt);
        while let Some(c) = t {
            chain.push(Some(c.name));
            t = c.base;
        }
        chain.push(None);
        for type_name in chain {
            for (meta_op, op) in [
                (a.meta_op, a.op),
                (a.meta_op, ANY),
                (ANY, a.op),
                (ANY, ANY),
            ] {
                if let Some(v) = self.map.get(&RuleKey {
                    meta_op,
                    op,
                    type_name,
                }) {
                    out.extend(v.iter());
                }
            }
        }
        out.into_iter()
    }
}

impl Default for RuleMap {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::action::{perform_update, PERFORM, UPDATE};
    use crate::target::{ALIAS, DIR, FILE};

    struct Dummy;
    impl Rule for Dummy {
        fn matches(&self, _: &Build, _: Action, _: TargetId, _: &str) -> anyhow::Result<bool> {
            Ok(true)
        }
        fn apply(&self, _: &Build, _: Action, _: TargetId) -> anyhow::Result<Recipe> {
            Ok(Recipe::Noop)
        }
    }

    fn names(m: &RuleMap, a: Action, tt: &'static TargetType) -> Vec<String> {
        m.candidates(a, tt).map(|(n, _)| n.clone()).collect()
    }

    #[test]
    fn declaration_order_within_scope() {
        let mut m = RuleMap::new();
        m.register(PERFORM, UPDATE, Some(&FILE), "first", Arc::new(Dummy));
        m.register(PERFORM, UPDATE, Some(&FILE), "second", Arc::new(Dummy));
        assert_eq!(names(&m, perform_update(), &FILE), vec!["first", "second"]);
    }

    #[test]
    fn derived_type_beats_base_beats_wildcard() {
        let mut m = RuleMap::new();
        m.register(PERFORM, UPDATE, None, "any-type", Arc::new(Dummy));
        m.register(PERFORM, UPDATE, Some(&ALIAS), "alias", Arc::new(Dummy));
        m.register(PERFORM, UPDATE, Some(&DIR), "dir", Arc::new(Dummy));
        assert_eq!(
            names(&m, perform_update(), &DIR),
            vec!["dir", "alias", "any-type"]
        );
    }

    #[test]
    fn wildcard_op_loses_to_exact() {
        let mut m = RuleMap::new();
        m.register(PERFORM, ANY, Some(&FILE), "wild", Arc::new(Dummy));
        m.register(PERFORM, UPDATE, Some(&FILE), "exact", Arc::new(Dummy));
        assert_eq!(names(&m, perform_update(), &FILE), vec!["exact", "wild"]);
    }
}
