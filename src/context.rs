//! The build context: everything process-wide lives here and is threaded
//! through the API rather than sitting in ambient globals: the phase,
//! the target store, the scope tree, and the target-type registry.

use std::sync::atomic::{AtomicU8, Ordering};

use hashbrown::HashMap;

use crate::scheduler::Scheduler;
use crate::scope::ScopeMap;
use crate::store::TargetSet;
use crate::target::{TargetType, ALIAS, DIR, FILE, FSDIR, MTIME_TARGET, PATH_TARGET, TARGET};

/// Global build lifecycle stage.  Phases are serialised: transitions
/// happen only when the scheduler is quiesced, and match/execute entry
/// points assert the phase they require.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
#[repr(u8)]
pub enum Phase {
    Load = 0,
    Match = 1,
    Execute = 2,
}

impl Phase {
    fn from_u8(v: u8) -> Phase {
        match v {
            0 => Phase::Load,
            1 => Phase::Match,
            2 => Phase::Execute,
            _ => unreachable!("bad phase {}", v),
        }
    }
}

/// Runtime registry of target types.  `extension_order` is the explicit
/// ordered list of types the reverse extension-to-type mapping tries, most
/// likely match first.
pub struct TypeRegistry {
    by_name: HashMap<&'static str, &'static TargetType>,
    pub extension_order: Vec<&'static TargetType>,
}

impl TypeRegistry {
    pub fn new() -> TypeRegistry {
        let mut r = TypeRegistry {
            by_name: HashMap::new(),
            extension_order: Vec::new(),
        };
        for tt in [
            &TARGET,
            &MTIME_TARGET,
            &PATH_TARGET,
            &FILE,
            &ALIAS,
            &DIR,
            &FSDIR,
        ] {
            r.register(tt);
        }
        r
    }

    pub fn register(&mut self, tt: &'static TargetType) {
        self.by_name.insert(tt.name, tt);
    }

    /// Also make the type a candidate for reverse extension mapping.
    pub fn register_with_extension(&mut self, tt: &'static TargetType) {
        self.register(tt);
        self.extension_order.push(tt);
    }

    pub fn find(&self, name: &str) -> Option<&'static TargetType> {
        self.by_name.get(name).copied()
    }
}

impl Default for TypeRegistry {
    fn default() -> Self {
        Self::new()
    }
}

pub struct Context {
    pub types: TypeRegistry,
    pub scopes: ScopeMap,
    pub targets: TargetSet,
    pub keep_going: bool,
    phase: AtomicU8,
}

impl Context {
    pub fn new() -> Context {
        Context {
            types: TypeRegistry::new(),
            scopes: ScopeMap::new(),
            targets: TargetSet::new(),
            keep_going: false,
            phase: AtomicU8::new(Phase::Load as u8),
        }
    }

    pub fn phase(&self) -> Phase {
        Phase::from_u8(self.phase.load(Ordering::Acquire))
    }

    /// Driver-only; callers must have quiesced the scheduler.
    pub fn set_phase(&self, p: Phase) {
        self.phase.store(p as u8, Ordering::Release);
    }

    pub fn assert_phase(&self, p: Phase) {
        let cur = self.phase();
        if cur != p {
            panic!("phase violation: in {:?}, requires {:?}", cur, p);
        }
    }

    /// Variable lookup for a target: target-local assignments, then the
    /// group's, then the scope chain from the target's base scope.
    pub fn lookup(&self, t: &crate::target::Target, name: &str) -> Option<crate::variable::Value> {
        if let Some(v) = t.vars.lock().unwrap().get(name) {
            return Some(v.clone());
        }
        if let Some(&g) = t.group.get() {
            if let Some(v) = self.targets.get(g).vars.lock().unwrap().get(name) {
                return Some(v.clone());
            }
        }
        self.scopes
            .lookup(self.scopes.find(t.out_dir()).id, name)
            .cloned()
    }

    /// Like `lookup`, flattened to a list of strings (empty if unset).
    pub fn lookup_list(&self, t: &crate::target::Target, name: &str) -> Vec<String> {
        self.lookup(t, name)
            .map(|v| v.as_list().to_vec())
            .unwrap_or_default()
    }
}

impl Default for Context {
    fn default() -> Self {
        Self::new()
    }
}

/// A build in flight: the context plus the scheduler driving it.  Passed
/// to rules and recipes.
#[derive(Copy, Clone)]
pub struct Build<'a, 'env> {
    pub ctx: &'env Context,
    pub sched: &'a Scheduler<'env>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn phase_starts_at_load() {
        let ctx = Context::new();
        assert_eq!(ctx.phase(), Phase::Load);
        ctx.set_phase(Phase::Match);
        assert_eq!(ctx.phase(), Phase::Match);
    }

    #[test]
    #[should_panic(expected = "phase violation")]
    fn wrong_phase_is_fatal() {
        let ctx = Context::new();
        ctx.assert_phase(Phase::Execute);
    }

    #[test]
    fn builtin_types_registered() {
        let r = TypeRegistry::new();
        assert!(r.find("file").is_some());
        assert!(r.find("fsdir").is_some());
        assert!(r.find("nope").is_none());
    }
}
