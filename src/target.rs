//! Targets and target types: the nodes of the build graph, their runtime
//! type descriptors, and the per-(target, action) op-state that the match
//! and execute engines advance.

use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, AtomicU8, AtomicUsize, Ordering};
use std::sync::{Mutex, MutexGuard, OnceLock};

use anyhow::bail;

use crate::action::{Action, OpId, N_OPERATIONS};
use crate::fs::FileTime;
use crate::prereq::Prerequisite;
use crate::rule::{Recipe, Rule};
use crate::scope::{ScopeId, ScopeMap};
use crate::variable::VarMap;

#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash)]
pub struct TargetId(pub usize);

/// How prerequisites of a given target type are resolved when no target
/// exists yet (see `prereq::search`).
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum SearchKind {
    /// Only an existing target will do.
    Existing,
    /// An existing target, else a file in the src tree.
    File,
    /// An existing target, else an error: silently creating an alias
    /// would do nothing and is most likely not what the author meant.
    Alias,
}

pub type TargetFactory =
    fn(&'static TargetType, PathBuf, PathBuf, String, Option<String>) -> Target;

/// Derives a default extension for a target type, usually by consulting
/// the per-type `extension` variable in scope.
pub type ExtensionFn = fn(&'static TargetType, &ScopeMap, ScopeId) -> Option<String>;

/// Type-specific prerequisite resolution, overriding the default search.
pub type SearchFn =
    fn(&crate::context::Context, &Prerequisite) -> anyhow::Result<Option<TargetId>>;

pub struct TargetType {
    pub name: &'static str,
    pub base: Option<&'static TargetType>,
    /// Whether names of this type carry extensions at all.
    pub uses_ext: bool,
    /// See-through groups expose their members to the match engine.
    pub see_through: bool,
    pub search: SearchKind,
    /// Overrides `search` entirely when set.
    pub custom_search: Option<SearchFn>,
    pub factory: TargetFactory,
    pub default_ext: Option<ExtensionFn>,
}

impl TargetType {
    /// Walk the base chain.
    pub fn is_a(&'static self, tt: &'static TargetType) -> bool {
        let mut t = Some(self);
        while let Some(c) = t {
            if std::ptr::eq(c, tt) {
                return true;
            }
            t = c.base;
        }
        false
    }
}

impl PartialEq for TargetType {
    fn eq(&self, other: &Self) -> bool {
        std::ptr::eq(self, other)
    }
}
impl Eq for TargetType {}

impl std::fmt::Debug for TargetType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.name)
    }
}

pub fn target_factory(
    tt: &'static TargetType,
    dir: PathBuf,
    out: PathBuf,
    name: String,
    ext: Option<String>,
) -> Target {
    Target::new(tt, dir, out, name, ext)
}

/// Default-extension function reading the per-type `extension` variable.
pub fn ext_from_scope_var(
    tt: &'static TargetType,
    scopes: &ScopeMap,
    base: ScopeId,
) -> Option<String> {
    scopes
        .typed_lookup(base, tt, "extension")
        .and_then(|v| v.as_str().map(str::to_string))
}

pub static TARGET: TargetType = TargetType {
    name: "target",
    base: None,
    uses_ext: false,
    see_through: false,
    search: SearchKind::Existing,
    custom_search: None,
    factory: target_factory,
    default_ext: None,
};

pub static MTIME_TARGET: TargetType = TargetType {
    name: "mtime_target",
    base: Some(&TARGET),
    uses_ext: false,
    see_through: false,
    search: SearchKind::Existing,
    custom_search: None,
    factory: target_factory,
    default_ext: None,
};

pub static PATH_TARGET: TargetType = TargetType {
    name: "path_target",
    base: Some(&MTIME_TARGET),
    uses_ext: true,
    see_through: false,
    search: SearchKind::Existing,
    custom_search: None,
    factory: target_factory,
    default_ext: None,
};

pub static FILE: TargetType = TargetType {
    name: "file",
    base: Some(&PATH_TARGET),
    uses_ext: true,
    see_through: false,
    search: SearchKind::File,
    custom_search: None,
    factory: target_factory,
    default_ext: Some(ext_from_scope_var),
};

pub static ALIAS: TargetType = TargetType {
    name: "alias",
    base: Some(&TARGET),
    uses_ext: false,
    see_through: false,
    search: SearchKind::Alias,
    custom_search: None,
    factory: target_factory,
    default_ext: None,
};

pub static DIR: TargetType = TargetType {
    name: "dir",
    base: Some(&ALIAS),
    uses_ext: false,
    see_through: false,
    search: SearchKind::Alias,
    custom_search: None,
    factory: target_factory,
    default_ext: None,
};

pub static FSDIR: TargetType = TargetType {
    name: "fsdir",
    base: Some(&TARGET),
    uses_ext: false,
    see_through: false,
    search: SearchKind::Existing,
    custom_search: None,
    factory: target_factory,
    default_ext: None,
};

// Observable target states.

#[derive(Debug, Copy, Clone, PartialEq, Eq, PartialOrd, Ord)]
#[repr(u8)]
pub enum TargetState {
    Unknown = 0,
    Unchanged = 1,
    Postponed = 2,
    Changed = 3,
    Failed = 4,
    /// State lives in the target's group.
    Group = 5,
}

impl TargetState {
    pub fn from_u8(v: u8) -> TargetState {
        match v {
            0 => TargetState::Unknown,
            1 => TargetState::Unchanged,
            2 => TargetState::Postponed,
            3 => TargetState::Changed,
            4 => TargetState::Failed,
            5 => TargetState::Group,
            _ => unreachable!("bad target state {}", v),
        }
    }
}

impl std::fmt::Display for TargetState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(match self {
            TargetState::Unknown => "unknown",
            TargetState::Unchanged => "unchanged",
            TargetState::Postponed => "postponed",
            TargetState::Changed => "changed",
            TargetState::Failed => "failed",
            TargetState::Group => "group",
        })
    }
}

/// Combine observed states: failed wins, else changed, else unchanged.
/// Group must be resolved to the group's state before aggregating.
pub fn aggregate(l: TargetState, r: TargetState) -> TargetState {
    assert_ne!(r, TargetState::Group);
    if l >= r {
        l
    } else {
        r
    }
}

// Task-count offsets: the per-(target, action) state machine.  Odd-ish
// stages TOUCHED and MATCHED double as the lock marker; a holder advances
// through them and publishes APPLIED (or reverts to TRIED on unmatch).

pub const COUNT_UNTOUCHED: usize = 0;
pub const COUNT_TOUCHED: usize = 1;
pub const COUNT_TRIED: usize = 2;
pub const COUNT_MATCHED: usize = 3;
pub const COUNT_APPLIED: usize = 4;
pub const COUNT_BUSY: usize = 5;
pub const COUNT_EXECUTED: usize = 6;

pub fn count_is_locked(c: usize) -> bool {
    c == COUNT_TOUCHED || c == COUNT_MATCHED
}

#[derive(Default)]
pub struct OpStateInner {
    /// Name and implementation of the matched rule.
    pub rule: Option<(String, std::sync::Arc<dyn Rule>)>,
    pub recipe: Option<Recipe>,
    /// Targets resolved during match, in prerequisite order.
    pub prerequisite_targets: Vec<TargetId>,
}

pub struct OpState {
    pub task_count: AtomicUsize,
    state: AtomicU8,
    pub dependents: AtomicUsize,
    inner: Mutex<OpStateInner>,
}

impl OpState {
    fn new() -> Self {
        OpState {
            task_count: AtomicUsize::new(COUNT_UNTOUCHED),
            state: AtomicU8::new(TargetState::Unknown as u8),
            dependents: AtomicUsize::new(0),
            inner: Mutex::new(OpStateInner::default()),
        }
    }

    pub fn count(&self) -> usize {
        self.task_count.load(Ordering::Acquire)
    }

    pub fn state(&self) -> TargetState {
        TargetState::from_u8(self.state.load(Ordering::Acquire))
    }

    pub fn set_state(&self, s: TargetState) {
        self.state.store(s as u8, Ordering::Release);
    }

    pub fn inner(&self) -> MutexGuard<'_, OpStateInner> {
        self.inner.lock().unwrap()
    }

    pub fn recipe(&self) -> Option<Recipe> {
        self.inner().recipe.clone()
    }

    fn reset(&self) {
        self.task_count.store(COUNT_UNTOUCHED, Ordering::Release);
        self.state
            .store(TargetState::Unknown as u8, Ordering::Release);
        self.dependents.store(0, Ordering::Release);
        let mut inner = self.inner();
        inner.rule = None;
        inner.recipe = None;
        inner.prerequisite_targets.clear();
    }
}

pub struct Target {
    pub id: TargetId,
    pub tt: &'static TargetType,
    /// Directory the target is in: the out tree for generated targets,
    /// the src tree for targets found there.
    pub dir: PathBuf,
    /// For src-tree targets of an out-of-source build, the corresponding
    /// out directory; empty otherwise.
    pub out: PathBuf,
    pub name: String,
    ext: OnceLock<String>,
    pub vars: Mutex<VarMap>,
    /// Author-declared edges, populated during load.
    pub prerequisites: Vec<Prerequisite>,
    pub group: OnceLock<TargetId>,
    /// Members of a see-through group, populated during load.
    pub members: Vec<TargetId>,
    /// Next link in an ad-hoc group's member chain.
    pub adhoc_member: OnceLock<TargetId>,
    /// Ad-hoc recipes attached during load, keyed by operation.
    pub adhoc: Vec<(OpId, Recipe)>,
    path: OnceLock<PathBuf>,
    mtime: AtomicU64,
    ops: [OpState; N_OPERATIONS],
}

impl Target {
    pub fn new(
        tt: &'static TargetType,
        dir: PathBuf,
        out: PathBuf,
        name: String,
        ext: Option<String>,
    ) -> Target {
        let e = OnceLock::new();
        if let Some(x) = ext {
            e.set(x).unwrap();
        }
        Target {
            id: TargetId(usize::MAX),
            tt,
            dir,
            out,
            name,
            ext: e,
            vars: Mutex::new(VarMap::new()),
            prerequisites: Vec::new(),
            group: OnceLock::new(),
            members: Vec::new(),
            adhoc_member: OnceLock::new(),
            adhoc: Vec::new(),
            path: OnceLock::new(),
            mtime: AtomicU64::new(FileTime::UNKNOWN.raw()),
            ops: std::array::from_fn(|_| OpState::new()),
        }
    }

    pub fn opstate(&self, a: Action) -> &OpState {
        &self.ops[a.index()]
    }

    pub fn state(&self, a: Action) -> TargetState {
        self.opstate(a).state()
    }

    pub fn is_a(&self, tt: &'static TargetType) -> bool {
        self.tt.is_a(tt)
    }

    pub fn ext(&self) -> Option<&str> {
        self.ext.get().map(String::as_str)
    }

    /// Refine an unspecified extension to a concrete value, exactly once.
    /// A second refiner must agree with the first.
    pub fn refine_ext(&self, e: &str) {
        let cur = self.ext.get_or_init(|| e.to_string());
        if cur != e {
            panic!(
                "conflicting extension for target {}: {:?} vs {:?}",
                self, cur, e
            );
        }
    }

    /// The directory that determines the base scope: out position if the
    /// target is in src.
    pub fn out_dir(&self) -> &Path {
        if self.out.as_os_str().is_empty() {
            &self.dir
        } else {
            &self.out
        }
    }

    pub fn try_path(&self) -> Option<&Path> {
        self.path.get().map(PathBuf::as_path)
    }

    pub fn path(&self) -> &Path {
        self.try_path().expect("target path not assigned")
    }

    /// Bind the on-disk path.  Re-binding with a different path means two
    /// rules disagree about where this target lives.
    pub fn bind_path(&self, p: PathBuf) {
        let cur = self.path.get_or_init(|| p.clone());
        if *cur != p {
            panic!(
                "path mismatch for target {}: existing {:?}, derived {:?}",
                self, cur, p
            );
        }
    }

    /// Derive and bind the on-disk path from dir, name, and extension.
    /// The extension comes from the already-refined value, the type's
    /// derivation function, or the rule-supplied default, in that order.
    pub fn derive_path(
        &self,
        scopes: &ScopeMap,
        de: Option<&str>,
    ) -> anyhow::Result<&Path> {
        let ext = match self.ext() {
            Some(e) => e.to_string(),
            None => {
                let derived = self
                    .tt
                    .default_ext
                    .and_then(|f| f(self.tt, scopes, scopes.find(self.out_dir()).id));
                match derived.as_deref().or(de) {
                    Some(e) => {
                        self.refine_ext(e);
                        e.to_string()
                    }
                    None => bail!("no default extension for target {}", self),
                }
            }
        };
        let mut p = self.dir.join(&self.name);
        if !ext.is_empty() {
            let mut s = p.into_os_string();
            s.push(".");
            s.push(&ext);
            p = s.into();
        }
        self.bind_path(p);
        Ok(self.path())
    }

    pub fn mtime(&self) -> FileTime {
        FileTime::from_raw(self.mtime.load(Ordering::Acquire))
    }

    pub fn set_mtime(&self, t: FileTime) {
        self.mtime.store(t.raw(), Ordering::Release);
    }

    /// stat() the bound path if the mtime is not known yet.
    pub fn load_mtime(&self) -> std::io::Result<FileTime> {
        let t = self.mtime();
        if t.is_known() {
            return Ok(t);
        }
        let t = crate::fs::mtime(self.path())?;
        self.set_mtime(t);
        Ok(t)
    }

    /// Drop all per-build op-state.  Only valid while the build is
    /// quiesced (between action batches).
    pub fn reset(&self) {
        for op in &self.ops {
            op.reset();
        }
    }

    pub fn display(&self, verb: u8) -> TargetRef<'_> {
        TargetRef { t: self, verb }
    }
}

/// Prints a target reference: `<type>{<name>[.<ext>]}[@<out>]`, with
/// directory-only targets as `<type>{<dir>/}`.  At verbosity 2 and above
/// the directory prefixes the type and an unassigned extension prints as
/// `?`; an explicitly-empty extension prints as `.`.
pub struct TargetRef<'a> {
    t: &'a Target,
    verb: u8,
}

impl std::fmt::Display for TargetRef<'_> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let t = self.t;
        let v = self.verb;
        if t.name.is_empty() {
            return write!(f, "{}{{{}/}}", t.tt.name, t.dir.display());
        }
        if v >= 2 {
            write!(f, "{}/", t.dir.display())?;
        }
        write!(f, "{}{{{}", t.tt.name, t.name)?;
        if t.tt.uses_ext && v > 0 {
            match t.ext() {
                Some("") => write!(f, ".")?,
                Some(e) => write!(f, ".{}", e)?,
                None if v >= 2 => write!(f, ".?")?,
                None => {}
            }
        }
        write!(f, "}}")?;
        if !t.out.as_os_str().is_empty() {
            write!(f, "@{}", t.out.display())?;
        }
        Ok(())
    }
}

impl std::fmt::Display for Target {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        std::fmt::Display::fmt(&self.display(1), f)
    }
}

impl std::fmt::Debug for Target {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        std::fmt::Display::fmt(&self.display(2), f)
    }
}
