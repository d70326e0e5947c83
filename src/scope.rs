//! The scope tree: directory-keyed nodes holding variable bindings, the
//! src/out path mapping for out-of-source builds, and rule registrations.
//! Populated during load; read-only afterwards.

use std::path::{Path, PathBuf};

use hashbrown::HashMap;

use crate::rule::RuleMap;
use crate::target::TargetType;
use crate::variable::Value;

#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash)]
pub struct ScopeId(pub usize);

pub const GLOBAL_SCOPE: ScopeId = ScopeId(0);

pub struct Scope {
    pub id: ScopeId,
    pub parent: Option<ScopeId>,
    /// The project root scope this scope belongs to (self for roots; the
    /// global scope is its own root).
    pub root: ScopeId,
    pub out_path: PathBuf,
    pub src_path: PathBuf,
    vars: HashMap<String, Value>,
    /// Target-type-qualified variables, e.g. the per-type `extension`.
    typed_vars: HashMap<(&'static str, String), Value>,
    pub rules: RuleMap,
}

impl Scope {
    pub fn var(&self, name: &str) -> Option<&Value> {
        self.vars.get(name)
    }

    pub fn set_var(&mut self, name: &str, value: Value) {
        self.vars.insert(name.to_string(), value);
    }

    pub fn set_typed_var(&mut self, tt: &'static TargetType, name: &str, value: Value) {
        self.typed_vars.insert((tt.name, name.to_string()), value);
    }

    /// Type-qualified lookup in this scope only, walking the type's base
    /// chain so a variable set on `file` applies to types derived from it.
    pub fn typed_var(&self, tt: &'static TargetType, name: &str) -> Option<&Value> {
        let mut t = Some(tt);
        while let Some(c) = t {
            if let Some(v) = self.typed_vars.get(&(c.name, name.to_string())) {
                return Some(v);
            }
            t = c.base;
        }
        None
    }

    pub fn out_of_source(&self) -> bool {
        self.src_path != self.out_path
    }
}

pub struct ScopeMap {
    scopes: Vec<Scope>,
    by_out: HashMap<PathBuf, ScopeId>,
}

impl ScopeMap {
    pub fn new() -> ScopeMap {
        let mut m = ScopeMap {
            scopes: Vec::new(),
            by_out: HashMap::new(),
        };
        // The global scope covers everything not claimed by a project.
        m.scopes.push(Scope {
            id: GLOBAL_SCOPE,
            parent: None,
            root: GLOBAL_SCOPE,
            out_path: PathBuf::new(),
            src_path: PathBuf::new(),
            vars: HashMap::new(),
            typed_vars: HashMap::new(),
            rules: RuleMap::new(),
        });
        m.by_out.insert(PathBuf::new(), GLOBAL_SCOPE);
        m
    }

    /// Create a scope.  With no parent the scope is a project root (its
    /// own root, parented on the global scope); with a parent it inherits
    /// the parent's root.
    pub fn create(
        &mut self,
        out_path: PathBuf,
        src_path: PathBuf,
        parent: Option<ScopeId>,
    ) -> ScopeId {
        let id = ScopeId(self.scopes.len());
        let (parent, root) = match parent {
            None => (GLOBAL_SCOPE, id),
            Some(p) => (p, self.scopes[p.0].root),
        };
        self.by_out.insert(out_path.clone(), id);
        self.scopes.push(Scope {
            id,
            parent: Some(parent),
            root,
            out_path,
            src_path,
            vars: HashMap::new(),
            typed_vars: HashMap::new(),
            rules: RuleMap::new(),
        });
        id
    }

    /// Create a subdirectory scope, deriving its src path from the
    /// parent's src/out mapping.
    pub fn create_sub(&mut self, parent: ScopeId, out_path: PathBuf) -> ScopeId {
        let p = &self.scopes[parent.0];
        let src_path = match out_path.strip_prefix(&p.out_path) {
            Ok(rel) => p.src_path.join(rel),
            Err(_) => out_path.clone(),
        };
        self.create(out_path, src_path, Some(parent))
    }

    pub fn get(&self, id: ScopeId) -> &Scope {
        &self.scopes[id.0]
    }

    pub fn get_mut(&mut self, id: ScopeId) -> &mut Scope {
        &mut self.scopes[id.0]
    }

    pub fn root_of(&self, s: &Scope) -> &Scope {
        self.get(s.root)
    }

    /// Deepest scope whose out path contains `dir`; the global scope if
    /// none does.
    pub fn find(&self, dir: &Path) -> &Scope {
        for a in dir.ancestors() {
            if let Some(&id) = self.by_out.get(a) {
                return self.get(id);
            }
        }
        self.get(GLOBAL_SCOPE)
    }

    /// Like `find`, but a directory in some project's src tree also
    /// resolves, to the deepest scope containing it.  Discovered headers
    /// mostly live in src.
    pub fn find_any(&self, dir: &Path) -> &Scope {
        let s = self.find(dir);
        if s.id != GLOBAL_SCOPE {
            return s;
        }
        let mut best: Option<&Scope> = None;
        for s in &self.scopes[1..] {
            if dir.starts_with(&s.src_path) {
                match best {
                    Some(b) if b.src_path.components().count() >= s.src_path.components().count() => {}
                    _ => best = Some(s),
                }
            }
        }
        best.unwrap_or_else(|| self.get(GLOBAL_SCOPE))
    }

    /// Variable lookup walking from `from` up through the root to the
    /// global scope.
    pub fn lookup(&self, from: ScopeId, name: &str) -> Option<&Value> {
        let mut cur = Some(from);
        while let Some(id) = cur {
            let s = self.get(id);
            if let Some(v) = s.var(name) {
                return Some(v);
            }
            cur = s.parent;
        }
        None
    }

    pub fn typed_lookup(
        &self,
        from: ScopeId,
        tt: &'static TargetType,
        name: &str,
    ) -> Option<&Value> {
        let mut cur = Some(from);
        while let Some(id) = cur {
            let s = self.get(id);
            if let Some(v) = s.typed_var(tt, name) {
                return Some(v);
            }
            cur = s.parent;
        }
        None
    }

    /// Map a src-tree directory to its out-tree position within `root`.
    pub fn out_src(&self, src_dir: &Path, root: &Scope) -> PathBuf {
        match src_dir.strip_prefix(&root.src_path) {
            Ok(rel) => root.out_path.join(rel),
            Err(_) => src_dir.to_path_buf(),
        }
    }

    /// Scope ids from `from` to the global scope, innermost first.  Rule
    /// lookup iterates this.
    pub fn chain(&self, from: ScopeId) -> Vec<ScopeId> {
        let mut out = Vec::new();
        let mut cur = Some(from);
        while let Some(id) = cur {
            out.push(id);
            cur = self.get(id).parent;
        }
        out
    }
}

impl Default for ScopeMap {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::target::FILE;
    use crate::variable::Value;

    fn two_level() -> (ScopeMap, ScopeId, ScopeId) {
        let mut m = ScopeMap::new();
        let root = m.create(
            PathBuf::from("/w/out"),
            PathBuf::from("/w/src"),
            None,
        );
        let sub = m.create_sub(root, PathBuf::from("/w/out/lib"));
        (m, root, sub)
    }

    #[test]
    fn sub_scope_derives_src() {
        let (m, root, sub) = two_level();
        assert_eq!(m.get(sub).src_path, PathBuf::from("/w/src/lib"));
        assert_eq!(m.get(sub).root, root);
    }

    #[test]
    fn find_longest_prefix() {
        let (m, root, sub) = two_level();
        assert_eq!(m.find(Path::new("/w/out/lib/deep")).id, sub);
        assert_eq!(m.find(Path::new("/w/out/other")).id, root);
        assert_eq!(m.find(Path::new("/elsewhere")).id, GLOBAL_SCOPE);
    }

    #[test]
    fn find_any_resolves_src_dirs() {
        let (m, _, sub) = two_level();
        assert_eq!(m.find_any(Path::new("/w/src/lib")).id, sub);
        assert_eq!(m.find_any(Path::new("/w/out/lib")).id, sub);
    }

    #[test]
    fn lookup_walks_outward() {
        let (mut m, root, sub) = two_level();
        m.get_mut(root).set_var("cc.coptions", Value::from("-O2"));
        m.get_mut(sub).set_var("cc.coptions", Value::from("-O0"));
        assert_eq!(
            m.lookup(sub, "cc.coptions").unwrap().as_str(),
            Some("-O0")
        );
        assert_eq!(
            m.lookup(root, "cc.coptions").unwrap().as_str(),
            Some("-O2")
        );
        assert_eq!(m.lookup(sub, "missing"), None);
    }

    #[test]
    fn typed_lookup_walks_type_chain() {
        let (mut m, root, sub) = two_level();
        m.get_mut(root).set_typed_var(&FILE, "extension", Value::from(""));
        // A lookup from the sub scope for a type derived from file finds
        // the file-level binding in the root scope.
        assert_eq!(
            m.typed_lookup(sub, &FILE, "extension").unwrap().as_str(),
            Some("")
        );
    }

    #[test]
    fn out_src_mapping() {
        let (m, root, _) = two_level();
        let root = m.get(root);
        assert_eq!(
            m.out_src(Path::new("/w/src/lib"), root),
            PathBuf::from("/w/out/lib")
        );
    }
}
