//! The target store: a content-addressed registry of all targets, keyed
//! by (type, dir, out, name).  Map mutation is serialised; targets are
//! boxed so references handed out stay valid across inserts.

use std::path::{Path, PathBuf};
use std::sync::Mutex;

use hashbrown::HashMap;

use crate::target::{Target, TargetId, TargetType};

#[derive(PartialEq, Eq, Hash, Clone)]
struct TargetKey {
    type_name: &'static str,
    dir: PathBuf,
    out: PathBuf,
    name: String,
}

struct Inner {
    map: HashMap<TargetKey, usize>,
    list: Vec<Box<Target>>,
}

pub struct TargetSet {
    inner: Mutex<Inner>,
}

impl TargetSet {
    pub fn new() -> TargetSet {
        TargetSet {
            inner: Mutex::new(Inner {
                map: HashMap::new(),
                list: Vec::new(),
            }),
        }
    }

    pub fn len(&self) -> usize {
        self.inner.lock().unwrap().list.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn get(&self, id: TargetId) -> &Target {
        let inner = self.inner.lock().unwrap();
        let p: *const Target = &*inner.list[id.0];
        // Safety: targets are boxed and never removed or replaced until
        // the set itself is dropped, so the pointee outlives the borrow
        // of self that the caller holds.
        unsafe { &*p }
    }

    /// Load-phase mutable access (prerequisites, members, ad-hoc recipes).
    pub fn get_mut(&mut self, id: TargetId) -> &mut Target {
        let inner = self.inner.get_mut().unwrap();
        let p: *mut Target = &mut *inner.list[id.0];
        // Safety: as in get(); &mut self additionally guarantees no other
        // outstanding borrows.
        unsafe { &mut *p }
    }

    /// Look up an existing target.  If the stored target has an
    /// unspecified extension and the lookup supplies one, the stored
    /// extension is refined in place; a conflicting refinement is fatal.
    pub fn find(
        &self,
        tt: &'static TargetType,
        dir: &Path,
        out: &Path,
        name: &str,
        ext: Option<&str>,
    ) -> Option<TargetId> {
        let inner = self.inner.lock().unwrap();
        let key = TargetKey {
            type_name: tt.name,
            dir: dir.to_path_buf(),
            out: out.to_path_buf(),
            name: name.to_string(),
        };
        let &idx = inner.map.get(&key)?;
        let t = &inner.list[idx];
        if let Some(e) = ext {
            match t.ext() {
                Some(cur) if cur == e => {}
                Some(cur) => panic!(
                    "conflicting extension for target {}: {:?} vs {:?}",
                    t, cur, e
                ),
                None => {
                    tracing::debug!(
                        "assuming target {} is the same as the one with extension {:?}",
                        t,
                        e
                    );
                    t.refine_ext(e);
                }
            }
        }
        Some(TargetId(idx))
    }

    /// Find or create.  Returns the id and whether a target was created.
    pub fn insert(
        &self,
        tt: &'static TargetType,
        dir: PathBuf,
        out: PathBuf,
        name: String,
        ext: Option<String>,
    ) -> (TargetId, bool) {
        if let Some(id) = self.find(tt, &dir, &out, &name, ext.as_deref()) {
            return (id, false);
        }
        let mut inner = self.inner.lock().unwrap();
        let key = TargetKey {
            type_name: tt.name,
            dir: dir.clone(),
            out: out.clone(),
            name: name.clone(),
        };
        // Racing inserters serialise on the lock; re-check under it.
        if let Some(&idx) = inner.map.get(&key) {
            return (TargetId(idx), false);
        }
        let idx = inner.list.len();
        let mut t = Box::new((tt.factory)(tt, dir, out, name, ext));
        t.id = TargetId(idx);
        inner.list.push(t);
        inner.map.insert(key, idx);
        (TargetId(idx), true)
    }

    /// Visit every target.  Ids are dense, so this is a stable index walk
    /// even if visits insert more targets.
    pub fn for_each(&self, mut f: impl FnMut(&Target)) {
        let mut i = 0;
        while i < self.len() {
            f(self.get(TargetId(i)));
            i += 1;
        }
    }
}

impl Default for TargetSet {
    fn default() -> Self {
        Self::new()
    }
}
