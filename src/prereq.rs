//! Prerequisites: author-declared edges from a target to the things it
//! needs, resolved to concrete targets during match.  The resolution is a
//! lock-free single-publish binding: the first resolver wins and every
//! observer sees the same target.

use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};

use anyhow::{bail, Context as _};

use crate::context::Context;
use crate::fs;
use crate::scope::ScopeId;
use crate::target::{SearchKind, Target, TargetId, TargetType};

pub struct Prerequisite {
    pub tt: &'static TargetType,
    /// Directory, relative to the owning scope unless absolute; None
    /// means the scope's own directory.
    pub dir: Option<PathBuf>,
    pub out: Option<PathBuf>,
    pub name: String,
    pub ext: Option<String>,
    /// Project qualifier for imported prerequisites.
    pub proj: Option<String>,
    /// The scope this prerequisite was declared in.
    pub scope: ScopeId,
    /// Resolved target id + 1; 0 while unresolved.
    target: AtomicUsize,
}

impl Prerequisite {
    pub fn new(tt: &'static TargetType, name: impl Into<String>, scope: ScopeId) -> Self {
        Prerequisite {
            tt,
            dir: None,
            out: None,
            name: name.into(),
            ext: None,
            proj: None,
            scope,
            target: AtomicUsize::new(0),
        }
    }

    pub fn with_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.dir = Some(dir.into());
        self
    }

    pub fn with_ext(mut self, ext: impl Into<String>) -> Self {
        self.ext = Some(ext.into());
        self
    }

    pub fn with_proj(mut self, proj: impl Into<String>) -> Self {
        self.proj = Some(proj.into());
        self
    }

    /// The published binding, if any.
    pub fn resolved(&self) -> Option<TargetId> {
        match self.target.load(Ordering::Acquire) {
            0 => None,
            v => Some(TargetId(v - 1)),
        }
    }

    /// Publish the resolved target.  Publishing a different target than a
    /// concurrent winner is an invariant violation.
    fn publish(&self, id: TargetId) {
        let v = id.0 + 1;
        if let Err(cur) =
            self.target
                .compare_exchange(0, v, Ordering::AcqRel, Ordering::Acquire)
        {
            if cur != v {
                panic!(
                    "prerequisite {} resolved to two targets ({} and {})",
                    self,
                    cur - 1,
                    id.0
                );
            }
        }
    }
}

impl std::fmt::Display for Prerequisite {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}{{{}", self.tt.name, self.name)?;
        if let Some(e) = &self.ext {
            write!(f, ".{}", e)?;
        }
        write!(f, "}}")
    }
}

/// The prerequisite's directory in the out tree and in the src tree.
fn bases(ctx: &Context, p: &Prerequisite) -> (PathBuf, PathBuf) {
    let scope = ctx.scopes.get(p.scope);
    match &p.dir {
        None => (scope.out_path.clone(), scope.src_path.clone()),
        Some(d) if d.is_absolute() => {
            let root = ctx.scopes.root_of(scope);
            let src = if root.out_of_source() && d.starts_with(&root.out_path) {
                root.src_path
                    .join(d.strip_prefix(&root.out_path).unwrap())
            } else {
                d.clone()
            };
            (fs::normalize(d), fs::normalize(&src))
        }
        Some(d) => (
            fs::normalize(&scope.out_path.join(d)),
            fs::normalize(&scope.src_path.join(d)),
        ),
    }
}

/// Look up an existing target for the prerequisite, first at its out
/// position, then at its src position.
pub fn search_existing(ctx: &Context, p: &Prerequisite) -> Option<TargetId> {
    let (out_base, src_base) = bases(ctx, p);
    if let Some(id) = ctx
        .targets
        .find(p.tt, &out_base, Path::new(""), &p.name, p.ext.as_deref())
    {
        return Some(id);
    }
    if src_base != out_base {
        return ctx
            .targets
            .find(p.tt, &src_base, &out_base, &p.name, p.ext.as_deref());
    }
    None
}

/// Search the src tree for an existing file and synthesise a target bound
/// to the discovered path.
fn search_existing_file(ctx: &Context, p: &Prerequisite) -> anyhow::Result<Option<TargetId>> {
    let (out_base, src_base) = bases(ctx, p);
    let scope = ctx.scopes.get(p.scope);

    let ext = match &p.ext {
        Some(e) => e.clone(),
        None => match p.tt.default_ext.and_then(|f| f(p.tt, &ctx.scopes, p.scope)) {
            Some(e) => e,
            None => bail!("no default extension for prerequisite {}", p),
        },
    };
    let mut file = p.name.clone();
    if !ext.is_empty() {
        file.push('.');
        file.push_str(&ext);
    }
    let path = src_base.join(&file);
    if !fs::file_exists(&path) {
        return Ok(None);
    }

    let out = if scope.out_of_source() && src_base != out_base {
        out_base
    } else {
        PathBuf::new()
    };
    let (id, _) = ctx
        .targets
        .insert(p.tt, src_base, out, p.name.clone(), Some(ext));
    let t = ctx.targets.get(id);
    t.bind_path(path);
    t.load_mtime()
        .with_context(|| format!("stat {}", t.path().display()))?;
    Ok(Some(id))
}

/// Resolve through the type's custom search function only.
pub fn search_custom(ctx: &Context, p: &Prerequisite) -> anyhow::Result<Option<TargetId>> {
    match p.tt.custom_search {
        Some(f) => f(ctx, p),
        None => Ok(None),
    }
}

/// Resolve a prerequisite to a target, publishing the binding.  The host
/// is the target on whose behalf the search runs (diagnostics only).
pub fn search(ctx: &Context, host: &Target, p: &Prerequisite) -> anyhow::Result<TargetId> {
    if let Some(id) = p.resolved() {
        return Ok(id);
    }

    let found = if p.tt.custom_search.is_some() {
        search_custom(ctx, p)?
    } else {
        match p.tt.search {
            SearchKind::Existing => search_existing(ctx, p),
            SearchKind::Alias => match search_existing(ctx, p) {
                Some(id) => Some(id),
                None => bail!(
                    "no explicit target for prerequisite {} of {}",
                    p,
                    host
                ),
            },
            SearchKind::File => match search_existing(ctx, p) {
                Some(id) => Some(id),
                None => search_existing_file(ctx, p)?,
            },
        }
    };

    let id = match found {
        Some(id) => id,
        None => bail!(
            "unable to resolve prerequisite {} of {}: no existing target or source file",
            p,
            host
        ),
    };
    p.publish(id);
    Ok(id)
}
