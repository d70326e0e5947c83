//! Dynamic prerequisite extraction: discovering implicit prerequisites
//! (headers) of a source file by reading them back from the depdb cache
//! or streaming them out of a dependency-emitting tool run, updating each
//! as it is discovered.
//!
//! The loop is restart-capable: updating a discovered prerequisite (an
//! auto-generated header) can change what the source includes, so the
//! extraction starts over, skipping the strict prefix of prerequisites
//! already processed.  Extraction terminates because the prerequisite
//! set is a deterministic function of its inputs and an updated target
//! stays up to date for the rest of the build.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use anyhow::{bail, Context as _};

use crate::action::Action;
use crate::algorithm::{execute_direct, match_, resolved_state};
use crate::context::{Build, Context};
use crate::depdb::DepDb;
use crate::fs::{self, FileTime};
use crate::makedep;
use crate::process;
use crate::scope::{Scope, GLOBAL_SCOPE};
use crate::target::{TargetId, TargetState, TargetType};

/// Mapping of include prefixes (e.g. `foo` in `<foo/bar.h>`) to the out
/// directories auto-generated headers will appear in, derived from the
/// include search directories in the target's options.  Longest prefix
/// wins on lookup; the latest mapping wins on collision.
pub struct PrefixMap(BTreeMap<PathBuf, PathBuf>);

impl PrefixMap {
    pub fn new() -> PrefixMap {
        PrefixMap(BTreeMap::new())
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn insert(&mut self, prefix: PathBuf, dir: PathBuf) {
        if let Some(old) = self.0.get(&prefix) {
            if *old != dir {
                tracing::trace!(
                    "overriding dependency prefix {:?}: {} -> {}",
                    prefix,
                    old.display(),
                    dir.display()
                );
            }
        }
        self.0.insert(prefix, dir);
    }

    /// The mapping for the longest prefix of which `rel_dir` is a
    /// sub-path (possibly the empty prefix).
    pub fn find(&self, rel_dir: &Path) -> Option<&PathBuf> {
        for a in rel_dir.ancestors() {
            if let Some(d) = self.0.get(a) {
                return Some(d);
            }
        }
        None
    }
}

impl Default for PrefixMap {
    fn default() -> Self {
        Self::new()
    }
}

/// Harvest `-I` directories from an option list into the prefix map.
/// Only absolute directories inside the project out root can contain
/// auto-generated headers; the prefix is the target directory's position
/// under the include directory (empty when the include directory is the
/// target directory itself).
pub fn append_prefixes(
    m: &mut PrefixMap,
    options: &[String],
    out_base: &Path,
    out_root: &Path,
) {
    let mut i = 0;
    while i < options.len() {
        let o = &options[i];
        i += 1;
        let d: PathBuf;
        if let Some(rest) = o.strip_prefix("-I") {
            if rest.is_empty() {
                // "-I dir" form.
                match options.get(i) {
                    Some(next) => {
                        d = PathBuf::from(next);
                        i += 1;
                    }
                    None => break, // let the tool complain
                }
            } else {
                d = PathBuf::from(rest);
            }
        } else {
            continue;
        }

        tracing::trace!("-I {:?}", d);
        if d.is_relative() || !d.starts_with(out_root) {
            continue;
        }
        let prefix = match out_base.strip_prefix(&d) {
            Ok(rel) => rel.to_path_buf(),
            Err(_) => PathBuf::new(),
        };
        m.insert(prefix, d);
    }
}

/// Reverse-lookup a target type from an extension by trying the
/// registered candidates in "most likely to match" order against the
/// per-type `extension` variable in scope.
pub fn map_extension(
    ctx: &Context,
    scope: &Scope,
    ext: &str,
) -> Option<&'static TargetType> {
    for tt in &ctx.types.extension_order {
        if let Some(v) = ctx.scopes.typed_lookup(scope.id, tt, "extension") {
            if v.as_str() == Some(ext) {
                return Some(tt);
            }
        }
    }
    None
}

pub struct ExtractOptions<'x> {
    /// The primary source target.
    pub src: TargetId,
    /// Full argv of the dependency-emitting tool invocation.
    pub dep_args: Vec<String>,
    pub cwd: PathBuf,
    /// Type for headers that belong to no project (plain externals,
    /// never auto-generated).
    pub fallback: &'static TargetType,
    pub prefixes: &'x PrefixMap,
}

/// Update a discovered target "smartly": execute it directly and report
/// whether that changed it, or whether it is newer than the given
/// timestamp.  Either answer means the extraction must restart.
fn update_target(b: &Build, a: Action, tid: TargetId, ts: FileTime) -> bool {
    let pt = b.ctx.targets.get(tid);
    let os = resolved_state(b.ctx, a, tid);
    if os != TargetState::Unchanged {
        let ns = execute_direct(b, a, tid);
        if ns != os && ns != TargetState::Unchanged {
            tracing::trace!(
                "updated {}; old state {}; new state {}",
                pt,
                os,
                ns
            );
            return true;
        }
    }
    if ts.is_known() {
        let mt = pt.mtime();
        return ts < mt
            || (ts == mt && resolved_state(b.ctx, a, tid) != TargetState::Changed);
    }
    false
}

/// Update and record one discovered prerequisite.  `cache` says whether
/// the path came from the depdb or from the live tool run.  Returns
/// whether the extraction must restart.
fn add(
    b: &Build,
    a: Action,
    tid: TargetId,
    dd: &mut DepDb,
    opts: &ExtractOptions,
    mut f: PathBuf,
    cache: bool,
) -> anyhow::Result<bool> {
    let ctx = b.ctx;
    let t = ctx.targets.get(tid);

    if f.is_relative() {
        f = fs::normalize(&f);
        // As often an author error as an auto-generated header.
        tracing::debug!("non-existent header {:?}", f);
        let dir = f.parent().unwrap_or_else(|| Path::new(""));
        match opts.prefixes.find(dir) {
            Some(d) => f = d.join(&f),
            None => bail!(
                "unable to map presumably auto-generated header {:?} to a project",
                f
            ),
        }
    } else if !cache {
        // Normalizing alone can produce an invalid path in the face of
        // symlinks, so realize live paths; cached ones already were.
        f = match std::fs::canonicalize(&f) {
            Ok(p) => p,
            Err(_) => fs::normalize(&f),
        };
    }

    tracing::trace!("injecting {}", f.display());

    let dir = f
        .parent()
        .map(Path::to_path_buf)
        .unwrap_or_default();
    let name = f
        .file_stem()
        .map(|s| s.to_string_lossy().into_owned())
        .unwrap_or_default();
    // An extension-less file records an explicitly-empty extension.
    let ext = f
        .extension()
        .map(|e| e.to_string_lossy().into_owned())
        .unwrap_or_default();

    // See if the directory belongs to some project; that determines the
    // target type and, for src directories of an out-of-source build,
    // the out position.
    let bs = ctx.scopes.find_any(&dir);
    let mut tt = None;
    let mut out = PathBuf::new();
    if bs.id != GLOBAL_SCOPE {
        tt = map_extension(ctx, bs, &ext);
        if bs.out_of_source() && dir.starts_with(&bs.src_path) {
            out = ctx.scopes.out_src(&dir, ctx.scopes.root_of(bs));
        }
    }
    let tt = tt.unwrap_or(opts.fallback);

    let (pid, _) = ctx.targets.insert(tt, dir, out, name, Some(ext));
    let pt = ctx.targets.get(pid);
    pt.bind_path(f.clone());

    if match_(b, a, pid) == TargetState::Failed {
        bail!("failed to update extracted dependency {}", pt);
    }

    let restart = update_target(
        b,
        a,
        pid,
        if cache { dd.mtime() } else { FileTime::UNKNOWN },
    );

    // Verify/record after the update so we never record something that
    // does not exist and cannot be made.
    if !cache {
        dd.expect(&f.to_string_lossy())?;
    }

    t.opstate(a).inner().prerequisite_targets.push(pid);
    Ok(restart)
}

/// Discover, update, and record the implicit prerequisites of the target
/// being matched, preferring the depdb cache and falling back to (and
/// revalidating through) the live tool run.
pub fn inject_prerequisites(
    b: &Build,
    a: Action,
    tid: TargetId,
    dd: &mut DepDb,
    opts: &ExtractOptions,
) -> anyhow::Result<()> {
    let t = b.ctx.targets.get(tid);
    let src = b.ctx.targets.get(opts.src);

    let mut cache = dd.reading();

    // Make sure the source itself is up to date before trusting anything
    // extracted from it.  Bump the db timestamp or we will re-validate
    // the cache forever.
    if update_target(b, a, opts.src, dd.mtime()) && cache {
        cache = false;
        dd.touch()?;
    }

    let mut skip_count = 0usize;
    let mut restart = true;
    while restart {
        restart = false;

        if cache {
            // Only ever the first pass.
            assert_eq!(skip_count, 0);
            while dd.more() {
                let l = dd.read().unwrap();
                restart = add(b, a, tid, dd, opts, PathBuf::from(l), true)?;
                skip_count += 1;
                if restart {
                    tracing::debug!("restarting extraction for {}", t);
                    dd.touch()?;
                    break;
                }
            }
        } else {
            tracing::debug!(
                "extracting dependencies of {}: {}",
                src,
                process::print_process(&opts.dep_args)
            );
            let mut stream = process::spawn_deps(&opts.dep_args, &opts.cwd)
                .with_context(|| format!("while extracting dependencies of {}", src))?;

            let mut skip = skip_count;
            let mut first = true;
            let mut second = false;
            'lines: while let Some(l) = stream.read_line()? {
                tracing::trace!("header dependency line {:?}", l);
                let mut pos = 0;
                if first {
                    pos = match makedep::declaration_start(&l) {
                        Some(p) => p,
                        None => bail!(
                            "invalid dependency output line {:?} from {}",
                            l,
                            opts.dep_args[0]
                        ),
                    };
                    first = false;
                    second = true;
                }
                if second {
                    // The source file itself; it may have wrapped onto
                    // the next line.
                    if makedep::next_token(&l, &mut pos).is_some() {
                        second = false;
                    } else {
                        continue;
                    }
                }
                while let Some(f) = makedep::next_token(&l, &mut pos) {
                    // Skip until where the previous pass left off.
                    if skip != 0 {
                        skip -= 1;
                        continue;
                    }
                    restart = add(b, a, tid, dd, opts, PathBuf::from(f), false)?;
                    skip_count += 1;
                    if restart {
                        tracing::debug!("restarting extraction for {}", t);
                        break 'lines;
                    }
                }
            }

            let ok = stream.finish()?;
            // A failed tool run that triggered a restart is the expected
            // missing-generated-header error; anything else is fatal.
            if !ok && !restart {
                bail!("unable to extract dependencies of {}", src);
            }
        }

        cache = false;
    }
    Ok(())
}
