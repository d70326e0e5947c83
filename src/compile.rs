//! The generic file-compilation rule machinery: matches a target with a
//! single source prerequisite, keeps a depdb transaction next to the
//! output, drives the dynamic prerequisite extractor, and compiles with
//! the configured tool.  Language-specific rules are built by
//! instantiating this with their target types and variable names.

use std::hash::Hasher;
use std::path::PathBuf;

use anyhow::{bail, Context as _};

use crate::action::{Action, CLEAN, UPDATE};
use crate::algorithm::{
    execute_direct, execute_prerequisites, match_, prerequisite_members, unmatch,
};
use crate::context::{Build, Context};
use crate::depdb::DepDb;
use crate::extract::{append_prefixes, inject_prerequisites, ExtractOptions, PrefixMap};
use crate::fs::{self, FileTime};
use crate::prereq;
use crate::process;
use crate::rule::{Recipe, Rule};
use crate::target::{Target, TargetId, TargetState, TargetType, FSDIR};

pub struct CompileRule {
    /// Rule name and version, the first depdb line: changing it forces a
    /// full re-extraction for every output built by this rule.
    pub id: &'static str,
    pub src_type: &'static TargetType,
    /// Type for discovered headers outside any project.
    pub fallback_type: &'static TargetType,
    /// Prerequisites of this type are consulted for exported options
    /// only (the library meta-information protocol) and not executed.
    pub lib_type: Option<&'static TargetType>,
    /// Root-scope variable naming the tool executable.
    pub tool_var: &'static str,
    pub poptions_var: &'static str,
    pub coptions_var: &'static str,
    pub export_poptions_var: &'static str,
    /// Default object extension when the target type does not derive one.
    pub def_ext: &'static str,
    /// Flags asking the tool to emit make-style dependencies (missing
    /// headers included) instead of compiling.
    pub dep_flags: &'static [&'static str],
}

impl CompileRule {
    pub fn new(
        id: &'static str,
        src_type: &'static TargetType,
        fallback_type: &'static TargetType,
    ) -> CompileRule {
        CompileRule {
            id,
            src_type,
            fallback_type,
            lib_type: None,
            tool_var: "cc.path",
            poptions_var: "cc.poptions",
            coptions_var: "cc.coptions",
            export_poptions_var: "cc.export.poptions",
            def_ext: "o",
            dep_flags: &["-M", "-MG", "-MQ", "^"],
        }
    }

    fn find_source(&self, b: &Build, a: Action, t: TargetId) -> anyhow::Result<Option<TargetId>> {
        // Iterate in reverse so a source specified for the member
        // overrides one specified for its group; see-through groups are
        // expanded.
        for pid in prerequisite_members(b, a, t)?.into_iter().rev() {
            if b.ctx.targets.get(pid).is_a(self.src_type) {
                return Ok(Some(pid));
            }
        }
        Ok(None)
    }

    fn tool(&self, ctx: &Context, t: &Target) -> anyhow::Result<String> {
        match ctx.lookup(t, self.tool_var) {
            Some(v) => match v.as_str() {
                Some(s) => Ok(s.to_string()),
                None => bail!("invalid {} value for target {}", self.tool_var, t),
            },
            None => bail!("no {} configured for target {}", self.tool_var, t),
        }
    }

    /// Exported preprocessor options from library prerequisites,
    /// innermost libraries first.  Walks the declared prerequisites via
    /// their resolved bindings: the libraries themselves were matched
    /// for their metadata and then unmatched.
    fn lib_export_options(&self, ctx: &Context, t: &Target, out: &mut Vec<String>) {
        let Some(lib_type) = self.lib_type else {
            return;
        };
        for p in &t.prerequisites {
            let Some(pid) = p.resolved() else { continue };
            let pt = ctx.targets.get(pid);
            if pt.is_a(lib_type) {
                self.lib_export_options(ctx, pt, out);
                out.extend(ctx.lookup_list(pt, self.export_poptions_var));
            }
        }
    }

    fn options(&self, ctx: &Context, t: &Target) -> Vec<String> {
        let mut opts = Vec::new();
        self.lib_export_options(ctx, t, &mut opts);
        opts.extend(ctx.lookup_list(t, self.poptions_var));
        opts.extend(ctx.lookup_list(t, self.coptions_var));
        opts
    }
}

fn hex_hash(parts: impl IntoIterator<Item = String>) -> String {
    let mut h = std::collections::hash_map::DefaultHasher::new();
    for p in parts {
        h.write(p.as_bytes());
        h.write_u8(0x1f);
    }
    format!("{:016x}", h.finish())
}

/// Checksum identifying the tool build: path plus size and mtime.
fn tool_checksum(tool: &str) -> anyhow::Result<String> {
    let meta = std::fs::metadata(tool).with_context(|| format!("missing tool {}", tool))?;
    Ok(hex_hash([
        tool.to_string(),
        meta.len().to_string(),
        fs::mtime(std::path::Path::new(tool))?.raw().to_string(),
    ]))
}

/// Make the output directory a prerequisite so it exists before the
/// output (and is removed after it on clean).
fn inject_fsdir(b: &Build, a: Action, tid: TargetId) -> Option<TargetId> {
    let ctx = b.ctx;
    let t = ctx.targets.get(tid);
    let scope = ctx.scopes.find(t.out_dir());
    let root = ctx.scopes.root_of(scope);
    if root.id == crate::scope::GLOBAL_SCOPE || t.dir == root.out_path {
        return None;
    }
    let (fid, _) = ctx
        .targets
        .insert(&FSDIR, t.dir.clone(), PathBuf::new(), String::new(), None);
    match_(b, a, fid);
    t.opstate(a).inner().prerequisite_targets.push(fid);
    Some(fid)
}

impl Rule for CompileRule {
    fn matches(&self, b: &Build, a: Action, t: TargetId, _hint: &str) -> anyhow::Result<bool> {
        if self.find_source(b, a, t)?.is_some() {
            return Ok(true);
        }
        tracing::debug!(
            "no {} source file for target {}",
            self.src_type.name,
            b.ctx.targets.get(t).display(1)
        );
        Ok(false)
    }

    fn apply(&self, b: &Build, a: Action, tid: TargetId) -> anyhow::Result<Recipe> {
        let ctx = b.ctx;
        let t = ctx.targets.get(tid);
        let scope = ctx.scopes.find(t.out_dir());
        let root = ctx.scopes.root_of(scope);

        t.derive_path(&ctx.scopes, Some(self.def_ext))?;

        let dir = inject_fsdir(b, a, tid);

        let src = self
            .find_source(b, a, tid)?
            .expect("apply without a matching source");

        // Search and match the declared prerequisites.  Libraries are
        // consulted for their exported options only: match to populate
        // their metadata, then unmatch so they are not executed.  When
        // cleaning, ignore prerequisites outside the project out root.
        for p in &t.prerequisites {
            let pid = prereq::search(ctx, t, p)?;
            let pt = ctx.targets.get(pid);
            if let Some(lib_type) = self.lib_type {
                if pt.is_a(lib_type) {
                    if a.op == UPDATE {
                        if match_(b, a, pid) == TargetState::Failed {
                            bail!("failed to match library prerequisite {}", pt);
                        }
                        if !unmatch(b, a, pid) {
                            t.opstate(a).inner().prerequisite_targets.push(pid);
                        }
                    }
                    continue;
                }
            }
            if a.op == CLEAN && !pt.dir.starts_with(&root.out_path) {
                continue;
            }
            if match_(b, a, pid) == TargetState::Failed {
                bail!("failed to match prerequisite {} of {}", p, t);
            }
            t.opstate(a).inner().prerequisite_targets.push(pid);
        }

        // Inject the discovered prerequisites.  Only when updating:
        // chances are we will have to update some of them in the process
        // (auto-generated headers).
        if a.op == UPDATE {
            // The output directory must exist before its depdb.
            if let Some(fid) = dir {
                execute_direct(b, a, fid);
            }

            let src_t = ctx.targets.get(src);
            let obj_path = t.path().to_path_buf();
            let mut dd = DepDb::open(format!("{}.d", obj_path.display()))?;

            if dd.expect(self.id)?.is_some() {
                tracing::debug!("rule mismatch forcing update of {}", t);
            }

            let tool = self.tool(ctx, t)?;
            if dd.expect(&tool_checksum(&tool)?)?.is_some() {
                tracing::debug!("tool mismatch forcing update of {}", t);
            }

            // Options exactly as passed to the tool; order matters.
            let options = self.options(ctx, t);
            if dd.expect(&hex_hash(options.iter().cloned()))?.is_some() {
                tracing::debug!("options mismatch forcing update of {}", t);
            }

            if dd
                .expect(&src_t.path().to_string_lossy())?
                .is_some()
            {
                tracing::debug!("source file mismatch forcing update of {}", t);
            }

            // A mismatch above, or a database newer than the output
            // (interrupted update), forces the rebuild.
            t.load_mtime()?;
            if dd.writing() || dd.mtime() > t.mtime() {
                t.set_mtime(FileTime::NONEXISTENT);
            }

            let mut prefixes = PrefixMap::new();
            append_prefixes(&mut prefixes, &options, &t.dir, &root.out_path);

            let mut dep_args: Vec<String> = vec![tool.clone()];
            dep_args.extend(options.iter().cloned());
            dep_args.extend(self.dep_flags.iter().map(|s| s.to_string()));
            dep_args.push(src_t.path().to_string_lossy().into_owned());

            inject_prerequisites(
                b,
                a,
                tid,
                &mut dd,
                &ExtractOptions {
                    src,
                    dep_args,
                    cwd: root.out_path.clone(),
                    fallback: self.fallback_type,
                    prefixes: &prefixes,
                },
            )
            .with_context(|| {
                format!("while extracting header dependencies from {}", src_t)
            })?;

            dd.close()?;

            let mut argv: Vec<String> = vec![tool];
            argv.extend(options);
            argv.push("-o".to_string());
            argv.push(obj_path.to_string_lossy().into_owned());
            argv.push("-c".to_string());
            argv.push(src_t.path().to_string_lossy().into_owned());

            let src_type = self.src_type;
            return Ok(Recipe::func(move |b, a, tid| {
                perform_update(b, a, tid, src, src_type, &argv)
            }));
        }

        match a.op {
            CLEAN => Ok(Recipe::func(perform_clean)),
            _ => Ok(Recipe::Noop),
        }
    }
}

fn perform_update(
    b: &Build,
    a: Action,
    tid: TargetId,
    src: TargetId,
    src_type: &'static TargetType,
    argv: &[String],
) -> anyhow::Result<TargetState> {
    let t = b.ctx.targets.get(tid);
    t.load_mtime()?;

    let pr = execute_prerequisites(
        b,
        a,
        tid,
        t.mtime(),
        Some(&|pt: &Target| pt.is_a(src_type)),
        0,
    )?;
    if pr.state == TargetState::Failed {
        return Ok(TargetState::Failed);
    }
    if !pr.update {
        return Ok(TargetState::Unchanged);
    }

    tracing::debug!("compile {}", b.ctx.targets.get(src));
    tracing::trace!("{}", process::print_process(argv));

    let res = process::run_command(argv)?;
    if !res.output.is_empty() {
        use std::io::Write;
        let _ = std::io::stderr().write_all(&res.output);
    }
    if !res.success {
        bail!("compile command failed: {}", process::print_process(argv));
    }

    // The file was just written; the clock beats another stat and has
    // sub-second precision on every filesystem.
    t.set_mtime(FileTime::now());
    Ok(TargetState::Changed)
}

fn perform_clean(b: &Build, a: Action, tid: TargetId) -> anyhow::Result<TargetState> {
    let t = b.ctx.targets.get(tid);
    let path = t.path().to_path_buf();
    let mut state = TargetState::Unchanged;

    for p in [PathBuf::from(format!("{}.d", path.display())), path] {
        if fs::try_rmfile(&p)? == fs::RmStatus::Removed {
            tracing::debug!("rm {}", p.display());
            state = TargetState::Changed;
        }
    }
    t.set_mtime(FileTime::NONEXISTENT);

    let pr = execute_prerequisites(b, a, tid, FileTime::UNKNOWN, None, 0)?;
    if pr.state == TargetState::Failed {
        return Ok(TargetState::Failed);
    }
    Ok(crate::target::aggregate(state, pr.state))
}

/// A clean counterpart usable by ad-hoc output targets: remove the bound
/// path, then clean prerequisites in reverse.
pub fn clean_recipe() -> Recipe {
    Recipe::func(perform_clean)
}
