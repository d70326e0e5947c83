//! Structural built-in rules: the fallback rule for existing files, the
//! alias rule, the filesystem-directory rule, and the ad-hoc rule for
//! targets carrying an attached recipe.

use anyhow::bail;

use crate::action::{Action, CLEAN, UPDATE};
use crate::algorithm::match_prerequisites;
use crate::context::Build;
use crate::fs;
use crate::rule::{Recipe, Rule};
use crate::target::{TargetId, TargetState};

/// Fallback rule for source files and headers: matches when the file is
/// already on disk and there is nothing to do for it.  The noop recipe
/// marks the target unchanged without an execution, which keeps the
/// dynamic extractor from re-visiting the world's headers.
pub struct FileRule;

impl Rule for FileRule {
    fn matches(&self, b: &Build, _a: Action, t: TargetId, _hint: &str) -> anyhow::Result<bool> {
        let t = b.ctx.targets.get(t);
        let path = match t.try_path() {
            Some(p) => p.to_path_buf(),
            None => match t.derive_path(&b.ctx.scopes, None) {
                Ok(p) => p.to_path_buf(),
                Err(_) => return Ok(false),
            },
        };
        Ok(fs::file_exists(&path))
    }

    fn apply(&self, b: &Build, _a: Action, t: TargetId) -> anyhow::Result<Recipe> {
        b.ctx.targets.get(t).load_mtime()?;
        Ok(Recipe::Noop)
    }
}

/// Alias (and dir) targets exist to pull in their prerequisites.
pub struct AliasRule;

impl Rule for AliasRule {
    fn matches(&self, _b: &Build, _a: Action, _t: TargetId, _hint: &str) -> anyhow::Result<bool> {
        Ok(true)
    }

    fn apply(&self, b: &Build, a: Action, t: TargetId) -> anyhow::Result<Recipe> {
        if match_prerequisites(b, a, t)? == TargetState::Failed {
            bail!(
                "failed to match prerequisites of {}",
                b.ctx.targets.get(t)
            );
        }
        Ok(Recipe::Default)
    }
}

/// Creates the directory on update, removes it (when empty) on clean.
pub struct FsdirRule;

impl Rule for FsdirRule {
    fn matches(&self, _b: &Build, _a: Action, _t: TargetId, _hint: &str) -> anyhow::Result<bool> {
        Ok(true)
    }

    fn apply(&self, _b: &Build, _a: Action, _t: TargetId) -> anyhow::Result<Recipe> {
        Ok(Recipe::func(|b, a, tid| {
            let t = b.ctx.targets.get(tid);
            match a.op {
                UPDATE => {
                    if fs::mkdir_p(&t.dir)? {
                        tracing::debug!("mkdir {}", t.dir.display());
                        Ok(TargetState::Changed)
                    } else {
                        Ok(TargetState::Unchanged)
                    }
                }
                CLEAN => match fs::try_rmdir(&t.dir)? {
                    fs::RmStatus::Removed => {
                        tracing::debug!("rmdir {}", t.dir.display());
                        Ok(TargetState::Changed)
                    }
                    _ => Ok(TargetState::Unchanged),
                },
                _ => Ok(TargetState::Unchanged),
            }
        }))
    }
}

/// Matches targets that carry an ad-hoc recipe for the requested
/// operation (attached during load, standing in for buildfile-declared
/// recipes).
pub struct AdhocRule;

impl Rule for AdhocRule {
    fn matches(&self, b: &Build, a: Action, t: TargetId, _hint: &str) -> anyhow::Result<bool> {
        Ok(b.ctx
            .targets
            .get(t)
            .adhoc
            .iter()
            .any(|(op, _)| *op == a.op))
    }

    fn apply(&self, b: &Build, a: Action, t: TargetId) -> anyhow::Result<Recipe> {
        let tgt = b.ctx.targets.get(t);
        if match_prerequisites(b, a, t)? == TargetState::Failed {
            bail!("failed to match prerequisites of {}", tgt);
        }
        let recipe = tgt
            .adhoc
            .iter()
            .find(|(op, _)| *op == a.op)
            .map(|(_, r)| r.clone())
            .unwrap();
        Ok(recipe)
    }
}
