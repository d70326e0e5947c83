//! Support code for end-to-end tests: a temporary src/out project pair,
//! a fake compiler that emits make-style dependencies and "compiles" by
//! concatenation, and helpers to load a context the way a build-file
//! parser would.

// Not every test binary uses every helper.
#![allow(dead_code)]

use std::path::PathBuf;
use std::sync::Arc;

use bx::action::{perform_clean, perform_update, PERFORM};
use bx::compile::{clean_recipe, CompileRule};
use bx::context::{Build, Context};
use bx::driver::{self, Request, Summary};
use bx::fs::FileTime;
use bx::prereq::Prerequisite;
use bx::rule::{Recipe, Rule, ANY};
use bx::rules::{AdhocRule, FileRule, FsdirRule};
use bx::scope::ScopeId;
use bx::target::{
    ext_from_scope_var, target_factory, SearchKind, TargetId, TargetState, TargetType, FILE,
    FSDIR, TARGET,
};
use bx::variable::Value;

pub static CC: TargetType = TargetType {
    name: "cc",
    base: Some(&FILE),
    uses_ext: true,
    see_through: false,
    search: SearchKind::File,
    custom_search: None,
    factory: target_factory,
    default_ext: Some(ext_from_scope_var),
};

pub static HH: TargetType = TargetType {
    name: "hh",
    base: Some(&FILE),
    uses_ext: true,
    see_through: false,
    search: SearchKind::File,
    custom_search: None,
    factory: target_factory,
    default_ext: Some(ext_from_scope_var),
};

pub static OBJ: TargetType = TargetType {
    name: "obj",
    base: Some(&FILE),
    uses_ext: true,
    see_through: false,
    search: SearchKind::File,
    custom_search: None,
    factory: target_factory,
    default_ext: Some(ext_from_scope_var),
};

pub static LIB: TargetType = TargetType {
    name: "lib",
    base: Some(&TARGET),
    uses_ext: false,
    see_through: false,
    search: SearchKind::Existing,
    custom_search: None,
    factory: target_factory,
    default_ext: None,
};

/// Libraries carry exported options only; nothing to do for them.
pub struct LibRule;

impl Rule for LibRule {
    fn matches(
        &self,
        _: &Build,
        _: bx::action::Action,
        _: TargetId,
        _: &str,
    ) -> anyhow::Result<bool> {
        Ok(true)
    }

    fn apply(
        &self,
        _: &Build,
        _: bx::action::Action,
        _: TargetId,
    ) -> anyhow::Result<Recipe> {
        Ok(Recipe::Noop)
    }
}

const TOOL: &str = r#"#!/bin/sh
# Fake compiler: -M emits make-style dependencies (missing includes as
# written); otherwise -o/-c "compiles" by concatenation.
log="$(dirname "$0")/tool.log"

mode=compile
out=""
src=""
incs=""

while [ $# -gt 0 ]; do
  case "$1" in
    -M) mode=deps ;;
    -MG) ;;
    -MQ) shift ;;
    -I) shift; incs="$incs $1" ;;
    -I*) incs="$incs ${1#-I}" ;;
    -o) shift; out="$1" ;;
    -c) shift; src="$1" ;;
    -*) ;;
    *) src="$1" ;;
  esac
  shift
done

includes() {
  sed -n 's/^#include "\([^"]*\)".*/\1/p' "$1"
}

find_inc() {
  for d in "$(dirname "$src")" $incs; do
    if [ -f "$d/$1" ]; then
      printf '%s' "$d/$1"
      return 0
    fi
  done
  return 1
}

if [ "$mode" = deps ]; then
  echo "deps $src" >>"$log"
  printf '^: %s' "$src"
  for h in $(includes "$src"); do
    if f=$(find_inc "$h"); then
      printf ' %s' "$f"
    else
      printf ' %s' "$h"
    fi
  done
  printf '\n'
  exit 0
fi

echo "compile $src" >>"$log"
for h in $(includes "$src"); do
  if ! find_inc "$h" >/dev/null; then
    echo "$src: missing include $h" >&2
    exit 1
  fi
done
cat "$src" >"$out"
"#;

/// A temporary project: src and out trees plus the fake tool.  Paths are
/// canonicalized up front so they compare equal to what the extractor
/// realizes out of the tool output.
pub struct TestSpace {
    #[allow(dead_code)]
    dir: tempfile::TempDir,
    root: PathBuf,
}

impl TestSpace {
    pub fn new() -> anyhow::Result<TestSpace> {
        let dir = tempfile::tempdir()?;
        let root = std::fs::canonicalize(dir.path())?;
        std::fs::create_dir_all(root.join("src"))?;
        std::fs::create_dir_all(root.join("out"))?;

        let tool = root.join("tool");
        std::fs::write(&tool, TOOL)?;
        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            std::fs::set_permissions(&tool, std::fs::Permissions::from_mode(0o755))?;
        }
        Ok(TestSpace { dir, root })
    }

    pub fn src(&self) -> PathBuf {
        self.root.join("src")
    }

    pub fn out(&self) -> PathBuf {
        self.root.join("out")
    }

    /// Where objects land (a subdirectory, so the fsdir machinery runs).
    pub fn obj_dir(&self) -> PathBuf {
        self.out().join("obj")
    }

    pub fn tool(&self) -> PathBuf {
        self.root.join("tool")
    }

    pub fn write_src(&self, name: &str, content: &str) -> anyhow::Result<()> {
        std::fs::write(self.src().join(name), content)?;
        Ok(())
    }

    /// Bump a source file's mtime past everything built so far.
    pub fn touch_src(&self, name: &str) -> anyhow::Result<()> {
        std::thread::sleep(std::time::Duration::from_millis(15));
        let f = std::fs::OpenOptions::new()
            .write(true)
            .open(self.src().join(name))?;
        f.set_modified(std::time::SystemTime::now())?;
        Ok(())
    }

    fn log_count(&self, prefix: &str) -> usize {
        match std::fs::read_to_string(self.root.join("tool.log")) {
            Ok(s) => s.lines().filter(|l| l.starts_with(prefix)).count(),
            Err(_) => 0,
        }
    }

    pub fn deps_runs(&self) -> usize {
        self.log_count("deps ")
    }

    pub fn compile_runs(&self) -> usize {
        self.log_count("compile ")
    }

    pub fn depdb_lines(&self, obj: &str) -> anyhow::Result<Vec<String>> {
        let text = std::fs::read_to_string(self.obj_dir().join(format!("{}.d", obj)))?;
        Ok(text.lines().map(str::to_string).collect())
    }
}

/// A context loaded the way the build-file parser would load it: one
/// project scope pair, the standard rules, and the test target types.
pub struct Project {
    pub ctx: Context,
    pub scope: ScopeId,
}

impl Project {
    pub fn load(space: &TestSpace) -> Project {
        Project::load_with_coptions(space, &[])
    }

    pub fn load_with_coptions(space: &TestSpace, coptions: &[&str]) -> Project {
        let mut ctx = Context::new();
        for tt in [&HH, &CC, &OBJ] {
            ctx.types.register_with_extension(tt);
        }
        ctx.types.register(&LIB);

        let scope = ctx.scopes.create(space.out(), space.src(), None);
        let s = ctx.scopes.get_mut(scope);
        s.set_typed_var(&CC, "extension", Value::from("cc"));
        s.set_typed_var(&HH, "extension", Value::from("hxx"));
        s.set_typed_var(&OBJ, "extension", Value::from("o"));
        s.set_var(
            "cc.path",
            Value::from(space.tool().to_string_lossy().into_owned()),
        );
        s.set_var(
            "cc.poptions",
            Value::from(vec![format!("-I{}", space.obj_dir().display())]),
        );
        s.set_var(
            "cc.coptions",
            Value::from(coptions.iter().map(|s| s.to_string()).collect::<Vec<_>>()),
        );

        let mut compile = CompileRule::new("cc.compile 1", &CC, &HH);
        compile.lib_type = Some(&LIB);

        let rules = &mut ctx.scopes.get_mut(scope).rules;
        rules.register(PERFORM, ANY, Some(&OBJ), "cc.compile", Arc::new(compile));
        rules.register(PERFORM, ANY, Some(&FILE), "adhoc", Arc::new(AdhocRule));
        rules.register(PERFORM, ANY, Some(&FILE), "file", Arc::new(FileRule));
        rules.register(PERFORM, ANY, Some(&FSDIR), "fsdir", Arc::new(FsdirRule));
        rules.register(PERFORM, ANY, Some(&LIB), "lib", Arc::new(LibRule));

        Project { ctx, scope }
    }

    /// Declare `obj{name}: cc{name}`.
    pub fn add_obj(&mut self, space: &TestSpace, name: &str) -> TargetId {
        let (tid, _) = self.ctx.targets.insert(
            &OBJ,
            space.obj_dir(),
            PathBuf::new(),
            name.to_string(),
            Some("o".to_string()),
        );
        let pr = Prerequisite::new(&CC, name, self.scope);
        self.ctx.targets.get_mut(tid).prerequisites.push(pr);
        tid
    }

    pub fn add_prerequisite(&mut self, tid: TargetId, pr: Prerequisite) {
        self.ctx.targets.get_mut(tid).prerequisites.push(pr);
    }

    /// Declare an auto-generated header in the object directory with an
    /// ad-hoc recipe writing its content.
    pub fn add_gen_header(
        &mut self,
        space: &TestSpace,
        name: &str,
        content: &'static str,
    ) -> TargetId {
        let (tid, _) = self.ctx.targets.insert(
            &HH,
            space.obj_dir(),
            PathBuf::new(),
            name.to_string(),
            Some("hxx".to_string()),
        );
        let t = self.ctx.targets.get_mut(tid);
        t.adhoc.push((
            bx::action::UPDATE,
            Recipe::func(move |b, _a, tid| {
                let t = b.ctx.targets.get(tid);
                if t.load_mtime()?.exists() {
                    return Ok(TargetState::Unchanged);
                }
                std::fs::write(t.path(), content)?;
                t.set_mtime(FileTime::now());
                Ok(TargetState::Changed)
            }),
        ));
        t.adhoc.push((bx::action::CLEAN, clean_recipe()));
        tid
    }

    /// Declare `lib{name}` exporting the given preprocessor options.
    pub fn add_lib(&mut self, space: &TestSpace, name: &str, export: &[&str]) -> TargetId {
        let (tid, _) = self.ctx.targets.insert(
            &LIB,
            space.out(),
            PathBuf::new(),
            name.to_string(),
            None,
        );
        let t = self.ctx.targets.get_mut(tid);
        t.vars.lock().unwrap().insert(
            "cc.export.poptions".to_string(),
            Value::from(export.iter().map(|s| s.to_string()).collect::<Vec<_>>()),
        );
        tid
    }

    pub fn update(&self, targets: &[TargetId], parallelism: usize) -> anyhow::Result<Summary> {
        let requests: Vec<Request> = targets
            .iter()
            .map(|&t| Request {
                action: perform_update(),
                target: t,
            })
            .collect();
        driver::perform(&self.ctx, &requests, parallelism)
    }

    pub fn clean(&self, targets: &[TargetId], parallelism: usize) -> anyhow::Result<Summary> {
        let requests: Vec<Request> = targets
            .iter()
            .map(|&t| Request {
                action: perform_clean(),
                target: t,
            })
            .collect();
        driver::perform(&self.ctx, &requests, parallelism)
    }
}

pub fn state_of(s: &Summary, tid: TargetId) -> TargetState {
    s.states
        .iter()
        .find(|(id, _)| *id == tid)
        .map(|(_, s)| *s)
        .expect("target not in summary")
}
