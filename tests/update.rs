//! End-to-end update scenarios: clean build, incremental no-op, header
//! change, options change, and the library meta-information protocol.

mod common;

use common::*;

use bx::action::perform_update;
use bx::target::{TargetState, COUNT_TRIED};

#[test]
fn clean_build_records_depdb() -> anyhow::Result<()> {
    let space = TestSpace::new()?;
    space.write_src("hello.cc", "#include \"hello.hxx\"\nint main;\n")?;
    space.write_src("hello.hxx", "int x;\n")?;

    let mut proj = Project::load(&space);
    let obj = proj.add_obj(&space, "hello");
    let summary = proj.update(&[obj], 1)?;

    assert_eq!(state_of(&summary, obj), TargetState::Changed);
    assert_eq!(space.compile_runs(), 1);

    let out = space.obj_dir().join("hello.o");
    assert!(out.is_file());
    assert_eq!(
        std::fs::read_to_string(&out)?,
        "#include \"hello.hxx\"\nint main;\n"
    );

    let lines = space.depdb_lines("hello.o")?;
    assert_eq!(lines.len(), 6);
    assert_eq!(lines[0], "cc.compile 1");
    assert_eq!(lines[1].len(), 16, "tool checksum: {:?}", lines[1]);
    assert_eq!(lines[2].len(), 16, "options checksum: {:?}", lines[2]);
    assert_eq!(lines[3], space.src().join("hello.cc").display().to_string());
    assert_eq!(lines[4], space.src().join("hello.hxx").display().to_string());
    assert_eq!(lines[5], "", "terminating blank line");
    Ok(())
}

#[test]
fn incremental_build_does_nothing() -> anyhow::Result<()> {
    let space = TestSpace::new()?;
    space.write_src("hello.cc", "#include \"hello.hxx\"\nint main;\n")?;
    space.write_src("hello.hxx", "int x;\n")?;

    {
        let mut proj = Project::load(&space);
        let obj = proj.add_obj(&space, "hello");
        proj.update(&[obj], 1)?;
    }
    let compiles = space.compile_runs();
    let deps = space.deps_runs();

    let mut proj = Project::load(&space);
    let obj = proj.add_obj(&space, "hello");
    let summary = proj.update(&[obj], 1)?;

    assert_eq!(state_of(&summary, obj), TargetState::Unchanged);
    assert_eq!(space.compile_runs(), compiles, "no tool invocation");
    assert_eq!(space.deps_runs(), deps, "cached extraction");
    Ok(())
}

#[test]
fn header_change_recompiles_without_rewriting_depdb() -> anyhow::Result<()> {
    let space = TestSpace::new()?;
    space.write_src("hello.cc", "#include \"hello.hxx\"\nint main;\n")?;
    space.write_src("hello.hxx", "int x;\n")?;

    {
        let mut proj = Project::load(&space);
        let obj = proj.add_obj(&space, "hello");
        proj.update(&[obj], 1)?;
    }
    let db_before = std::fs::read(space.obj_dir().join("hello.o.d"))?;
    let compiles = space.compile_runs();

    space.touch_src("hello.hxx")?;

    let mut proj = Project::load(&space);
    let obj = proj.add_obj(&space, "hello");
    let summary = proj.update(&[obj], 1)?;

    assert_eq!(state_of(&summary, obj), TargetState::Changed);
    assert_eq!(space.compile_runs(), compiles + 1);
    assert_eq!(
        std::fs::read(space.obj_dir().join("hello.o.d"))?,
        db_before,
        "depdb content unchanged"
    );
    Ok(())
}

#[test]
fn options_change_invalidates_depdb() -> anyhow::Result<()> {
    let space = TestSpace::new()?;
    space.write_src("hello.cc", "#include \"hello.hxx\"\nint main;\n")?;
    space.write_src("hello.hxx", "int x;\n")?;

    let checksum_before;
    {
        let mut proj = Project::load(&space);
        let obj = proj.add_obj(&space, "hello");
        proj.update(&[obj], 1)?;
        checksum_before = space.depdb_lines("hello.o")?[2].clone();
    }
    let compiles = space.compile_runs();
    let deps = space.deps_runs();

    let mut proj = Project::load_with_coptions(&space, &["-O2"]);
    let obj = proj.add_obj(&space, "hello");
    let summary = proj.update(&[obj], 1)?;

    assert_eq!(state_of(&summary, obj), TargetState::Changed);
    assert_eq!(space.compile_runs(), compiles + 1);
    assert_eq!(space.deps_runs(), deps + 1, "full re-extraction");
    let lines = space.depdb_lines("hello.o")?;
    assert_ne!(lines[2], checksum_before);
    assert_eq!(lines[4], space.src().join("hello.hxx").display().to_string());
    Ok(())
}

#[test]
fn library_prerequisite_is_consulted_but_not_executed() -> anyhow::Result<()> {
    let space = TestSpace::new()?;
    space.write_src("hello.cc", "int main;\n")?;

    let checksum_plain;
    {
        let mut proj = Project::load(&space);
        let obj = proj.add_obj(&space, "hello");
        proj.update(&[obj], 1)?;
        checksum_plain = space.depdb_lines("hello.o")?[2].clone();
    }
    let compiles = space.compile_runs();

    let mut proj = Project::load(&space);
    let obj = proj.add_obj(&space, "hello");
    let lib = proj.add_lib(&space, "util", &["-DUTIL"]);
    proj.add_prerequisite(obj, bx::prereq::Prerequisite::new(&LIB, "util", proj.scope));

    let summary = proj.update(&[obj], 1)?;
    assert_eq!(state_of(&summary, obj), TargetState::Changed);
    assert_eq!(space.compile_runs(), compiles + 1);

    // The exported options flowed into the checksum...
    assert_ne!(space.depdb_lines("hello.o")?[2], checksum_plain);
    // ...but the library itself was unmatched, not executed.
    let op = proj.ctx.targets.get(lib).opstate(perform_update());
    assert_eq!(op.count(), COUNT_TRIED);
    Ok(())
}

#[test]
fn missing_source_fails_the_build() -> anyhow::Result<()> {
    let space = TestSpace::new()?;

    let mut proj = Project::load(&space);
    let obj = proj.add_obj(&space, "nosuch");
    let summary = proj.update(&[obj], 1)?;

    assert_eq!(state_of(&summary, obj), TargetState::Failed);
    assert!(summary.failed());
    assert_eq!(bx::driver::exit_code(&Ok(summary)), 1);
    Ok(())
}
