//! Auto-generated header discovery: the extractor maps the missing
//! include through the prefix map, generates it, and restarts.

mod common;

use common::*;

use bx::target::TargetState;

#[test]
fn generated_header_triggers_one_restart() -> anyhow::Result<()> {
    let space = TestSpace::new()?;
    space.write_src("hello.cc", "#include \"gen.hxx\"\nint main;\n")?;

    let mut proj = Project::load(&space);
    let obj = proj.add_obj(&space, "hello");
    let gen = proj.add_gen_header(&space, "gen", "int gen;\n");

    let summary = proj.update(&[obj], 1)?;

    assert_eq!(state_of(&summary, obj), TargetState::Changed);
    let gen_path = space.obj_dir().join("gen.hxx");
    assert!(gen_path.is_file(), "header was generated");
    assert_eq!(std::fs::read_to_string(&gen_path)?, "int gen;\n");

    // First run aborted at the missing header, second completed: exactly
    // one restart.
    assert_eq!(space.deps_runs(), 2);
    assert_eq!(space.compile_runs(), 1);

    // The depdb records the generated header's mapped path.
    let lines = space.depdb_lines("hello.o")?;
    assert!(
        lines.contains(&gen_path.display().to_string()),
        "depdb {:?} should record {}",
        lines,
        gen_path.display()
    );

    assert_eq!(
        proj.ctx.targets.get(gen).state(bx::action::perform_update()),
        TargetState::Changed
    );
    Ok(())
}

#[test]
fn generated_header_is_cached_on_rebuild() -> anyhow::Result<()> {
    let space = TestSpace::new()?;
    space.write_src("hello.cc", "#include \"gen.hxx\"\nint main;\n")?;

    {
        let mut proj = Project::load(&space);
        let obj = proj.add_obj(&space, "hello");
        proj.add_gen_header(&space, "gen", "int gen;\n");
        proj.update(&[obj], 1)?;
    }
    let deps = space.deps_runs();
    let compiles = space.compile_runs();

    let mut proj = Project::load(&space);
    let obj = proj.add_obj(&space, "hello");
    proj.add_gen_header(&space, "gen", "int gen;\n");
    let summary = proj.update(&[obj], 1)?;

    assert_eq!(state_of(&summary, obj), TargetState::Unchanged);
    assert_eq!(space.deps_runs(), deps, "no extraction");
    assert_eq!(space.compile_runs(), compiles, "no recompilation");
    Ok(())
}

#[test]
fn missing_header_without_a_generating_rule_fails() -> anyhow::Result<()> {
    let space = TestSpace::new()?;
    // Includes a header that does not exist and that no rule can make.
    space.write_src("hello.cc", "#include \"no/such/prefix.hxx\"\nint main;\n")?;

    let mut proj = Project::load(&space);
    let obj = proj.add_obj(&space, "hello");
    let summary = proj.update(&[obj], 1)?;

    assert_eq!(state_of(&summary, obj), TargetState::Failed);
    Ok(())
}
