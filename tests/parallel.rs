//! Parallel execution: independent targets build concurrently with
//! consistent per-target results, and a shared prerequisite (the output
//! directory) is executed exactly once.

mod common;

use common::*;

use bx::action::perform_update;
use bx::target::{TargetState, COUNT_EXECUTED};

#[test]
fn independent_targets_build_in_parallel() -> anyhow::Result<()> {
    let space = TestSpace::new()?;
    let names = ["a", "b", "c", "d"];
    for n in &names {
        space.write_src(&format!("{}.cc", n), &format!("int {};\n", n))?;
    }

    let mut proj = Project::load(&space);
    let objs: Vec<_> = names.iter().map(|n| proj.add_obj(&space, n)).collect();
    let summary = proj.update(&objs, 4)?;

    let a = perform_update();
    for (&tid, n) in objs.iter().zip(names.iter()) {
        assert_eq!(state_of(&summary, tid), TargetState::Changed, "obj {}", n);
        let op = proj.ctx.targets.get(tid).opstate(a);
        assert_eq!(op.count(), COUNT_EXECUTED);
        assert_eq!(op.state(), TargetState::Changed);
        assert!(space.obj_dir().join(format!("{}.o", n)).is_file());
    }
    // One compile per target, no duplicated executions.
    assert_eq!(space.compile_runs(), names.len());
    Ok(())
}

#[test]
fn parallel_rebuild_is_a_no_op() -> anyhow::Result<()> {
    let space = TestSpace::new()?;
    let names = ["a", "b", "c", "d"];
    for n in &names {
        space.write_src(&format!("{}.cc", n), &format!("int {};\n", n))?;
    }

    {
        let mut proj = Project::load(&space);
        let objs: Vec<_> = names.iter().map(|n| proj.add_obj(&space, n)).collect();
        proj.update(&objs, 4)?;
    }
    let compiles = space.compile_runs();

    let mut proj = Project::load(&space);
    let objs: Vec<_> = names.iter().map(|n| proj.add_obj(&space, n)).collect();
    let summary = proj.update(&objs, 4)?;

    for &tid in &objs {
        assert_eq!(state_of(&summary, tid), TargetState::Unchanged);
    }
    assert_eq!(space.compile_runs(), compiles);
    Ok(())
}

#[test]
fn parallel_clean() -> anyhow::Result<()> {
    let space = TestSpace::new()?;
    let names = ["a", "b", "c", "d"];
    for n in &names {
        space.write_src(&format!("{}.cc", n), &format!("int {};\n", n))?;
    }

    {
        let mut proj = Project::load(&space);
        let objs: Vec<_> = names.iter().map(|n| proj.add_obj(&space, n)).collect();
        proj.update(&objs, 4)?;
    }

    let mut proj = Project::load(&space);
    let objs: Vec<_> = names.iter().map(|n| proj.add_obj(&space, n)).collect();
    let summary = proj.clean(&objs, 4)?;

    for (&tid, n) in objs.iter().zip(names.iter()) {
        assert_eq!(state_of(&summary, tid), TargetState::Changed, "obj {}", n);
        assert!(!space.obj_dir().join(format!("{}.o", n)).exists());
    }
    Ok(())
}
