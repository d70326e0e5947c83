//! The match and execute engines: per-target state machines advanced by
//! compare-exchange on the op-state task counter, rule selection in scope
//! order, and recursive recipe execution.
//!
//! The per-target lock is the task counter itself: TOUCHED and MATCHED
//! double as the lock marker, and a holder either publishes APPLIED or
//! restores the offset it acquired from.  Acquisition never blocks; the
//! only blocking primitive is the scheduler wait-group on the counter.

use std::cell::RefCell;

use anyhow::bail;

use crate::action::{Action, ExecutionMode};
use crate::context::{Build, Context, Phase};
use crate::fs::FileTime;
use crate::prereq;
use crate::rule::Recipe;
use crate::target::{
    aggregate, count_is_locked, OpState, Target, TargetId, TargetState, COUNT_APPLIED,
    COUNT_BUSY, COUNT_EXECUTED, COUNT_MATCHED, COUNT_TOUCHED, COUNT_TRIED, COUNT_UNTOUCHED,
};

use std::sync::atomic::Ordering;

thread_local! {
    /// Target locks held by this worker, outermost first.  A lock
    /// acquisition that finds its target here has looped back through
    /// the dependency graph.
    static LOCK_STACK: RefCell<Vec<(Action, TargetId)>> = const { RefCell::new(Vec::new()) };
}

fn held_here(a: Action, t: TargetId) -> bool {
    LOCK_STACK.with(|s| s.borrow().iter().any(|&e| e == (a, t)))
}

/// Scoped hold of a target's advancement slot.
pub struct TargetLock<'t> {
    op: &'t OpState,
    a: Action,
    t: TargetId,
    /// Counter value observed at acquisition.
    pub offset: usize,
    released: bool,
}

impl<'t> TargetLock<'t> {
    /// Publish the given offset and drop the hold.
    pub fn release(mut self, to: usize, b: &Build) {
        self.op.task_count.store(to, Ordering::Release);
        self.released = true;
        LOCK_STACK.with(|s| {
            let popped = s.borrow_mut().pop();
            debug_assert_eq!(popped, Some((self.a, self.t)));
        });
        b.sched.notify_progress();
    }

    /// Advance the held slot (TOUCHED -> MATCHED).
    fn advance(&self, to: usize) {
        self.op.task_count.store(to, Ordering::Release);
    }
}

impl Drop for TargetLock<'_> {
    fn drop(&mut self) {
        if !self.released {
            // Unwinding past a held lock: restore the acquisition offset
            // so the target is not left locked forever.
            self.op.task_count.store(self.offset, Ordering::Release);
            LOCK_STACK.with(|s| {
                s.borrow_mut().pop();
            });
        }
    }
}

pub enum Lock<'t> {
    /// Already applied (or beyond); the observed state is published.
    Done(TargetState),
    Held(TargetLock<'t>),
}

/// Acquire the target lock for (action, target): bind the target's
/// advancement slot to this worker.  Never blocks on a free slot; waits
/// out another worker's in-progress transition; detects a cycle when the
/// holder is an ancestor on this worker's own stack.  Rule authors use
/// this for out-of-band op-state access; release is guaranteed on every
/// exit path.
pub fn target_lock<'t>(b: &Build, a: Action, t: &'t Target) -> Lock<'t> {
    lock(b, a, t)
}

fn lock<'t>(b: &Build, a: Action, t: &'t Target) -> Lock<'t> {
    let op = t.opstate(a);
    loop {
        let cur = op.count();
        match cur {
            COUNT_UNTOUCHED | COUNT_TRIED => {
                if op
                    .task_count
                    .compare_exchange(cur, COUNT_TOUCHED, Ordering::AcqRel, Ordering::Acquire)
                    .is_ok()
                {
                    LOCK_STACK.with(|s| s.borrow_mut().push((a, t.id)));
                    return Lock::Held(TargetLock {
                        op,
                        a,
                        t: t.id,
                        offset: cur,
                        released: false,
                    });
                }
            }
            COUNT_TOUCHED | COUNT_MATCHED => {
                if held_here(a, t.id) {
                    // The holder is an ancestor on this worker's own
                    // stack: the dependency graph loops back here.
                    tracing::error!("dependency cycle detected involving target {}", t);
                    return Lock::Done(TargetState::Failed);
                }
                b.sched.wait_until(&op.task_count, |c| !count_is_locked(c));
            }
            _ => return Lock::Done(op.state()),
        }
    }
}

/// Install the prepared recipe.  Only a noop recipe may be overridden
/// (an outer action re-matching), and a fresh match resets the
/// dependents count.
fn set_recipe(t: &Target, a: Action, r: Recipe) {
    let op = t.opstate(a);
    let mut inner = op.inner();
    let override_ = inner.recipe.is_some();
    if override_ {
        assert!(
            inner.recipe.as_ref().unwrap().is_noop(),
            "recipe override for {} with non-noop recipe",
            t
        );
    }
    let noop = r.is_noop();
    inner.recipe = Some(r);
    drop(inner);
    // A noop recipe means unchanged by construction; don't waste an
    // execution on it.
    op.set_state(if noop {
        TargetState::Unchanged
    } else {
        TargetState::Unknown
    });
    if !override_ {
        op.dependents.store(0, Ordering::Release);
    }
}

fn match_impl(b: &Build, a: Action, tid: TargetId, fail: bool) -> Option<TargetState> {
    b.ctx.assert_phase(Phase::Match);
    let t = b.ctx.targets.get(tid);

    let held = match lock(b, a, t) {
        Lock::Done(s) => return Some(s),
        Lock::Held(l) => l,
    };

    // Select a rule: walk scopes from the target's base scope outward;
    // within each scope the registry yields candidates in tie-break
    // order.  First truthy match wins.
    let selected = (|| -> anyhow::Result<Option<(String, std::sync::Arc<dyn crate::rule::Rule>)>> {
        let base = b.ctx.scopes.find(t.out_dir()).id;
        for sid in b.ctx.scopes.chain(base) {
            let scope = b.ctx.scopes.get(sid);
            if scope.rules.is_empty() {
                continue;
            }
            for (name, rule) in scope.rules.candidates(a, t.tt) {
                tracing::trace!("trying rule {} to {} target {}", name, a, t);
                if rule.matches(b, a, tid, name)? {
                    return Ok(Some((name.clone(), rule.clone())));
                }
            }
        }
        Ok(None)
    })();

    let (name, rule): (String, std::sync::Arc<dyn crate::rule::Rule>) = match selected {
        Err(e) => {
            tracing::error!("{:#}; while matching rule to {} target {}", e, a, t);
            t.opstate(a).set_state(TargetState::Failed);
            held.release(COUNT_APPLIED, b);
            return Some(TargetState::Failed);
        }
        Ok(None) => {
            if fail {
                tracing::error!("no rule to {} target {}", a, t);
                t.opstate(a).set_state(TargetState::Failed);
                held.release(COUNT_APPLIED, b);
                return Some(TargetState::Failed);
            }
            let offset = held.offset;
            held.release(offset, b);
            return None;
        }
        Ok(Some((name, rule))) => (name, rule),
    };

    held.advance(COUNT_MATCHED);
    t.opstate(a).inner().rule = Some((name.clone(), rule.clone()));
    tracing::debug!("matched rule {} to {} target {}", name, a, t);

    match rule.apply(b, a, tid) {
        Ok(recipe) => {
            set_recipe(t, a, recipe);
            let s = t.opstate(a).state();
            held.release(COUNT_APPLIED, b);
            Some(s)
        }
        Err(e) => {
            tracing::error!("{:#}; while applying rule {} to {} target {}", e, name, a, t);
            t.opstate(a).set_state(TargetState::Failed);
            held.release(COUNT_APPLIED, b);
            Some(TargetState::Failed)
        }
    }
}

/// Match a rule to the target, preparing its recipe.  Counts the caller
/// as a dependent.  Failure is reported through the returned state.
pub fn match_(b: &Build, a: Action, tid: TargetId) -> TargetState {
    let s = match_impl(b, a, tid, true).unwrap();
    b.ctx
        .targets
        .get(tid)
        .opstate(a)
        .dependents
        .fetch_add(1, Ordering::AcqRel);
    s
}

/// Like `match_`, but "no rule applies" is an answer (None) rather than
/// a failure.
pub fn try_match(b: &Build, a: Action, tid: TargetId) -> Option<TargetState> {
    let s = match_impl(b, a, tid, false)?;
    b.ctx
        .targets
        .get(tid)
        .opstate(a)
        .dependents
        .fetch_add(1, Ordering::AcqRel);
    Some(s)
}

/// Match for the inner action: outer meta-operations delegate the bulk
/// of their work to their `perform` counterpart.
pub fn match_inner(b: &Build, a: Action, tid: TargetId) -> TargetState {
    match_(b, Action::new(crate::action::PERFORM, a.op), tid)
}

/// Abandon a match made on the caller's behalf: used for targets that
/// are consulted for their metadata only (e.g. a library whose exported
/// options we hash) and need not be executed.  Succeeds if the target's
/// state is unchanged or other dependents keep it alive.
pub fn unmatch(b: &Build, a: Action, tid: TargetId) -> bool {
    let op = b.ctx.targets.get(tid).opstate(a);
    let remaining = op.dependents.fetch_sub(1, Ordering::AcqRel) - 1;
    let s = op.state();
    if s == TargetState::Unchanged || remaining > 0 {
        if remaining == 0 {
            // Nobody depends on it; keep it from executing.
            let _ = op.task_count.compare_exchange(
                COUNT_APPLIED,
                COUNT_TRIED,
                Ordering::AcqRel,
                Ordering::Acquire,
            );
            b.sched.notify_progress();
        }
        true
    } else {
        op.dependents.fetch_add(1, Ordering::AcqRel);
        false
    }
}

/// Search all declared prerequisites of the target, match each, and
/// record the resolved targets in the op-state.  Returns the aggregated
/// match state.
pub fn match_prerequisites(b: &Build, a: Action, tid: TargetId) -> anyhow::Result<TargetState> {
    let t = b.ctx.targets.get(tid);
    let mut agg = TargetState::Unchanged;
    for p in &t.prerequisites {
        let pid = prereq::search(b.ctx, t, p)?;
        let s = match_(b, a, pid);
        if s == TargetState::Failed {
            if !b.ctx.keep_going {
                bail!("failed to match prerequisite {} of {}", p, t);
            }
            agg = TargetState::Failed;
        }
        t.opstate(a).inner().prerequisite_targets.push(pid);
    }
    Ok(agg)
}

/// Resolve each prerequisite and expand see-through groups into their
/// members.  The match engine sees members; the group stays hidden.
pub fn prerequisite_members(
    b: &Build,
    _a: Action,
    tid: TargetId,
) -> anyhow::Result<Vec<TargetId>> {
    let t = b.ctx.targets.get(tid);
    let mut out = Vec::new();
    for p in &t.prerequisites {
        let pid = prereq::search(b.ctx, t, p)?;
        let pt = b.ctx.targets.get(pid);
        if pt.tt.see_through && !pt.members.is_empty() {
            out.extend_from_slice(&pt.members);
        } else {
            out.push(pid);
        }
    }
    Ok(out)
}

/// Members a group exposes under this action (empty unless see-through
/// or populated during load).
pub fn resolve_group_members<'c>(ctx: &'c Context, _a: Action, gid: TargetId) -> &'c [TargetId] {
    &ctx.targets.get(gid).members
}

/// The published state with group redirection resolved.
pub fn resolved_state(ctx: &Context, a: Action, tid: TargetId) -> TargetState {
    let mut id = tid;
    loop {
        let t = ctx.targets.get(id);
        let s = t.opstate(a).state();
        if s != TargetState::Group {
            return s;
        }
        id = *t.group.get().expect("group state on ungrouped target");
    }
}

fn try_claim_execute(b: &Build, a: Action, tid: TargetId) {
    let op = b.ctx.targets.get(tid).opstate(a);
    if op
        .task_count
        .compare_exchange(COUNT_APPLIED, COUNT_BUSY, Ordering::AcqRel, Ordering::Acquire)
        .is_ok()
    {
        run_recipe(b, a, tid);
    }
}

/// Queue an execution.  Opportunistic: the task claims the target or
/// returns, leaving the result to whoever did claim it.
pub fn execute_async(b: &Build, a: Action, tid: TargetId) {
    let ctx = b.ctx;
    b.sched.submit(move |sched| {
        let b = Build { ctx, sched };
        try_claim_execute(&b, a, tid);
    });
}

fn execute_impl(b: &Build, a: Action, tid: TargetId) -> TargetState {
    let t = b.ctx.targets.get(tid);
    let op = t.opstate(a);
    loop {
        match op.task_count.compare_exchange(
            COUNT_APPLIED,
            COUNT_BUSY,
            Ordering::AcqRel,
            Ordering::Acquire,
        ) {
            Ok(_) => return run_recipe(b, a, tid),
            Err(COUNT_EXECUTED) => return resolved_state(b.ctx, a, tid),
            Err(COUNT_BUSY) => {
                // Another worker owns it; join the wait-group.
                b.sched.wait_count(&op.task_count, COUNT_EXECUTED);
                return resolved_state(b.ctx, a, tid);
            }
            Err(COUNT_TRIED) => {
                // Deliberately unmatched; nothing to execute.
                return op.state();
            }
            Err(COUNT_UNTOUCHED) => {
                panic!("execute of unmatched target {}", t);
            }
            Err(c) if count_is_locked(c) => {
                // Still being matched (direct execution during the match
                // phase can race another worker's match).
                b.sched.wait_until(&op.task_count, |c| !count_is_locked(c));
            }
            Err(c) => unreachable!("bad task count {}", c),
        }
    }
}

/// Execute the target's recipe (or join an execution in progress) and
/// return the final state.  Requires the execute phase.
pub fn execute(b: &Build, a: Action, tid: TargetId) -> TargetState {
    b.ctx.assert_phase(Phase::Execute);
    execute_impl(b, a, tid)
}

/// Execute, waiting for completion.  Alias of `execute` for callers that
/// got the target from an async submission.
pub fn execute_wait(b: &Build, a: Action, tid: TargetId) -> TargetState {
    b.ctx.assert_phase(Phase::Execute);
    execute_impl(b, a, tid)
}

/// Immediate execution, sanctioned during the match phase: the dynamic
/// prerequisite extractor updates discovered prerequisites while the
/// consuming target is still being matched.
pub fn execute_direct(b: &Build, a: Action, tid: TargetId) -> TargetState {
    execute_impl(b, a, tid)
}

fn run_recipe(b: &Build, a: Action, tid: TargetId) -> TargetState {
    let t = b.ctx.targets.get(tid);
    let op = t.opstate(a);
    let recipe = op.recipe();

    let result: anyhow::Result<TargetState> = match recipe {
        None => {
            if op.state() == TargetState::Failed {
                Ok(TargetState::Failed)
            } else {
                panic!("applied target {} has no recipe", t)
            }
        }
        Some(Recipe::Noop) => Ok(TargetState::Unchanged),
        Some(Recipe::Default) => {
            execute_prerequisites(b, a, tid, FileTime::UNKNOWN, None, 0).map(|r| r.state)
        }
        Some(Recipe::Group) => {
            let g = *t.group.get().expect("group recipe on ungrouped target");
            match execute_impl(b, a, g) {
                TargetState::Failed => Ok(TargetState::Failed),
                _ => Ok(TargetState::Group),
            }
        }
        Some(Recipe::Func(f)) => f(b, a, tid),
    };

    let s = match result {
        Ok(s) => s,
        Err(e) => {
            tracing::error!("{:#}; while executing {} target {}", e, a, t);
            TargetState::Failed
        }
    };
    op.set_state(s);
    op.task_count.store(COUNT_EXECUTED, Ordering::Release);
    b.sched.notify_progress();
    s
}

pub struct PrereqState {
    pub state: TargetState,
    /// Whether any prerequisite forces an update: its execution changed
    /// it, or it is newer than the given timestamp.
    pub update: bool,
    /// First forcing prerequisite that passes the filter.
    pub newer: Option<TargetId>,
}

/// Execute the first `count` recorded prerequisite targets (0 means all)
/// in the operation's traversal order, aggregating their states.  Sibling
/// executions are queued for other workers; this thread visits each in
/// order, claiming or joining as needed.
pub fn execute_prerequisites(
    b: &Build,
    a: Action,
    tid: TargetId,
    mtime: FileTime,
    filter: Option<&dyn Fn(&Target) -> bool>,
    count: usize,
) -> anyhow::Result<PrereqState> {
    let t = b.ctx.targets.get(tid);
    let mut list: Vec<TargetId> = {
        let inner = t.opstate(a).inner();
        let v = &inner.prerequisite_targets;
        let n = if count == 0 { v.len() } else { count.min(v.len()) };
        v[..n].to_vec()
    };
    if a.mode() == ExecutionMode::Reverse {
        list.reverse();
    }

    if b.sched.parallelism() > 1 {
        for &p in &list {
            execute_async(b, a, p);
        }
    }

    let mut state = TargetState::Unchanged;
    let mut update = false;
    let mut newer = None;
    for &p in &list {
        execute_impl(b, a, p);
        let s = resolved_state(b.ctx, a, p);
        if s == TargetState::Failed {
            state = TargetState::Failed;
            if !b.ctx.keep_going {
                break;
            }
            continue;
        }
        if s != TargetState::Unknown {
            state = aggregate(state, s);
        }
        let pt = b.ctx.targets.get(p);
        let mt = pt.mtime();
        let forcing =
            s == TargetState::Changed || (mtime.is_known() && mt.exists() && mt > mtime);
        if forcing {
            update = true;
            if newer.is_none() && filter.map_or(true, |f| f(pt)) {
                newer = Some(p);
            }
        }
    }
    Ok(PrereqState {
        state,
        update,
        newer,
    })
}
