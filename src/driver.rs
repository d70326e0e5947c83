//! The build driver: takes (action, target) requests against a loaded
//! context, runs the serialised match and execute phases over a worker
//! pool, and reports aggregate results with the exit-code contract
//! (0 success, 1 build failure, 2 usage/configuration error).

use crate::action::Action;
use crate::algorithm;
use crate::context::{Build, Context, Phase};
use crate::scheduler;
use crate::target::{TargetId, TargetState};

#[derive(Debug, Copy, Clone)]
pub struct Request {
    pub action: Action,
    pub target: TargetId,
}

pub struct Summary {
    /// Final state per requested target, in request order.
    pub states: Vec<(TargetId, TargetState)>,
}

impl Summary {
    pub fn failed(&self) -> bool {
        self.states.iter().any(|(_, s)| *s == TargetState::Failed)
    }

    pub fn changed(&self) -> usize {
        self.states
            .iter()
            .filter(|(_, s)| *s == TargetState::Changed)
            .count()
    }
}

/// Run the requests.  Consecutive requests with the same action form a
/// batch sharing one match and one execute phase; op-state is recreated
/// per batch.
pub fn perform(
    ctx: &Context,
    requests: &[Request],
    parallelism: usize,
) -> anyhow::Result<Summary> {
    ctx.assert_phase(Phase::Load);
    let mut states: Vec<(TargetId, TargetState)> = Vec::new();

    scheduler::with_scheduler(parallelism.max(1), |sched| {
        let mut i = 0;
        while i < requests.len() {
            let a = requests[i].action;
            let mut batch: Vec<TargetId> = Vec::new();
            while i < requests.len() && requests[i].action == a {
                batch.push(requests[i].target);
                i += 1;
            }
            tracing::debug!("{} of {} targets", a, batch.len());

            ctx.targets.for_each(|t| t.reset());

            ctx.set_phase(Phase::Match);
            for &tid in &batch {
                sched.submit_wait(move |sched| {
                    let b = Build { ctx, sched };
                    algorithm::match_(&b, a, tid);
                });
            }
            sched.wait_idle();

            let match_failed = batch
                .iter()
                .any(|&tid| ctx.targets.get(tid).state(a) == TargetState::Failed);

            if !match_failed || ctx.keep_going {
                ctx.set_phase(Phase::Execute);
                for &tid in &batch {
                    if ctx.targets.get(tid).state(a) == TargetState::Failed {
                        continue;
                    }
                    sched.submit_wait(move |sched| {
                        let b = Build { ctx, sched };
                        algorithm::execute(&b, a, tid);
                    });
                }
                sched.wait_idle();
            }

            for &tid in &batch {
                states.push((tid, algorithm::resolved_state(ctx, a, tid)));
            }
            ctx.set_phase(Phase::Load);
        }
    });

    Ok(Summary { states })
}

/// Map a driver outcome to the exit-code contract.
pub fn exit_code(result: &anyhow::Result<Summary>) -> i32 {
    match result {
        Ok(s) if !s.failed() => 0,
        Ok(_) => 1,
        Err(_) => 2,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn exit_codes() {
        let ok: anyhow::Result<Summary> = Ok(Summary {
            states: vec![(TargetId(0), TargetState::Changed)],
        });
        assert_eq!(exit_code(&ok), 0);

        let failed: anyhow::Result<Summary> = Ok(Summary {
            states: vec![(TargetId(0), TargetState::Failed)],
        });
        assert_eq!(exit_code(&failed), 1);

        let err: anyhow::Result<Summary> = Err(anyhow::anyhow!("bad configuration"));
        assert_eq!(exit_code(&err), 2);
    }
}
