//! Actions: what is being done to a target, as a (meta-operation,
//! operation) pair, e.g. `perform update` or `perform clean`.

use std::fmt;

pub type MetaOpId = u8;
pub type OpId = u8;

pub const PERFORM: MetaOpId = 1;

pub const UPDATE: OpId = 1;
pub const CLEAN: OpId = 2;

/// Number of registered operations; sizes the per-target op-state table.
pub const N_OPERATIONS: usize = 2;

/// How a recipe traverses its prerequisites during execution.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExecutionMode {
    /// Declared order (update-like operations).
    Straight,
    /// Last to first (clean-like operations).
    Reverse,
}

pub struct OperationInfo {
    pub id: OpId,
    pub name: &'static str,
    pub mode: ExecutionMode,
}

pub static OPERATIONS: [OperationInfo; N_OPERATIONS] = [
    OperationInfo {
        id: UPDATE,
        name: "update",
        mode: ExecutionMode::Straight,
    },
    OperationInfo {
        id: CLEAN,
        name: "clean",
        mode: ExecutionMode::Reverse,
    },
];

pub fn operation(op: OpId) -> &'static OperationInfo {
    &OPERATIONS[(op - 1) as usize]
}

fn meta_operation_name(mo: MetaOpId) -> &'static str {
    match mo {
        PERFORM => "perform",
        _ => "unknown",
    }
}

/// The derived ordering makes an outer action (greater meta-operation)
/// compare greater than its inner counterpart, which is what the recipe
/// override check in `Target::set_recipe` relies on.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Action {
    pub meta_op: MetaOpId,
    pub op: OpId,
}

impl Action {
    pub fn new(meta_op: MetaOpId, op: OpId) -> Self {
        Action { meta_op, op }
    }

    /// Index into the per-target op-state table.
    pub fn index(&self) -> usize {
        (self.op - 1) as usize
    }

    pub fn mode(&self) -> ExecutionMode {
        operation(self.op).mode
    }
}

pub fn perform_update() -> Action {
    Action::new(PERFORM, UPDATE)
}

pub fn perform_clean() -> Action {
    Action::new(PERFORM, CLEAN)
}

impl fmt::Display for Action {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} {}",
            meta_operation_name(self.meta_op),
            operation(self.op).name
        )
    }
}
