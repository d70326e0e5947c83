pub mod action;
pub mod algorithm;
pub mod compile;
pub mod context;
pub mod depdb;
pub mod driver;
pub mod extract;
pub mod fs;
pub mod makedep;
pub mod prereq;
pub mod process;
pub mod rule;
pub mod rules;
pub mod scheduler;
pub mod scope;
pub mod smallmap;
pub mod store;
pub mod target;
pub mod variable;

#[cfg(not(windows))]
use jemallocator::Jemalloc;

#[cfg(not(windows))]
#[global_allocator]
static GLOBAL: Jemalloc = Jemalloc;
