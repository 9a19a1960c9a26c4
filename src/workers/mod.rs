mod grace_sweeper;
mod reconciler;

pub use grace_sweeper::run_grace_sweeper;
pub use reconciler::run_reconciler;
