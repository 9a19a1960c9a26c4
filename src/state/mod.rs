mod app_context;
mod scope_locks;

pub use app_context::AppContext;
pub use scope_locks::ScopeLocks;
