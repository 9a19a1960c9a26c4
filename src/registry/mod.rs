mod models;
pub mod reconciler;
mod store;

pub use models::*;
pub use store::Registry;
