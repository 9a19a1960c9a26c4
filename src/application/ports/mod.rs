pub mod container_runtime;
pub mod mirror;
pub mod proxy;
