pub mod allocator;
pub mod coordinator;
pub mod prober;

#[cfg(test)]
pub mod test_support;
