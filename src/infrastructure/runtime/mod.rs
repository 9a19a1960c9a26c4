mod cli;

pub use cli::CliRuntime;
