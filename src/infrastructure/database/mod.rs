mod sqlite_mirror;

pub use sqlite_mirror::SqliteMirror;
