// Library crate for annexfs: re-export internal modules for reuse by the CLI
// binary and integration tests.

pub mod annex;
pub mod dataset;
pub mod error;
pub mod fetch;
pub mod fuse;
pub mod vfs;
