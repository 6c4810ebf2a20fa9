//! Virtual filesystem core: the operation state machine and its handle
//! table.

pub mod driver;
pub mod handle;

pub use driver::{
    CacheClearPolicy, DirEntry, DriverConfig, FileAttr, FileKind, VfsDriver,
};
