//! A filesystem storing file contents as fixed-size, content-addressed
//! blocks in a pluggable object store, and the tree of files and directories
//! in a separate metadata store.

mod digests;
mod errors;

pub mod backend;
pub mod blocks;
pub mod fs;
pub mod metadata;
pub mod namespace;
pub mod path;

#[cfg(test)]
mod fixtures;

// templates defined in submodules refer to it through the crate root
#[cfg(test)]
use rstest_reuse;

pub use blocks::Config;
pub use digests::{B3Digest, B3_LEN};
pub use errors::Error;
pub use fs::CloudFs;
