//! Shared utilities across rootsmith modules.

pub mod archive;
pub mod files;
pub mod hash;
pub mod temp;

pub use archive::{pack_members, pack_tree, tree_stats, unpack_tar_gz, TreeStats};
pub use files::{empty_dir, write_file_mode, write_file_with_dirs};
pub use hash::{hash_file, hash_tree, DigestAlgorithm};
pub use temp::{cleanup_work_dir, prepare_work_dir};
