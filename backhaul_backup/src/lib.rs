//! Saving and restoring directory trees.
//!
//! The save side walks a tree one directory at a time ([`LevelSaver`]),
//! chunking file contents through the blob stack ([`FileSaver`]),
//! detecting hard links ([`LinkResolver`]), and skipping unchanged files
//! via the score map ([`CachingSaver`]). The restore side mirrors it:
//! [`LevelRestorer`] recreates one directory from a listing blob and
//! [`FileRestorer`] rebuilds file contents from chunk scores.
//!
//! Both walkers are deliberately non-recursive: each one calls a
//! *wrapped* saver/restorer for subdirectories, and [`TreeSaver`] /
//! [`TreeRestorer`] close the knot by handing each level a fresh copy of
//! themselves. One level is therefore testable with a stub in place of
//! the recursion.

mod cached;
mod chunker;
mod links;
mod restore;
mod save;

pub use cached::CachingSaver;
pub use chunker::{DEFAULT_CHUNK_SIZE, FileSaver, PathSaver, default_workers};
pub use links::LinkResolver;
pub use restore::{DirRestorer, FileRestorer, LevelRestorer, TreeRestorer};
pub use save::{DirSaver, LevelSaver, TreeSaver};
