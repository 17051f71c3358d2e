//! Archive creation: filtered filesystem walk emitting a tar.gz stream.

mod archiver;
mod excludes;

pub use archiver::{resolve_includes, Archiver};
pub use excludes::ExcludeSet;
