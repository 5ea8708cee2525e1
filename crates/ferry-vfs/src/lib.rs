//! Virtual filesystem contract for ferry.
//!
//! The request dispatcher never touches storage directly. It talks to a
//! [`VfsOps`] implementation chosen per session. Key components:
//!
//! - [`VfsOps`] - Core trait for filesystem operations
//! - [`FileHandle`] - Positional I/O on an open file
//! - [`MemoryBackend`] - In-memory filesystem (for testing)
//! - [`LocalBackend`] - Local filesystem access (with path security)
//!
//! ## Design Decisions
//!
//! - **Resolve once**: Virtual paths are mapped to backend paths by
//!   [`VfsOps::resolve_path`]; everything else takes the resolved path.
//! - **Positional I/O**: Handles read and write at explicit offsets, so
//!   there is no append mode at the backend boundary.
//! - **Capabilities**: Backends advertise atomic renames, local quota
//!   tracking and ownership so callers can pick a strategy.

pub mod backends;
mod error;
mod ops;
mod types;

pub use backends::{LocalBackend, MemoryBackend};
pub use error::{VfsError, VfsResult};
pub use ops::{ATOMIC_UPLOAD_PREFIX, FileHandle, OpenFile, VfsOps};
pub use types::{Capabilities, DirEntry, FileAttr, FileType, OpenFlags, OsOpenFlags, SetAttr};
