//! # ferry-kernel
//!
//! File-operation core for ferry sessions.
//!
//! A [`Session`] binds an authenticated user to a [`ferry_vfs::VfsOps`]
//! backend and a [`QuotaLedger`]. Its [`RequestDispatcher`] turns protocol
//! requests into backend calls:
//! - Authorizes every request against the user's per-directory permissions
//!   and file filters before touching storage
//! - Plans each upload as a new file, an overwrite or a resume, and decides
//!   whether it is staged and renamed into place
//! - Bounds each upload by the remaining quota and reconciles the ledger
//!   exactly once when the transfer finishes
//!
//! Configuration is TOML, see [`ServerConfig`].

pub mod config;
pub mod constants;
pub mod dispatch;
pub mod error;
pub mod lister;
pub mod permissions;
pub mod planner;
pub mod quota;
pub mod request;
pub mod session;
pub mod transfer;
pub mod user;
pub mod vpath;

pub use config::{ConfigError, ServerConfig, TransferSettings, UserConfig};
pub use dispatch::RequestDispatcher;
pub use error::{DispatchError, DispatchResult, StatusCode};
pub use lister::Lister;
pub use permissions::{FileFilter, FileFilters, PatternFilter, Permission, PermissionGate, PermissionRules};
pub use planner::{AtomicUploadPlanner, TransferPlan, UploadMode};
pub use quota::{
    MemoryLedger, QuotaCheck, QuotaEnforcer, QuotaError, QuotaLedger, QuotaScope, Usage,
    WriteLimit,
};
pub use request::{Operation, Request, RequestAttrs};
pub use session::{NetConn, Session};
pub use transfer::{Transfer, TransferFactory, TransferKind, TransferRegistry};
pub use user::{UserProfile, VirtualFolder};
