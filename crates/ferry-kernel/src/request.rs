//! Protocol requests.

use ferry_vfs::{OpenFlags, SetAttr};
use std::str::FromStr;
use std::time::SystemTime;

use crate::error::{DispatchError, DispatchResult};
use crate::vpath;

/// Operation carried by a request.
///
/// Names match the protocol method strings ("Setstat", "Rename", ...).
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, strum::Display, strum::EnumString, strum::AsRefStr,
)]
pub enum Operation {
    List,
    Stat,
    Setstat,
    Rename,
    Rmdir,
    Mkdir,
    Symlink,
    Remove,
    Read,
    Write,
}

/// Attribute changes supplied with a Setstat. Each group is independent.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RequestAttrs {
    /// Permission bits.
    pub mode: Option<u32>,
    /// Owner and group ids.
    pub owner: Option<(u32, u32)>,
    /// Access and modification times.
    pub times: Option<(SystemTime, SystemTime)>,
}

impl RequestAttrs {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_mode(mut self, mode: u32) -> Self {
        self.mode = Some(mode);
        self
    }

    pub fn with_owner(mut self, uid: u32, gid: u32) -> Self {
        self.owner = Some((uid, gid));
        self
    }

    pub fn with_times(mut self, atime: SystemTime, mtime: SystemTime) -> Self {
        self.times = Some((atime, mtime));
        self
    }

    /// Build the backend change record. Absent groups stay `None`.
    pub fn to_set_attr(&self) -> SetAttr {
        let mut set = SetAttr::new();
        if let Some(mode) = self.mode {
            set = set.with_perm(mode);
        }
        if let Some((uid, gid)) = self.owner {
            set = set.with_owner(uid, gid);
        }
        if let Some((atime, mtime)) = self.times {
            set = set.with_times(atime, mtime);
        }
        set
    }
}

/// One protocol call. Immutable once built.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Request {
    operation: Operation,
    path: String,
    target: Option<String>,
    flags: OpenFlags,
    attrs: RequestAttrs,
}

impl Request {
    /// Create a request for `operation` on the virtual `path`.
    pub fn new(operation: Operation, path: &str) -> Self {
        Self {
            operation,
            path: vpath::clean(path),
            target: None,
            flags: OpenFlags::default(),
            attrs: RequestAttrs::default(),
        }
    }

    /// Create a request from a protocol method name.
    pub fn from_method(method: &str, path: &str) -> DispatchResult<Self> {
        let operation = Operation::from_str(method)
            .map_err(|_| DispatchError::unsupported(format!("unknown method {method:?}")))?;
        Ok(Self::new(operation, path))
    }

    /// Set the target path (rename destination, new symlink).
    pub fn with_target(mut self, target: &str) -> Self {
        self.target = (!target.is_empty()).then(|| vpath::clean(target));
        self
    }

    pub fn with_flags(mut self, flags: OpenFlags) -> Self {
        self.flags = flags;
        self
    }

    pub fn with_attrs(mut self, attrs: RequestAttrs) -> Self {
        self.attrs = attrs;
        self
    }

    pub fn operation(&self) -> Operation {
        self.operation
    }

    pub fn path(&self) -> &str {
        &self.path
    }

    pub fn target(&self) -> Option<&str> {
        self.target.as_deref()
    }

    pub fn flags(&self) -> OpenFlags {
        self.flags
    }

    pub fn attrs(&self) -> &RequestAttrs {
        &self.attrs
    }

    /// Parent directory of the request path, where most permissions apply.
    pub fn parent_dir(&self) -> String {
        vpath::parent(&self.path)
    }
}
