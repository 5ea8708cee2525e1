//! Request dispatch.
//!
//! [`RequestDispatcher`] is the protocol-facing surface of a session. Every
//! entry point refreshes the session's activity timestamp, authorizes
//! against the user's permission rules and then touches the backend.
//! Authorization always happens before any open, rename or mutation.

mod upload;

use ferry_vfs::{DirEntry, VfsOps};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use crate::constants::DEFAULT_DIR_MODE;
use crate::error::{DispatchError, DispatchResult, StatusCode};
use crate::lister::Lister;
use crate::permissions::{Permission, PermissionGate};
use crate::request::{Operation, Request};
use crate::session::Session;
use crate::transfer::Transfer;
use crate::vpath;

/// Dispatches protocol requests for one session.
#[derive(Debug, Clone)]
pub struct RequestDispatcher {
    session: Arc<Session>,
}

impl RequestDispatcher {
    pub fn new(session: Arc<Session>) -> Self {
        Self { session }
    }

    pub fn session(&self) -> &Arc<Session> {
        &self.session
    }

    fn fs(&self) -> &dyn VfsOps {
        self.session.fs().as_ref()
    }

    fn authorize(&self, perm: Permission, virtual_dir: &str) -> DispatchResult<()> {
        if PermissionGate::authorize(self.session.user(), perm, virtual_dir) {
            Ok(())
        } else {
            tracing::debug!(
                user = %self.session.user().username(),
                permission = %perm,
                dir = %virtual_dir,
                "permission denied"
            );
            Err(DispatchError::permission_denied(format!(
                "{perm} on {virtual_dir}"
            )))
        }
    }

    fn check_allowed(&self, virtual_path: &str) -> DispatchResult<()> {
        if PermissionGate::is_file_allowed(self.session.user(), virtual_path) {
            Ok(())
        } else {
            tracing::debug!(
                user = %self.session.user().username(),
                path = %virtual_path,
                "file name rejected by filters"
            );
            Err(DispatchError::not_allowed(virtual_path))
        }
    }

    /// Ownership failures are logged, never fatal.
    async fn set_owner_logged(&self, path: &Path) {
        let user = self.session.user();
        if let Err(e) = self.fs().set_owner(path, user.uid(), user.gid()).await {
            tracing::warn!(
                path = %path.display(),
                uid = user.uid(),
                gid = user.gid(),
                error = %e,
                "unable to set owner"
            );
        }
    }

    // ========================================================================
    // Read
    // ========================================================================

    /// Open a download.
    #[tracing::instrument(skip(self, request), fields(session = %self.session.id(), path = %request.path()), name = "ferry.read")]
    pub async fn read(&self, request: &Request) -> DispatchResult<Transfer> {
        self.session.update_last_activity();

        self.authorize(Permission::Download, &request.parent_dir())?;
        self.check_allowed(request.path())?;

        let path = self.fs().resolve_path(request.path()).await?;
        let file = self.fs().open_read(&path, 0).await.map_err(|e| {
            tracing::warn!(path = %path.display(), error = %e, "could not open file for reading");
            e
        })?;

        Ok(self
            .session
            .transfer_factory()
            .download(file, request.path(), path))
    }

    // ========================================================================
    // List
    // ========================================================================

    /// List a directory or stat a single path.
    #[tracing::instrument(skip(self, request), fields(session = %self.session.id(), op = %request.operation(), path = %request.path()), name = "ferry.list")]
    pub async fn list(&self, request: &Request) -> DispatchResult<Lister> {
        self.session.update_last_activity();

        match request.operation() {
            Operation::List => {
                self.authorize(Permission::ListItems, request.path())?;
                let path = self.fs().resolve_path(request.path()).await?;
                let entries = self.fs().readdir(&path).await?;
                Ok(Lister::new(entries))
            }
            Operation::Stat => {
                self.authorize(Permission::ListItems, &request.parent_dir())?;
                let path = self.fs().resolve_path(request.path()).await?;
                let attr = self.fs().stat(&path).await?;
                Ok(Lister::single(DirEntry::new(
                    vpath::base_name(request.path()),
                    attr,
                )))
            }
            op => Err(DispatchError::unsupported(format!("{op} is not a listing"))),
        }
    }

    // ========================================================================
    // Commands
    // ========================================================================

    /// Run a state-changing command.
    #[tracing::instrument(skip(self, request), fields(session = %self.session.id(), op = %request.operation(), path = %request.path()), name = "ferry.command")]
    pub async fn command(&self, request: &Request) -> DispatchResult<StatusCode> {
        self.session.update_last_activity();

        let path = self.fs().resolve_path(request.path()).await?;
        let target = match request.target() {
            Some(target) => Some(self.fs().resolve_path(target).await?),
            None => None,
        };

        match request.operation() {
            Operation::Setstat => self.setstat(request, &path).await?,
            Operation::Rename => self.rename(request, &path, target).await?,
            Operation::Rmdir => self.rmdir(request, &path).await?,
            Operation::Mkdir => self.mkdir(request, &path).await?,
            Operation::Symlink => self.symlink(request, &path, target).await?,
            Operation::Remove => self.remove(request, &path).await?,
            op @ (Operation::List | Operation::Stat | Operation::Read | Operation::Write) => {
                return Err(DispatchError::unsupported(format!("{op} is not a command")));
            }
        }
        Ok(StatusCode::Ok)
    }

    async fn setstat(&self, request: &Request, path: &Path) -> DispatchResult<()> {
        let attrs = request.attrs();
        let dir = request.parent_dir();
        if attrs.mode.is_some() {
            self.authorize(Permission::Chmod, &dir)?;
        }
        if attrs.owner.is_some() {
            self.authorize(Permission::Chown, &dir)?;
        }
        if attrs.times.is_some() {
            self.authorize(Permission::Chtimes, &dir)?;
        }

        let set = attrs.to_set_attr();
        if set.is_empty() {
            return Ok(());
        }
        self.fs().setattr(path, set).await?;
        tracing::debug!(path = %path.display(), "attributes updated");
        Ok(())
    }

    async fn rename(
        &self,
        request: &Request,
        source: &Path,
        target: Option<PathBuf>,
    ) -> DispatchResult<()> {
        let (Some(target_vpath), Some(target)) = (request.target(), target) else {
            return Err(DispatchError::failure("rename requires a target"));
        };

        self.authorize(Permission::Rename, &request.parent_dir())?;
        self.authorize(Permission::Rename, &vpath::parent(target_vpath))?;
        self.check_allowed(request.path())?;
        self.check_allowed(target_vpath)?;

        if source == target.as_path() {
            tracing::debug!(path = %request.path(), "rename onto itself");
            return Ok(());
        }

        let source_attr = self.fs().lstat(source).await?;
        let replaced = match self.fs().lstat(&target).await {
            Ok(attr) => Some(attr),
            Err(e) if e.is_not_found() => None,
            Err(e) => return Err(e.into()),
        };

        self.fs().rename(source, &target).await?;

        let quota = self.session.quota();
        let target_scope = quota.scope(target_vpath);
        if let Some(attr) = replaced.filter(|a| a.is_file()) {
            quota.commit_to(&target_scope, -1, -(attr.size as i64));
        }
        if source_attr.is_file() {
            let source_scope = quota.scope(request.path());
            if source_scope != target_scope {
                let size = source_attr.size as i64;
                quota.commit_to(&source_scope, -1, -size);
                quota.commit_to(&target_scope, 1, size);
            }
        }

        tracing::info!(
            source = %request.path(),
            target = %target_vpath,
            "renamed"
        );
        Ok(())
    }

    async fn rmdir(&self, request: &Request, path: &Path) -> DispatchResult<()> {
        self.authorize(Permission::Delete, &request.parent_dir())?;

        let attr = self.fs().lstat(path).await?;
        if !attr.is_dir() {
            return Err(DispatchError::failure(format!(
                "{} is not a directory",
                request.path()
            )));
        }
        self.fs().rmdir(path).await?;
        tracing::info!(path = %request.path(), "directory removed");
        Ok(())
    }

    async fn mkdir(&self, request: &Request, path: &Path) -> DispatchResult<()> {
        self.authorize(Permission::CreateDirs, &request.parent_dir())?;

        self.fs().mkdir(path, DEFAULT_DIR_MODE).await?;
        self.set_owner_logged(path).await;
        tracing::info!(path = %request.path(), "directory created");
        Ok(())
    }

    /// The request path is the referent; the target is the new link.
    async fn symlink(
        &self,
        request: &Request,
        referent: &Path,
        link: Option<PathBuf>,
    ) -> DispatchResult<()> {
        let (Some(link_vpath), Some(link)) = (request.target(), link) else {
            return Err(DispatchError::failure("symlink requires a link path"));
        };

        self.authorize(Permission::CreateSymlinks, &vpath::parent(link_vpath))?;

        self.fs().symlink(referent, &link).await?;
        tracing::info!(referent = %request.path(), link = %link_vpath, "symlink created");
        Ok(())
    }

    async fn remove(&self, request: &Request, path: &Path) -> DispatchResult<()> {
        let attr = self.fs().lstat(path).await?;
        if attr.is_dir() {
            return Err(DispatchError::failure(format!(
                "{} is a directory",
                request.path()
            )));
        }

        self.authorize(Permission::Delete, &request.parent_dir())?;
        self.check_allowed(request.path())?;

        self.fs().unlink(path).await?;
        if attr.is_file() {
            self.session
                .quota()
                .commit(request.path(), -1, -(attr.size as i64));
        }
        tracing::info!(path = %request.path(), size = attr.size, "file removed");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::TransferSettings;
    use crate::quota::{MemoryLedger, QuotaLedger, Usage};
    use crate::request::RequestAttrs;
    use crate::permissions::PermissionRules;
    use crate::user::UserProfile;
    use ferry_vfs::MemoryBackend;

    fn dispatcher(rules: PermissionRules) -> (RequestDispatcher, Arc<MemoryBackend>, Arc<MemoryLedger>) {
        let fs = Arc::new(MemoryBackend::new());
        let ledger = Arc::new(MemoryLedger::new());
        let user = UserProfile::new("amy").with_ids(1000, 1000).with_permissions(rules);
        let session = Session::new(
            Arc::new(user),
            fs.clone(),
            ledger.clone(),
            TransferSettings::default(),
        );
        (RequestDispatcher::new(Arc::new(session)), fs, ledger)
    }

    #[tokio::test]
    async fn test_non_commands_are_unsupported() {
        let (d, _, _) = dispatcher(PermissionRules::root([Permission::Any]));
        for op in [Operation::List, Operation::Stat, Operation::Read, Operation::Write] {
            let err = d.command(&Request::new(op, "/a")).await.unwrap_err();
            assert_eq!(err.status(), StatusCode::OpUnsupported);
        }
    }

    #[tokio::test]
    async fn test_list_rejects_commands() {
        let (d, _, _) = dispatcher(PermissionRules::root([Permission::Any]));
        let err = d
            .list(&Request::new(Operation::Remove, "/a"))
            .await
            .unwrap_err();
        assert!(matches!(err, DispatchError::Unsupported(_)));
    }

    #[tokio::test]
    async fn test_stat_returns_single_entry() {
        let (d, fs, _) = dispatcher(PermissionRules::root([Permission::ListItems]));
        fs.write_all(Path::new("/a.txt"), b"hello").await.unwrap();

        let mut lister = d.list(&Request::new(Operation::Stat, "/a.txt")).await.unwrap();
        assert_eq!(lister.len(), 1);
        let entry = lister.next().unwrap();
        assert_eq!(entry.name, "a.txt");
        assert_eq!(entry.attr.size, 5);
        assert!(lister.next().is_none());
    }

    #[tokio::test]
    async fn test_remove_releases_quota() {
        let (d, fs, ledger) = dispatcher(PermissionRules::root([Permission::Any]));
        fs.write_all(Path::new("/a.txt"), b"0123456789").await.unwrap();
        ledger.set_user_usage("amy", Usage::new(1, 10));

        let status = d.command(&Request::new(Operation::Remove, "/a.txt")).await.unwrap();
        assert_eq!(status, StatusCode::Ok);
        assert!(!fs.exists(Path::new("/a.txt")).await);
        assert_eq!(ledger.user_usage("amy").unwrap(), Usage::new(0, 0));
    }

    #[tokio::test]
    async fn test_remove_directory_fails_without_mutation() {
        let (d, fs, _) = dispatcher(PermissionRules::root([Permission::Any]));
        fs.mkdir(Path::new("/dir"), 0o755).await.unwrap();

        let err = d.command(&Request::new(Operation::Remove, "/dir")).await.unwrap_err();
        assert_eq!(err.status(), StatusCode::Failure);
        assert!(fs.lstat(Path::new("/dir")).await.unwrap().is_dir());
    }

    #[tokio::test]
    async fn test_rmdir_requires_directory() {
        let (d, fs, _) = dispatcher(PermissionRules::root([Permission::Any]));
        fs.write_all(Path::new("/a.txt"), b"x").await.unwrap();
        fs.mkdir(Path::new("/dir"), 0o755).await.unwrap();

        let err = d.command(&Request::new(Operation::Rmdir, "/a.txt")).await.unwrap_err();
        assert!(matches!(err, DispatchError::Failure(_)));

        d.command(&Request::new(Operation::Rmdir, "/dir")).await.unwrap();
        assert!(!fs.exists(Path::new("/dir")).await);
    }

    #[tokio::test]
    async fn test_mkdir_propagates_owner() {
        let (d, fs, _) = dispatcher(PermissionRules::root([Permission::CreateDirs]));
        d.command(&Request::new(Operation::Mkdir, "/dir")).await.unwrap();

        let attr = fs.lstat(Path::new("/dir")).await.unwrap();
        assert!(attr.is_dir());
        assert_eq!((attr.uid, attr.gid), (Some(1000), Some(1000)));
    }

    #[tokio::test]
    async fn test_symlink_requires_target() {
        let (d, fs, _) = dispatcher(PermissionRules::root([Permission::Any]));
        fs.write_all(Path::new("/a.txt"), b"x").await.unwrap();

        let err = d
            .command(&Request::new(Operation::Symlink, "/a.txt"))
            .await
            .unwrap_err();
        assert!(matches!(err, DispatchError::Failure(_)));

        fs.mkdir(Path::new("/links"), 0o755).await.unwrap();
        d.command(&Request::new(Operation::Symlink, "/a.txt").with_target("/links/a"))
            .await
            .unwrap();
        assert!(fs.lstat(Path::new("/links/a")).await.unwrap().is_symlink());
        assert_eq!(fs.read_all(Path::new("/links/a")).await.unwrap(), b"x");
    }

    #[tokio::test]
    async fn test_rename_requires_both_parents() {
        let rules = PermissionRules::root([Permission::Any])
            .with_dir("/locked", [Permission::ListItems]);
        let (d, fs, _) = dispatcher(rules);
        fs.write_all(Path::new("/a.txt"), b"x").await.unwrap();
        fs.mkdir(Path::new("/locked"), 0o755).await.unwrap();

        let err = d
            .command(&Request::new(Operation::Rename, "/a.txt").with_target("/locked/a.txt"))
            .await
            .unwrap_err();
        assert_eq!(err.status(), StatusCode::PermissionDenied);
        assert!(fs.exists(Path::new("/a.txt")).await);

        let err = d
            .command(&Request::new(Operation::Rename, "/a.txt"))
            .await
            .unwrap_err();
        assert!(matches!(err, DispatchError::Failure(_)));
    }

    #[tokio::test]
    async fn test_setstat_checks_each_group() {
        let (d, fs, _) = dispatcher(PermissionRules::root([Permission::Chmod]));
        fs.write_all(Path::new("/a.txt"), b"x").await.unwrap();

        let req = Request::new(Operation::Setstat, "/a.txt")
            .with_attrs(RequestAttrs::new().with_mode(0o600));
        d.command(&req).await.unwrap();
        assert_eq!(fs.stat(Path::new("/a.txt")).await.unwrap().perm, 0o600);

        let req = Request::new(Operation::Setstat, "/a.txt")
            .with_attrs(RequestAttrs::new().with_mode(0o644).with_owner(1, 1));
        let err = d.command(&req).await.unwrap_err();
        assert_eq!(err.status(), StatusCode::PermissionDenied);
        assert_eq!(fs.stat(Path::new("/a.txt")).await.unwrap().perm, 0o600);
    }
}
