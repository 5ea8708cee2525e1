//! Write requests: new files, overwrites and resumes.

use ferry_vfs::FileAttr;
use std::path::PathBuf;

use super::RequestDispatcher;
use crate::error::{DispatchError, DispatchResult};
use crate::permissions::Permission;
use crate::request::Request;
use crate::transfer::Transfer;

impl RequestDispatcher {
    /// Open an upload.
    ///
    /// A missing path or a symlink creates a new file and needs upload
    /// permission. An existing regular file is overwritten or resumed and
    /// needs overwrite permission. Directories cannot be written.
    #[tracing::instrument(skip(self, request), fields(session = %self.session.id(), path = %request.path()), name = "ferry.write")]
    pub async fn write(&self, request: &Request) -> DispatchResult<Transfer> {
        self.session.update_last_activity();

        self.check_allowed(request.path())?;

        let path = self.fs().resolve_path(request.path()).await?;
        match self.fs().lstat(&path).await {
            Ok(attr) if attr.is_symlink() => self.upload_new_file(request, path).await,
            Err(e) if e.is_not_found() => self.upload_new_file(request, path).await,
            Err(e) => {
                tracing::warn!(path = %path.display(), error = %e, "error running stat on upload target");
                Err(e.into())
            }
            Ok(attr) if attr.is_dir() => {
                tracing::debug!(path = %request.path(), "attempted to open a directory for writing");
                Err(DispatchError::unsupported(format!(
                    "{} is a directory",
                    request.path()
                )))
            }
            Ok(attr) => self.upload_existing_file(request, path, attr).await,
        }
    }

    async fn upload_new_file(&self, request: &Request, path: PathBuf) -> DispatchResult<Transfer> {
        self.authorize(Permission::Upload, &request.parent_dir())?;

        let quota = self.session.quota();
        let check = quota.has_space(true, request.path());
        if !check.has_space {
            tracing::info!(
                user = %self.session.user().username(),
                path = %request.path(),
                "denying file write due to quota limits"
            );
            return Err(DispatchError::quota_exceeded(request.path()));
        }

        let planner = self.session.planner();
        let plan = planner.plan_new_file(path, &check)?;
        let file = planner.open(&plan).await.inspect_err(|e| {
            tracing::warn!(path = %plan.write_path().display(), error = %e, "error creating file");
        })?;
        self.set_owner_logged(plan.write_path()).await;

        Ok(self
            .session
            .transfer_factory()
            .upload(file, request.path(), &plan, quota))
    }

    async fn upload_existing_file(
        &self,
        request: &Request,
        path: PathBuf,
        attr: FileAttr,
    ) -> DispatchResult<Transfer> {
        self.authorize(Permission::Overwrite, &request.parent_dir())?;

        let quota = self.session.quota();
        let check = quota.has_space(false, request.path());
        if !check.has_space {
            tracing::info!(
                user = %self.session.user().username(),
                path = %request.path(),
                "denying file write due to quota limits"
            );
            return Err(DispatchError::quota_exceeded(request.path()));
        }

        let planner = self.session.planner();
        let plan = planner
            .plan_existing(path, request.flags(), attr.size, &check)
            .inspect_err(|e| {
                tracing::warn!(path = %request.path(), error = %e, "unable to compute resume budget");
            })?;
        let file = planner.open(&plan).await?;

        if plan.reclaim() > 0 {
            quota.reclaim(request.path(), plan.reclaim());
        }
        self.set_owner_logged(plan.write_path()).await;

        tracing::debug!(
            path = %request.path(),
            resume = plan.is_resume(),
            staged = plan.is_staged(),
            min_offset = plan.min_write_offset(),
            limit = plan.write_limit().as_raw(),
            "overwriting existing file"
        );
        Ok(self
            .session
            .transfer_factory()
            .upload(file, request.path(), &plan, quota))
    }
}
