//! Authenticated sessions.
//!
//! A session lives as long as its connection. It binds a user profile to a
//! backend and a ledger, and tracks its in-flight transfers so a disconnect
//! can finalize them.

use async_trait::async_trait;
use ferry_vfs::VfsOps;
use parking_lot::Mutex;
use std::io;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::{Duration, Instant};
use uuid::Uuid;

use crate::config::TransferSettings;
use crate::planner::AtomicUploadPlanner;
use crate::quota::{QuotaEnforcer, QuotaLedger};
use crate::transfer::{TransferFactory, TransferRegistry};
use crate::user::UserProfile;

/// The network side of a session.
#[async_trait]
pub trait NetConn: Send + Sync {
    /// Arm a deadline after which the connection is torn down.
    fn set_deadline(&self, deadline: Instant) -> io::Result<()>;

    /// Close the protocol channel, if the transport has one.
    async fn close_channel(&self) -> io::Result<()> {
        Ok(())
    }

    /// Close the connection.
    async fn close(&self) -> io::Result<()>;
}

/// One authenticated connection.
pub struct Session {
    id: Uuid,
    user: Arc<UserProfile>,
    fs: Arc<dyn VfsOps>,
    ledger: Arc<dyn QuotaLedger>,
    settings: TransferSettings,
    remote_addr: Option<SocketAddr>,
    client_version: String,
    command: Option<String>,
    last_activity: Mutex<Instant>,
    transfers: Arc<TransferRegistry>,
    conn: Option<Arc<dyn NetConn>>,
}

impl std::fmt::Debug for Session {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Session")
            .field("id", &self.id)
            .field("user", &self.user.username())
            .field("fs", &self.fs.name())
            .field("remote_addr", &self.remote_addr)
            .field("client_version", &self.client_version)
            .field("transfers", &self.transfers.len())
            .finish()
    }
}

impl Session {
    pub fn new(
        user: Arc<UserProfile>,
        fs: Arc<dyn VfsOps>,
        ledger: Arc<dyn QuotaLedger>,
        settings: TransferSettings,
    ) -> Self {
        Self {
            id: Uuid::new_v4(),
            user,
            fs,
            ledger,
            settings,
            remote_addr: None,
            client_version: String::new(),
            command: None,
            last_activity: Mutex::new(Instant::now()),
            transfers: Arc::new(TransferRegistry::new()),
            conn: None,
        }
    }

    pub fn with_remote_addr(mut self, addr: SocketAddr) -> Self {
        self.remote_addr = Some(addr);
        self
    }

    pub fn with_client_version(mut self, version: impl Into<String>) -> Self {
        self.client_version = version.into();
        self
    }

    pub fn with_command(mut self, command: impl Into<String>) -> Self {
        self.command = Some(command.into());
        self
    }

    pub fn with_conn(mut self, conn: Arc<dyn NetConn>) -> Self {
        self.conn = Some(conn);
        self
    }

    pub fn id(&self) -> Uuid {
        self.id
    }

    pub fn user(&self) -> &Arc<UserProfile> {
        &self.user
    }

    pub fn fs(&self) -> &Arc<dyn VfsOps> {
        &self.fs
    }

    pub fn settings(&self) -> &TransferSettings {
        &self.settings
    }

    pub fn remote_addr(&self) -> Option<SocketAddr> {
        self.remote_addr
    }

    pub fn client_version(&self) -> &str {
        &self.client_version
    }

    pub fn command(&self) -> Option<&str> {
        self.command.as_deref()
    }

    pub fn transfers(&self) -> &Arc<TransferRegistry> {
        &self.transfers
    }

    // ========================================================================
    // Activity
    // ========================================================================

    /// Mark the session active now.
    pub fn update_last_activity(&self) {
        *self.last_activity.lock() = Instant::now();
    }

    pub fn last_activity(&self) -> Instant {
        *self.last_activity.lock()
    }

    /// Time since the last dispatched request.
    pub fn idle_time(&self) -> Duration {
        self.last_activity().elapsed()
    }

    // ========================================================================
    // Components bound to this session
    // ========================================================================

    /// Quota checks for this session's user.
    pub fn quota(&self) -> QuotaEnforcer {
        QuotaEnforcer::new(
            Arc::clone(&self.user),
            Arc::clone(&self.ledger),
            self.settings.quota_tracking,
        )
    }

    /// Upload planner for this session's backend.
    pub fn planner(&self) -> AtomicUploadPlanner<'_> {
        AtomicUploadPlanner::new(self.fs.as_ref(), self.settings.upload_mode)
    }

    /// Transfer factory registering into this session.
    pub fn transfer_factory(&self) -> TransferFactory {
        TransferFactory::new(
            Arc::clone(&self.fs),
            Arc::clone(&self.transfers),
            self.settings.upload_mode,
        )
    }

    // ========================================================================
    // Connection lifecycle
    // ========================================================================

    /// Arm the disconnect grace period on the network connection.
    pub fn set_conn_deadline(&self) -> io::Result<()> {
        match &self.conn {
            Some(conn) => conn.set_deadline(Instant::now() + self.settings.disconnect_grace()),
            None => Ok(()),
        }
    }

    /// Abort in-flight transfers, then close the channel and connection.
    #[tracing::instrument(skip(self), fields(session = %self.id, user = %self.user.username()), name = "ferry.disconnect")]
    pub async fn disconnect(&self) -> io::Result<()> {
        let transfers = self.transfers.snapshot();
        let results = futures::future::join_all(
            transfers.iter().map(|t| t.abort("connection closed")),
        )
        .await;
        for (transfer, result) in transfers.iter().zip(results) {
            if let Err(e) = result {
                tracing::debug!(transfer = %transfer.id(), error = %e, "transfer aborted on disconnect");
            }
        }

        if let Some(conn) = &self.conn {
            let channel = conn.close_channel().await;
            tracing::info!(error = ?channel.err(), "channel close");
            conn.close().await?;
        }
        Ok(())
    }
}
