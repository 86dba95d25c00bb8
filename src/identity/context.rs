use std::marker::PhantomData;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use tracing::debug;

use crate::config::StorageConfig;
use crate::correlation::CorrelationId;
use crate::error::{FsError, FsResult};

use super::mapper::{IdentityMapper, LocalIdentity};

/// Opens execution contexts for usernames and tracks how many are still open.
#[derive(Clone)]
pub struct ContextFactory {
    mapper: Arc<dyn IdentityMapper>,
    config: Arc<StorageConfig>,
    open: Arc<AtomicUsize>,
}

impl ContextFactory {
    pub fn new(mapper: Arc<dyn IdentityMapper>, config: Arc<StorageConfig>) -> Self {
        Self { mapper, config, open: Arc::new(AtomicUsize::new(0)) }
    }

    pub fn mapper(&self) -> &Arc<dyn IdentityMapper> { &self.mapper }

    pub fn config(&self) -> &Arc<StorageConfig> { &self.config }

    /// Open a context for `username`. Unmapped users fail with `NoIdentityMapping`.
    pub fn open(&self, username: &str) -> FsResult<ExecutionContext> {
        self.open_with_correlation(username, None)
    }

    pub fn open_with_correlation(&self, username: &str, correlation: Option<&str>) -> FsResult<ExecutionContext> {
        let is_service = username == self.config.service_user;
        let identity = if is_service {
            self.mapper.lookup(username).unwrap_or_else(LocalIdentity::current_process)
        } else {
            self.mapper
                .lookup(username)
                .ok_or_else(|| FsError::NoIdentityMapping(username.to_string()))?
        };

        let fs_switch = if self.config.switch_identity && !is_service {
            Some(FsIdentitySwitch::enter(&identity)?)
        } else {
            None
        };

        let correlation = CorrelationId::from_upstream(correlation);
        let open_now = self.open.fetch_add(1, Ordering::SeqCst) + 1;
        debug!(target: "storage::context", "open user={} uid={} open={} [corr={}]", username, identity.uid, open_now, correlation);

        Ok(ExecutionContext {
            user: username.to_string(),
            identity,
            is_service,
            home_prefix: self.config.home_prefix.clone(),
            correlation,
            open: self.open.clone(),
            fs_switch,
            closed: false,
            _single_thread: PhantomData,
        })
    }

    pub fn open_service(&self) -> FsResult<ExecutionContext> {
        self.open(&self.config.service_user.clone())
    }

    /// Run `f` within a freshly opened context; the context is closed on every exit path.
    pub fn with_context<R>(&self, username: &str, f: impl FnOnce(&ExecutionContext) -> FsResult<R>) -> FsResult<R> {
        let ctx = self.open(username)?;
        let res = f(&ctx);
        ctx.close();
        res
    }

    /// Number of contexts opened and not yet closed.
    pub fn open_sessions(&self) -> usize { self.open.load(Ordering::SeqCst) }
}

/// Per-identity session handle. Bound to the thread that opened it, so it is neither
/// `Send` nor `Sync`. Closing happens explicitly through `close()` or on drop.
pub struct ExecutionContext {
    user: String,
    identity: LocalIdentity,
    is_service: bool,
    home_prefix: String,
    correlation: CorrelationId,
    open: Arc<AtomicUsize>,
    fs_switch: Option<FsIdentitySwitch>,
    closed: bool,
    _single_thread: PhantomData<*const ()>,
}

impl ExecutionContext {
    pub fn user(&self) -> &str { &self.user }

    pub fn identity(&self) -> &LocalIdentity { &self.identity }

    pub fn is_service(&self) -> bool { self.is_service }

    pub fn correlation(&self) -> &CorrelationId { &self.correlation }

    /// Logical home directory of the context's user.
    pub fn home_directory(&self) -> String {
        format!("/{}/{}", self.home_prefix, self.user)
    }

    pub fn close(mut self) {
        self.release();
    }

    fn release(&mut self) {
        if self.closed {
            return;
        }
        self.closed = true;
        if let Some(switch) = self.fs_switch.take() {
            switch.leave();
        }
        let left = self.open.fetch_sub(1, Ordering::SeqCst).saturating_sub(1);
        debug!(target: "storage::context", "close user={} open={} [corr={}]", self.user, left, self.correlation);
    }
}

impl Drop for ExecutionContext {
    fn drop(&mut self) {
        self.release();
    }
}

impl std::fmt::Debug for ExecutionContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ExecutionContext")
            .field("user", &self.user)
            .field("uid", &self.identity.uid)
            .field("corr", &self.correlation.as_str())
            .finish()
    }
}

/// Thread-local filesystem identity switch (`setfsuid`/`setfsgid`).
struct FsIdentitySwitch {
    prev_uid: u32,
    prev_gid: u32,
}

impl FsIdentitySwitch {
    #[cfg(target_os = "linux")]
    fn enter(identity: &LocalIdentity) -> FsResult<Self> {
        // Group first: dropping the fsuid may remove the privilege to change the fsgid.
        // SAFETY: setfsuid/setfsgid only affect the calling thread's credentials.
        let (prev_gid, prev_uid) = unsafe {
            let g = libc::setfsgid(identity.gid) as u32;
            let u = libc::setfsuid(identity.uid) as u32;
            (g, u)
        };
        // Passing an invalid id returns the current value without changing it.
        let current = unsafe { libc::setfsuid(u32::MAX) } as u32;
        if current != identity.uid {
            unsafe {
                libc::setfsuid(prev_uid);
                libc::setfsgid(prev_gid);
            }
            return Err(FsError::critical(format!("unable to switch filesystem identity to uid {}", identity.uid)));
        }
        Ok(Self { prev_uid, prev_gid })
    }

    #[cfg(not(target_os = "linux"))]
    fn enter(_identity: &LocalIdentity) -> FsResult<Self> {
        Err(FsError::critical("identity switching is only supported on linux"))
    }

    fn leave(self) {
        #[cfg(target_os = "linux")]
        unsafe {
            libc::setfsuid(self.prev_uid);
            libc::setfsgid(self.prev_gid);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::identity::StaticIdentityMapper;

    fn factory() -> ContextFactory {
        let mapper = StaticIdentityMapper::new();
        mapper.add_user("alice", 1001, 1001);
        ContextFactory::new(Arc::new(mapper), Arc::new(StorageConfig::with_root("/tmp/unused")))
    }

    #[test]
    fn open_and_close_tracks_sessions() {
        let f = factory();
        let ctx = f.open("alice").unwrap();
        assert_eq!(ctx.identity().uid, 1001);
        assert_eq!(ctx.home_directory(), "/home/alice");
        assert_eq!(f.open_sessions(), 1);
        ctx.close();
        assert_eq!(f.open_sessions(), 0);
    }

    #[test]
    fn drop_closes_context() {
        let f = factory();
        {
            let _ctx = f.open("alice").unwrap();
            assert_eq!(f.open_sessions(), 1);
        }
        assert_eq!(f.open_sessions(), 0);
    }

    #[test]
    fn unmapped_user_is_a_domain_error() {
        let f = factory();
        let err = f.open("mallory").unwrap_err();
        assert_eq!(err, FsError::NoIdentityMapping("mallory".into()));
        assert_eq!(f.open_sessions(), 0);
    }

    #[test]
    fn with_context_closes_on_error() {
        let f = factory();
        let res: FsResult<()> = f.with_context("alice", |_| Err(FsError::critical("boom")));
        assert!(res.is_err());
        assert_eq!(f.open_sessions(), 0);
    }

    #[test]
    fn service_user_falls_back_to_process_identity() {
        let f = factory();
        let ctx = f.open_service().unwrap();
        assert!(ctx.is_service());
        assert_eq!(ctx.identity().uid, LocalIdentity::current_process().uid);
    }
}
