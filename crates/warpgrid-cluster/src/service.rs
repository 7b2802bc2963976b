//! Service-thread execution context.
//!
//! Every membership mutation runs as a job on one dedicated OS thread,
//! which gives a total order over changes to the member list. Callers
//! submit a closure, then wait for its result with a bounded timeout so
//! a dead or wedged service thread surfaces as an error instead of a
//! hang.

use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread::JoinHandle;
use std::time::Duration;

use parking_lot::{Mutex, RwLock};
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, error, warn};

use crate::error::{ClusterError, ClusterResult};
use crate::listener::{self, MembershipListener};
use crate::member::Member;
use crate::registry::MembershipRegistry;

/// Default bound on waiting for a submitted job.
pub const DEFAULT_SERVICE_TIMEOUT: Duration = Duration::from_secs(5);

/// Maximum number of queued jobs.
pub const QUEUE_CAPACITY: usize = 1000;

type Job = Box<dyn FnOnce(&mut dyn MembershipRegistry) + Send>;

/// Single ordered consumer for membership mutations.
pub struct ServiceContext {
    registry: Arc<Mutex<Box<dyn MembershipRegistry>>>,
    /// Snapshot of the member list after the most recent job.
    view: Arc<RwLock<Arc<Vec<Member>>>>,
    listeners: Arc<RwLock<Vec<Arc<dyn MembershipListener>>>>,
    sender: Mutex<Option<mpsc::Sender<Job>>>,
    /// Discard flag of the current run; set on stop so queued jobs are dropped.
    discard: Mutex<Arc<AtomicBool>>,
    thread: Mutex<Option<JoinHandle<()>>>,
    timeout: Duration,
}

impl ServiceContext {
    pub fn new(registry: Box<dyn MembershipRegistry>) -> Self {
        let view = Arc::new(registry.current_members());
        Self {
            registry: Arc::new(Mutex::new(registry)),
            view: Arc::new(RwLock::new(view)),
            listeners: Arc::new(RwLock::new(Vec::new())),
            sender: Mutex::new(None),
            discard: Mutex::new(Arc::new(AtomicBool::new(false))),
            thread: Mutex::new(None),
            timeout: DEFAULT_SERVICE_TIMEOUT,
        }
    }

    /// Set the bound on waiting for a submitted job.
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    /// Spawn the service thread. A no-op if it is already running.
    ///
    /// `priority` follows the 1..=10 scale (5 is normal) and is applied
    /// as a nice value where the platform allows it.
    pub fn start(&self, thread_name: &str, priority: i32) -> ClusterResult<()> {
        let mut sender = self.sender.lock();
        if sender.is_some() {
            return Ok(());
        }

        let (tx, mut rx) = mpsc::channel::<Job>(QUEUE_CAPACITY);
        let discard = Arc::new(AtomicBool::new(false));
        *self.discard.lock() = Arc::clone(&discard);

        let registry = Arc::clone(&self.registry);
        let name = thread_name.to_string();

        let handle = std::thread::Builder::new()
            .name(name.clone())
            .spawn(move || {
                apply_priority(priority);
                debug!(thread = %name, "service thread started");

                let mut discarded = 0usize;
                while let Some(job) = rx.blocking_recv() {
                    if discard.load(Ordering::SeqCst) {
                        discarded += 1;
                        continue;
                    }

                    let mut guard = registry.lock();
                    let outcome =
                        std::panic::catch_unwind(AssertUnwindSafe(|| job(&mut **guard)));
                    drop(guard);

                    if outcome.is_err() {
                        error!(thread = %name, "membership job panicked");
                    }
                }

                debug!(thread = %name, discarded, "service thread stopped");
            })?;

        *sender = Some(tx);
        *self.thread.lock() = Some(handle);
        Ok(())
    }

    /// Stop accepting jobs and drop whatever is still queued.
    ///
    /// The thread exits once the queue is empty; it is not joined, so a
    /// job stuck on the thread cannot block shutdown.
    pub fn stop(&self) {
        self.discard.lock().store(true, Ordering::SeqCst);
        if self.sender.lock().take().is_some() {
            debug!("service context stopped");
        }
        self.thread.lock().take();
    }

    pub fn is_running(&self) -> bool {
        let thread_alive = self
            .thread
            .lock()
            .as_ref()
            .is_some_and(|handle| !handle.is_finished());
        self.sender.lock().is_some() && thread_alive
    }

    /// Register a listener for member additions and removals made by
    /// later jobs.
    pub fn add_listener(&self, listener: Arc<dyn MembershipListener>) {
        self.listeners.write().push(listener);
    }

    /// Members as of the last completed job.
    pub fn members(&self) -> Arc<Vec<Member>> {
        Arc::clone(&self.view.read())
    }

    /// Run `op` on the service thread and wait for its result.
    pub async fn submit<T, F>(&self, op: &'static str, f: F) -> ClusterResult<T>
    where
        F: FnOnce(&mut dyn MembershipRegistry) -> T + Send + 'static,
        T: Send + 'static,
    {
        let sender = self.sender.lock().clone().ok_or(ClusterError::ServiceStopped)?;

        let (tx, rx) = oneshot::channel();
        let view = Arc::clone(&self.view);
        let listeners = Arc::clone(&self.listeners);
        let job: Job = Box::new(move |registry: &mut dyn MembershipRegistry| {
            let before = registry.current_members();
            let out = f(registry);
            let after = Arc::new(registry.current_members());
            *view.write() = Arc::clone(&after);
            listener::notify(&listeners.read(), &before, &after);
            let _ = tx.send(out);
        });

        let exchange = async move {
            sender.send(job).await.map_err(|_| ClusterError::ServiceStopped)?;
            rx.await.map_err(|_| ClusterError::ServiceStopped)
        };

        match tokio::time::timeout(self.timeout, exchange).await {
            Ok(result) => result,
            Err(_) => {
                error!(op, timeout = ?self.timeout, "service thread unresponsive");
                Err(ClusterError::ServiceThreadUnresponsive {
                    op,
                    timeout: self.timeout,
                })
            }
        }
    }
}

impl Drop for ServiceContext {
    fn drop(&mut self) {
        self.stop();
    }
}

#[cfg(target_os = "linux")]
fn apply_priority(priority: i32) {
    // 1..=10 onto nice 8..=-10; 5 leaves the thread alone.
    let nice = (5 - priority.clamp(1, 10)) * 2;
    if nice == 0 {
        return;
    }
    // With `who == 0` Linux applies the nice value to the calling thread.
    // SAFETY: setpriority takes only integer arguments and touches no memory we own.
    let rc = unsafe { libc::setpriority(libc::PRIO_PROCESS, 0, nice) };
    if rc != 0 {
        warn!(
            priority,
            nice,
            error = %std::io::Error::last_os_error(),
            "could not apply service thread priority"
        );
    }
}

#[cfg(not(target_os = "linux"))]
fn apply_priority(priority: i32) {
    if priority != 5 {
        debug!(priority, "service thread priority is not supported on this platform");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::address::Address;
    use crate::member::NodeRole;
    use crate::registry::MemberList;

    fn addr(s: &str) -> Address {
        s.parse().unwrap()
    }

    fn context() -> ServiceContext {
        ServiceContext::new(Box::new(MemberList::new(addr("127.0.0.1:5701"))))
    }

    #[tokio::test]
    async fn jobs_run_on_the_named_thread() {
        let ctx = context();
        ctx.start("warpgrid.test.service", 5).unwrap();

        let name = ctx
            .submit("thread name", |_| {
                std::thread::current().name().map(str::to_string)
            })
            .await
            .unwrap();
        assert_eq!(name.as_deref(), Some("warpgrid.test.service"));
        ctx.stop();
    }

    #[tokio::test]
    async fn mutations_apply_in_submission_order() {
        let ctx = context();
        ctx.start("warpgrid.test.order", 5).unwrap();

        for i in 0..20u16 {
            let a = addr(&format!("127.0.0.1:{}", 6000 + i));
            ctx.submit("add", move |reg| reg.add_member(a, NodeRole::Full, "u"))
                .await
                .unwrap();
        }

        let ports: Vec<u16> = ctx.members().iter().map(|m| m.address.port()).collect();
        assert_eq!(ports, (6000..6020).collect::<Vec<_>>());
        ctx.stop();
    }

    #[tokio::test]
    async fn view_is_updated_before_result_returns() {
        let ctx = context();
        ctx.start("warpgrid.test.view", 5).unwrap();

        let a = addr("127.0.0.1:5701");
        ctx.submit("add self", move |reg| reg.add_member(a, NodeRole::Full, "me"))
            .await
            .unwrap();
        assert_eq!(ctx.members().len(), 1);
        ctx.stop();
    }

    #[tokio::test]
    async fn wedged_thread_times_out() {
        let ctx = context().with_timeout(Duration::from_millis(50));
        ctx.start("warpgrid.test.wedged", 5).unwrap();

        // Occupy the thread well past the timeout.
        let blocker = ctx.submit("block", |_| std::thread::sleep(Duration::from_millis(400)));
        let err = blocker.await.unwrap_err();
        assert!(matches!(err, ClusterError::ServiceThreadUnresponsive { op: "block", .. }));

        let err = ctx.submit("noop", |_| ()).await.unwrap_err();
        assert!(matches!(err, ClusterError::ServiceThreadUnresponsive { .. }));
        ctx.stop();
    }

    #[tokio::test]
    async fn submit_after_stop_fails() {
        let ctx = context();
        ctx.start("warpgrid.test.stop", 5).unwrap();
        ctx.stop();

        let err = ctx.submit("noop", |_| ()).await.unwrap_err();
        assert!(matches!(err, ClusterError::ServiceStopped));
        assert!(!ctx.is_running());
    }

    #[tokio::test]
    async fn restart_keeps_registry() {
        let ctx = context();
        ctx.start("warpgrid.test.restart", 5).unwrap();
        let a = addr("127.0.0.1:5702");
        ctx.submit("add", move |reg| reg.add_member(a, NodeRole::Full, "u"))
            .await
            .unwrap();
        ctx.stop();

        ctx.start("warpgrid.test.restart", 5).unwrap();
        let count = ctx
            .submit("count", |reg| reg.current_members().len())
            .await
            .unwrap();
        assert_eq!(count, 1);
        ctx.stop();
    }

    #[derive(Default)]
    struct Seen {
        added: Mutex<Vec<Address>>,
        removed: Mutex<Vec<Address>>,
    }

    impl MembershipListener for Seen {
        fn member_added(&self, member: &Member) {
            self.added.lock().push(member.address);
        }

        fn member_removed(&self, member: &Member) {
            self.removed.lock().push(member.address);
        }
    }

    #[tokio::test]
    async fn listeners_see_changes_before_submit_returns() {
        let ctx = context();
        let seen = Arc::new(Seen::default());
        ctx.add_listener(seen.clone());
        ctx.start("warpgrid.test.listen", 5).unwrap();

        let (me, peer) = (addr("127.0.0.1:5701"), addr("127.0.0.1:5702"));
        ctx.submit("add self", move |reg| reg.add_member(me, NodeRole::Full, "me"))
            .await
            .unwrap();
        ctx.submit("add peer", move |reg| reg.add_member(peer, NodeRole::Full, "p"))
            .await
            .unwrap();
        assert_eq!(*seen.added.lock(), vec![me, peer]);

        ctx.submit("reset", |reg| reg.reset()).await.unwrap();
        assert_eq!(*seen.removed.lock(), vec![peer]);

        ctx.submit("read", |reg| reg.current_members().len()).await.unwrap();
        assert_eq!(seen.added.lock().len(), 2, "reads report nothing");
        ctx.stop();
    }

    #[tokio::test]
    async fn panicking_job_does_not_kill_the_thread() {
        let ctx = context();
        ctx.start("warpgrid.test.panic", 5).unwrap();

        let err = ctx
            .submit("boom", |_| -> () { panic!("boom") })
            .await
            .unwrap_err();
        assert!(matches!(err, ClusterError::ServiceStopped));

        let ok = ctx.submit("after", |_| 7).await.unwrap();
        assert_eq!(ok, 7);
        ctx.stop();
    }
}
