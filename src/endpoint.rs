//! The capability surface a transport exposes per connection to the protocol layer, and the
//!  reference counting protocol that keeps it alive while protocol code calls into it.
//!
//! ## Lifetime
//!
//! An endpoint is `Active` until `close()` is called (either by protocol code or by the transport
//!  itself when the peer goes away). It is then `ClosingPendingRefs` until the last outstanding
//!  reference is released, and only then `Destroyed`. A transport must never tear down the
//!  connection's resources at the time `close()` is called, it does so when [EndpointLifetime]
//!  tells it to, and that happens exactly once.
//!
//! ```ascii
//!  Active --close()--> ClosingPendingRefs --last release()--> Destroyed
//!    \                                                          ^
//!     `--close() with no references outstanding----------------'
//! ```
//!
//! Protocol code never sees the endpoint itself, only an [EndpointRef]. The only way to call into
//!  the transport is through an [EndpointGuard], which holds a reference for as long as it
//!  exists. So an unreferenced call can not be expressed.

use std::fmt::{Debug, Formatter};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
#[cfg(test)] use mockall::automock;
use tracing::{trace, warn};

use crate::scheduler::SchedulerHandle;

/// Implemented by transports, one instance per connection.
///
/// All operations report failure as `false`: the operation did not take effect, the connection's
///  state is unspecified, but the endpoint stays valid while the caller holds a reference.
#[cfg_attr(test, automock)]
pub trait ServiceEndpoint: Send + Sync + 'static {
    /// Queues bytes for sending. This never blocks, it returns `false` if the connection is not
    ///  sendable or its send queue is full.
    fn send(&self, buf: &[u8]) -> bool;

    /// Requests termination of the connection. Only the first call returns `true`.
    fn close(&self) -> bool;

    /// Runs one step of the owning scheduler in the calling context.
    fn run_pending_io(&self) -> bool;

    /// Schedules a call to the protocol handler's `on_callback` on the scheduler.
    fn request_callback(&self) -> bool;

    fn scheduler(&self) -> SchedulerHandle;

    fn add_ref(&self) -> bool;

    fn release(&self) -> bool;
}


#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum EndpointState {
    Active,
    ClosingPendingRefs,
    Destroyed,
}

#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum CloseOutcome {
    AlreadyClosed,
    /// close was requested, there are references outstanding
    Closing,
    /// close was requested with no references outstanding: the caller must destroy the endpoint
    Destroy,
}

#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum ReleaseOutcome {
    /// there was no reference to release
    Unbalanced,
    Alive,
    /// this was the last reference of a closed endpoint: the caller must destroy the endpoint
    Destroy,
}

/// The atomic state behind an endpoint's lifetime: the reference count and both flags live in a
///  single word, so every transition is a single compare-and-swap.
pub struct EndpointLifetime {
    state: AtomicU64,
}

impl EndpointLifetime {
    const CLOSED: u64 = 1 << 63;
    const DESTROYED: u64 = 1 << 62;
    const COUNT_MASK: u64 = Self::DESTROYED - 1;

    pub fn new() -> EndpointLifetime {
        EndpointLifetime {
            state: AtomicU64::new(0),
        }
    }

    pub fn state(&self) -> EndpointState {
        Self::decode(self.state.load(Ordering::Acquire))
    }

    pub fn is_active(&self) -> bool {
        self.state() == EndpointState::Active
    }

    pub fn ref_count(&self) -> u64 {
        self.state.load(Ordering::Acquire) & Self::COUNT_MASK
    }

    fn decode(raw: u64) -> EndpointState {
        if raw & Self::DESTROYED != 0 {
            EndpointState::Destroyed
        }
        else if raw & Self::CLOSED != 0 {
            EndpointState::ClosingPendingRefs
        }
        else {
            EndpointState::Active
        }
    }

    /// Returns `false` if the endpoint is destroyed or the reference count is exhausted. Taking
    ///  a reference on a closing endpoint succeeds, calls through it fail fast.
    pub fn add_ref(&self) -> bool {
        let mut overflow = false;
        let result = self.state.fetch_update(Ordering::AcqRel, Ordering::Acquire, |raw| {
            if raw & Self::DESTROYED != 0 {
                return None;
            }
            if raw & Self::COUNT_MASK == Self::COUNT_MASK {
                overflow = true;
                return None;
            }
            Some(raw + 1)
        });

        if overflow {
            warn!("endpoint reference count overflow");
        }
        result.is_ok()
    }

    pub fn release(&self) -> ReleaseOutcome {
        let result = self.state.fetch_update(Ordering::AcqRel, Ordering::Acquire, |raw| {
            let count = raw & Self::COUNT_MASK;
            if count == 0 {
                return None;
            }
            if count == 1 && raw & Self::CLOSED != 0 {
                Some((raw - 1) | Self::DESTROYED)
            }
            else {
                Some(raw - 1)
            }
        });

        match result {
            Err(_) => ReleaseOutcome::Unbalanced,
            Ok(prev) if prev & Self::CLOSED != 0 && prev & Self::COUNT_MASK == 1 => ReleaseOutcome::Destroy,
            Ok(_) => ReleaseOutcome::Alive,
        }
    }

    pub fn close(&self) -> CloseOutcome {
        let result = self.state.fetch_update(Ordering::AcqRel, Ordering::Acquire, |raw| {
            if raw & Self::CLOSED != 0 {
                return None;
            }
            if raw & Self::COUNT_MASK == 0 {
                Some(raw | Self::CLOSED | Self::DESTROYED)
            }
            else {
                Some(raw | Self::CLOSED)
            }
        });

        match result {
            Err(_) => CloseOutcome::AlreadyClosed,
            Ok(prev) if prev & Self::COUNT_MASK == 0 => CloseOutcome::Destroy,
            Ok(_) => CloseOutcome::Closing,
        }
    }
}

impl Default for EndpointLifetime {
    fn default() -> Self {
        EndpointLifetime::new()
    }
}

impl Debug for EndpointLifetime {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "{:?}(refs: {})", self.state(), self.ref_count())
    }
}


/// The handle protocol code holds on to. It can not be used to call into the endpoint directly,
///  calls go through [EndpointGuard]s obtained from it.
#[derive(Clone)]
pub struct EndpointRef {
    endpoint: Arc<dyn ServiceEndpoint>,
}

impl Debug for EndpointRef {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "EndpointRef")
    }
}

impl EndpointRef {
    pub fn new(endpoint: Arc<dyn ServiceEndpoint>) -> EndpointRef {
        EndpointRef { endpoint }
    }

    /// Takes a reference, returning `None` if the endpoint is already destroyed.
    pub fn acquire(&self) -> Option<EndpointGuard> {
        if self.endpoint.add_ref() {
            Some(EndpointGuard {
                endpoint: self.endpoint.clone(),
            })
        }
        else {
            trace!("endpoint is destroyed, no reference acquired");
            None
        }
    }

    /// Runs `f` with a reference held, releasing it afterwards regardless of how `f` exits.
    pub fn with<R>(&self, f: impl FnOnce(&EndpointGuard) -> R) -> Option<R> {
        let guard = self.acquire()?;
        Some(f(&guard))
    }

    /// Convenience for fire-and-forget sending: `false` if the endpoint is gone or the send
    ///  failed.
    pub fn send(&self, buf: &[u8]) -> bool {
        self.with(|ep| ep.send(buf))
            .unwrap_or(false)
    }

    pub fn close(&self) -> bool {
        self.with(|ep| ep.close())
            .unwrap_or(false)
    }
}

/// A held reference to an endpoint. Dropping the guard releases the reference, so it is released
///  on every exit path including unwinding.
pub struct EndpointGuard {
    endpoint: Arc<dyn ServiceEndpoint>,
}

impl Debug for EndpointGuard {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "EndpointGuard")
    }
}

impl EndpointGuard {
    pub fn send(&self, buf: &[u8]) -> bool {
        self.endpoint.send(buf)
    }

    pub fn close(&self) -> bool {
        self.endpoint.close()
    }

    pub fn run_pending_io(&self) -> bool {
        self.endpoint.run_pending_io()
    }

    pub fn request_callback(&self) -> bool {
        self.endpoint.request_callback()
    }

    pub fn scheduler(&self) -> SchedulerHandle {
        self.endpoint.scheduler()
    }

    pub fn endpoint_ref(&self) -> EndpointRef {
        EndpointRef {
            endpoint: self.endpoint.clone(),
        }
    }
}

impl Clone for EndpointGuard {
    fn clone(&self) -> Self {
        // a held guard keeps the endpoint from being destroyed, so this can not fail
        let added = self.endpoint.add_ref();
        debug_assert!(added, "adding a reference failed while holding one");

        EndpointGuard {
            endpoint: self.endpoint.clone(),
        }
    }
}

impl Drop for EndpointGuard {
    fn drop(&mut self) {
        if !self.endpoint.release() {
            warn!("releasing an endpoint reference failed");
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicBool, AtomicUsize};
    use std::sync::{Barrier, Mutex};
    use std::thread;
    use mockall::Sequence;
    use rstest::rstest;
    use crate::scheduler::{IoScheduler, SchedulerHandle};
    use super::*;

    /// minimal endpoint on top of [EndpointLifetime], counting destructions
    struct CountingEndpoint {
        lifetime: EndpointLifetime,
        num_destroyed: AtomicUsize,
        /// number of references at the time of destruction, must be 0
        refs_at_destruction: AtomicU64,
        num_sent: AtomicUsize,
        scheduler: SchedulerHandle,
    }
    impl CountingEndpoint {
        fn new() -> Arc<CountingEndpoint> {
            Arc::new(CountingEndpoint {
                lifetime: EndpointLifetime::new(),
                num_destroyed: AtomicUsize::new(0),
                refs_at_destruction: AtomicU64::new(u64::MAX),
                num_sent: AtomicUsize::new(0),
                scheduler: IoScheduler::new().handle(),
            })
        }

        fn destroy(&self) {
            self.refs_at_destruction.store(self.lifetime.ref_count(), Ordering::SeqCst);
            self.num_destroyed.fetch_add(1, Ordering::SeqCst);
        }

        fn num_destroyed(&self) -> usize {
            self.num_destroyed.load(Ordering::SeqCst)
        }
    }
    impl ServiceEndpoint for CountingEndpoint {
        fn send(&self, _buf: &[u8]) -> bool {
            if !self.lifetime.is_active() {
                return false;
            }
            self.num_sent.fetch_add(1, Ordering::SeqCst);
            true
        }

        fn close(&self) -> bool {
            match self.lifetime.close() {
                CloseOutcome::AlreadyClosed => false,
                CloseOutcome::Closing => true,
                CloseOutcome::Destroy => {
                    self.destroy();
                    true
                }
            }
        }

        fn run_pending_io(&self) -> bool {
            self.lifetime.is_active() && self.scheduler.run_once()
        }

        fn request_callback(&self) -> bool {
            self.lifetime.is_active()
        }

        fn scheduler(&self) -> SchedulerHandle {
            self.scheduler.clone()
        }

        fn add_ref(&self) -> bool {
            self.lifetime.add_ref()
        }

        fn release(&self) -> bool {
            match self.lifetime.release() {
                ReleaseOutcome::Unbalanced => false,
                ReleaseOutcome::Alive => true,
                ReleaseOutcome::Destroy => {
                    self.destroy();
                    true
                }
            }
        }
    }

    #[test]
    fn test_lifetime_initial() {
        let lifetime = EndpointLifetime::new();
        assert_eq!(lifetime.state(), EndpointState::Active);
        assert_eq!(lifetime.ref_count(), 0);
    }

    #[test]
    fn test_add_ref_release_stays_alive() {
        let lifetime = EndpointLifetime::new();
        assert!(lifetime.add_ref());
        assert_eq!(lifetime.ref_count(), 1);
        assert_eq!(lifetime.release(), ReleaseOutcome::Alive);
        assert_eq!(lifetime.state(), EndpointState::Active);
        assert_eq!(lifetime.ref_count(), 0);
    }

    #[test]
    fn test_unbalanced_release() {
        let lifetime = EndpointLifetime::new();
        assert_eq!(lifetime.release(), ReleaseOutcome::Unbalanced);
        assert_eq!(lifetime.ref_count(), 0);
        assert_eq!(lifetime.state(), EndpointState::Active);
    }

    #[test]
    fn test_close_then_release() {
        let lifetime = EndpointLifetime::new();
        assert!(lifetime.add_ref());
        assert!(lifetime.add_ref());

        assert_eq!(lifetime.close(), CloseOutcome::Closing);
        assert_eq!(lifetime.state(), EndpointState::ClosingPendingRefs);

        assert_eq!(lifetime.release(), ReleaseOutcome::Alive);
        assert_eq!(lifetime.state(), EndpointState::ClosingPendingRefs);
        assert_eq!(lifetime.release(), ReleaseOutcome::Destroy);
        assert_eq!(lifetime.state(), EndpointState::Destroyed);
    }

    #[test]
    fn test_release_then_close() {
        let lifetime = EndpointLifetime::new();
        assert!(lifetime.add_ref());
        assert_eq!(lifetime.release(), ReleaseOutcome::Alive);

        assert_eq!(lifetime.close(), CloseOutcome::Destroy);
        assert_eq!(lifetime.state(), EndpointState::Destroyed);
    }

    #[test]
    fn test_close_is_idempotent() {
        let lifetime = EndpointLifetime::new();
        assert!(lifetime.add_ref());
        assert_eq!(lifetime.close(), CloseOutcome::Closing);
        assert_eq!(lifetime.close(), CloseOutcome::AlreadyClosed);
        assert_eq!(lifetime.release(), ReleaseOutcome::Destroy);
        assert_eq!(lifetime.close(), CloseOutcome::AlreadyClosed);
    }

    #[test]
    fn test_add_ref_while_closing_succeeds() {
        let lifetime = EndpointLifetime::new();
        assert!(lifetime.add_ref());
        lifetime.close();

        assert!(lifetime.add_ref());
        assert_eq!(lifetime.release(), ReleaseOutcome::Alive);
        assert_eq!(lifetime.release(), ReleaseOutcome::Destroy);
    }

    #[test]
    fn test_add_ref_overflow_fails() {
        let lifetime = EndpointLifetime {
            state: AtomicU64::new(EndpointLifetime::COUNT_MASK),
        };
        assert!(!lifetime.add_ref());
        assert_eq!(lifetime.ref_count(), EndpointLifetime::COUNT_MASK);
        assert_eq!(lifetime.state(), EndpointState::Active);
    }

    #[test]
    fn test_add_ref_after_destroy_fails() {
        let lifetime = EndpointLifetime::new();
        lifetime.close();
        assert!(!lifetime.add_ref());
        assert_eq!(lifetime.release(), ReleaseOutcome::Unbalanced);
        assert_eq!(lifetime.state(), EndpointState::Destroyed);
    }

    #[rstest]
    #[case::close_first(true)]
    #[case::release_first(false)]
    fn test_destroyed_iff_closed_and_unreferenced(#[case] close_first: bool) {
        let ep = CountingEndpoint::new();
        let ep_ref = EndpointRef::new(ep.clone());

        let guard = ep_ref.acquire().unwrap();
        if close_first {
            assert!(guard.close());
            assert_eq!(ep.num_destroyed(), 0);
            drop(guard);
        }
        else {
            drop(guard);
            assert_eq!(ep.num_destroyed(), 0);
            assert!(ep.close());
        }

        assert_eq!(ep.num_destroyed(), 1);
        assert_eq!(ep.refs_at_destruction.load(Ordering::SeqCst), 0);
        assert!(ep_ref.acquire().is_none());
    }

    #[test]
    fn test_guard_keeps_endpoint_callable() {
        let ep = CountingEndpoint::new();
        let ep_ref = EndpointRef::new(ep.clone());

        {
            let guard = ep_ref.acquire().unwrap();
            assert!(guard.send(b"abc"));
        }
        assert_eq!(ep.lifetime.state(), EndpointState::Active);
        assert!(ep_ref.send(b"def"));
        assert_eq!(ep.num_sent.load(Ordering::SeqCst), 2);
        assert_eq!(ep.num_destroyed(), 0);
    }

    #[test]
    fn test_send_after_close_fails_gracefully() {
        let ep = CountingEndpoint::new();
        let ep_ref = EndpointRef::new(ep.clone());

        let guard = ep_ref.acquire().unwrap();
        assert!(guard.close());

        assert!(!guard.send(b"abc"));
        assert!(!guard.run_pending_io());
        assert!(!guard.request_callback());
        assert!(!guard.close());
        assert_eq!(ep.lifetime.state(), EndpointState::ClosingPendingRefs);

        drop(guard);
        assert_eq!(ep.num_destroyed(), 1);
        assert!(!ep_ref.send(b"abc"));
    }

    #[test]
    fn test_guard_clone_holds_own_reference() {
        let ep = CountingEndpoint::new();
        let ep_ref = EndpointRef::new(ep.clone());

        let guard = ep_ref.acquire().unwrap();
        let cloned = guard.clone();
        assert_eq!(ep.lifetime.ref_count(), 2);

        guard.close();
        drop(guard);
        assert_eq!(ep.num_destroyed(), 0);
        drop(cloned);
        assert_eq!(ep.num_destroyed(), 1);
    }

    #[test]
    fn test_with_releases_on_panic() {
        let ep = CountingEndpoint::new();
        let ep_ref = EndpointRef::new(ep.clone());

        let result = std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| {
            ep_ref.with(|_| panic!("handler failure"))
        }));
        assert!(result.is_err());
        assert_eq!(ep.lifetime.ref_count(), 0);
    }

    #[test]
    fn test_guard_add_ref_release_on_mock() {
        let mut seq = Sequence::new();
        let mut mock = MockServiceEndpoint::new();
        mock.expect_add_ref()
            .times(1)
            .in_sequence(&mut seq)
            .return_const(true);
        mock.expect_send()
            .withf(|buf| buf.to_vec() == b"hello".to_vec())
            .times(1)
            .in_sequence(&mut seq)
            .return_const(true);
        mock.expect_release()
            .times(1)
            .in_sequence(&mut seq)
            .return_const(true);

        let ep_ref = EndpointRef::new(Arc::new(mock));
        assert!(ep_ref.send(b"hello"));
    }

    #[test]
    fn test_acquire_fails_on_mock() {
        let mut mock = MockServiceEndpoint::new();
        // once for acquire(), once for close()
        mock.expect_add_ref()
            .times(2)
            .return_const(false);
        mock.expect_release()
            .never();

        let ep_ref = EndpointRef::new(Arc::new(mock));
        assert!(ep_ref.acquire().is_none());
        assert!(!ep_ref.close());
    }

    #[rstest]
    #[case::few(4, 100, false)]
    #[case::many(16, 1_000, false)]
    #[case::few_released_at_close(4, 100, true)]
    #[case::many_released_at_close(16, 1_000, true)]
    fn test_concurrent_callers_with_close(#[case] num_callers: usize, #[case] iterations: usize, #[case] release_at_close: bool) {
        let ep = CountingEndpoint::new();
        let ep_ref = EndpointRef::new(ep.clone());

        // the transport's own reference, released either at the close point (so the last caller
        //  destroys) or after all callers are done
        let transport_guard = Arc::new(Mutex::new(ep_ref.acquire()));

        let close_at = rand::random::<usize>() % (num_callers * iterations);
        let counter = Arc::new(AtomicUsize::new(0));
        let closed = Arc::new(AtomicBool::new(false));
        let barrier = Arc::new(Barrier::new(num_callers));

        let callers = (0..num_callers)
            .map(|_| {
                let ep_ref = ep_ref.clone();
                let ep = ep.clone();
                let counter = counter.clone();
                let closed = closed.clone();
                let barrier = barrier.clone();
                let transport_guard = transport_guard.clone();
                thread::spawn(move || {
                    barrier.wait();
                    for _ in 0..iterations {
                        let Some(guard) = ep_ref.acquire() else {
                            break;
                        };
                        if counter.fetch_add(1, Ordering::SeqCst) == close_at {
                            assert!(guard.close());
                            closed.store(true, Ordering::SeqCst);
                            if release_at_close {
                                let released = transport_guard.lock().unwrap().take();
                                drop(released);
                            }
                        }
                        guard.send(b"x");
                        assert_eq!(ep.num_destroyed(), 0);
                        drop(guard);
                    }
                })
            })
            .collect::<Vec<_>>();

        for c in callers {
            c.join().unwrap();
        }

        assert!(closed.load(Ordering::SeqCst));
        if !release_at_close {
            assert_eq!(ep.num_destroyed(), 0);
            let released = transport_guard.lock().unwrap().take();
            assert!(released.is_some());
            drop(released);
        }

        assert_eq!(ep.num_destroyed(), 1);
        assert_eq!(ep.refs_at_destruction.load(Ordering::SeqCst), 0);
        assert!(ep_ref.acquire().is_none());
    }
}
