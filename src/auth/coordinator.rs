// Single-flight token refresh coordination

use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use tokio::sync::oneshot;
use tokio::task::JoinHandle;

use crate::error::RefreshError;

/// Default quiet period after a refresh settles
pub const DEFAULT_REFRESH_DEBOUNCE: Duration = Duration::from_secs(3);

/// Outcome delivered to every request waiting on a refresh
pub type RefreshOutcome = Result<String, RefreshError>;

/// Refresh lifecycle phase
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RefreshPhase {
    /// No refresh in progress or recently completed
    Idle,
    /// A refresh call is outstanding
    Refreshing,
    /// A refresh settled within the debounce window
    Cooldown,
}

/// What a request that hit an expired token should do next
#[derive(Debug)]
pub enum RefreshRole<'a> {
    /// Perform the refresh call and settle the guard
    Refresher(RefreshGuard<'a>),
    /// Wait for the refresh already in progress
    Waiter(oneshot::Receiver<RefreshOutcome>),
    /// The token this request was sent with has already been replaced;
    /// replay with the contained token without refreshing again
    Coalesced(String),
    /// The refresh for the token this request was sent with already failed
    /// and the session was signed out; report that failure again
    Failed(RefreshError),
}

struct RefreshState {
    phase: RefreshPhase,
    waiters: Vec<oneshot::Sender<RefreshOutcome>>,
    last_issued: Option<String>,
    /// Token the outstanding refresh was started for
    refreshed_from: Option<String>,
    /// Token and error of a refresh that failed within the cooldown window
    last_failure: Option<(Option<String>, RefreshError)>,
    debounce_handle: Option<JoinHandle<()>>,
    generation: u64,
}

impl RefreshState {
    fn cancel_debounce(&mut self) {
        self.generation = self.generation.wrapping_add(1);
        if let Some(handle) = self.debounce_handle.take() {
            handle.abort();
        }
    }

    fn forget_outcome(&mut self) {
        self.last_issued = None;
        self.last_failure = None;
    }
}

/// Refresh state machine shared by every request of one client
///
/// All transitions happen under a synchronous lock that is never held across
/// an await point, so exactly one caller can move the machine into
/// `Refreshing`.
pub struct RefreshCoordinator {
    state: Arc<Mutex<RefreshState>>,
    debounce: Duration,
}

impl Default for RefreshCoordinator {
    fn default() -> Self {
        Self::new(DEFAULT_REFRESH_DEBOUNCE)
    }
}

impl RefreshCoordinator {
    pub fn new(debounce: Duration) -> Self {
        Self {
            state: Arc::new(Mutex::new(RefreshState {
                phase: RefreshPhase::Idle,
                waiters: Vec::new(),
                last_issued: None,
                refreshed_from: None,
                last_failure: None,
                debounce_handle: None,
                generation: 0,
            })),
            debounce,
        }
    }

    fn lock(&self) -> MutexGuard<'_, RefreshState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Current phase
    pub fn phase(&self) -> RefreshPhase {
        self.lock().phase
    }

    /// Whether a refresh is outstanding or within its cooldown window
    pub fn in_progress(&self) -> bool {
        self.phase() != RefreshPhase::Idle
    }

    /// Number of requests waiting on the current refresh
    pub fn pending(&self) -> usize {
        self.lock().waiters.len()
    }

    /// Forget the last refresh outcome, e.g. after a fresh sign-in
    pub fn clear_issued(&self) {
        self.lock().forget_outcome();
    }

    /// Decide the role of a request whose token was rejected
    ///
    /// `sent_token` is the access token the rejected request carried.
    pub fn enter(&self, sent_token: Option<&str>) -> RefreshRole<'_> {
        let mut state = self.lock();
        let phase = state.phase;

        match phase {
            RefreshPhase::Refreshing => {
                let (tx, rx) = oneshot::channel();
                state.waiters.push(tx);
                tracing::debug!(pending = state.waiters.len(), "Queued behind token refresh");
                RefreshRole::Waiter(rx)
            }
            RefreshPhase::Cooldown => {
                if let Some((failed_token, error)) = &state.last_failure {
                    // No token means the request went out after the sign-out
                    if sent_token.is_none() || sent_token == failed_token.as_deref() {
                        tracing::debug!("Token refresh already failed, not retrying");
                        return RefreshRole::Failed(error.clone());
                    }
                }
                if let Some(issued) = state.last_issued.as_deref() {
                    if sent_token != Some(issued) {
                        tracing::debug!("Token already refreshed, replaying without refresh");
                        return RefreshRole::Coalesced(issued.to_string());
                    }
                }
                self.start(&mut state, sent_token)
            }
            RefreshPhase::Idle => self.start(&mut state, sent_token),
        }
    }

    fn start(&self, state: &mut RefreshState, sent_token: Option<&str>) -> RefreshRole<'_> {
        state.cancel_debounce();
        state.phase = RefreshPhase::Refreshing;
        state.refreshed_from = sent_token.map(str::to_string);
        tracing::debug!("Token refresh started");
        RefreshRole::Refresher(RefreshGuard {
            coordinator: self,
            settled: false,
        })
    }

    fn settle(&self, outcome: RefreshOutcome) {
        let waiters = {
            let mut state = self.lock();
            state.cancel_debounce();
            state.phase = RefreshPhase::Cooldown;
            let refreshed_from = state.refreshed_from.take();
            match &outcome {
                Ok(token) => {
                    state.last_issued = Some(token.clone());
                    state.last_failure = None;
                }
                Err(error) => {
                    state.last_issued = None;
                    state.last_failure = Some((refreshed_from, error.clone()));
                }
            }
            state.debounce_handle = self.schedule_idle(state.generation);
            if state.debounce_handle.is_none() {
                state.phase = RefreshPhase::Idle;
                state.forget_outcome();
            }
            std::mem::take(&mut state.waiters)
        };

        tracing::debug!(
            waiters = waiters.len(),
            success = outcome.is_ok(),
            "Token refresh settled, releasing queued requests"
        );

        for waiter in waiters {
            // A waiter whose request was dropped no longer listens
            let _ = waiter.send(outcome.clone());
        }
    }

    /// Spawn the cooldown timer; `None` outside a tokio runtime
    fn schedule_idle(&self, generation: u64) -> Option<JoinHandle<()>> {
        let runtime = tokio::runtime::Handle::try_current().ok()?;
        let state = Arc::clone(&self.state);
        let debounce = self.debounce;

        Some(runtime.spawn(async move {
            tokio::time::sleep(debounce).await;
            let mut state = state.lock().unwrap_or_else(PoisonError::into_inner);
            if state.generation == generation && state.phase == RefreshPhase::Cooldown {
                state.phase = RefreshPhase::Idle;
                state.forget_outcome();
                state.debounce_handle = None;
                tracing::debug!("Token refresh cooldown elapsed");
            }
        }))
    }
}

impl Drop for RefreshCoordinator {
    fn drop(&mut self) {
        self.lock().cancel_debounce();
    }
}

/// Held by the single request performing a refresh
///
/// Dropping it unsettled releases every waiter with
/// [`RefreshError::Abandoned`].
#[derive(Debug)]
pub struct RefreshGuard<'a> {
    coordinator: &'a RefreshCoordinator,
    settled: bool,
}

impl RefreshGuard<'_> {
    /// Publish the refresh outcome to all waiters and enter cooldown
    pub fn settle(mut self, outcome: RefreshOutcome) {
        self.settled = true;
        self.coordinator.settle(outcome);
    }
}

impl Drop for RefreshGuard<'_> {
    fn drop(&mut self) {
        if !self.settled {
            tracing::warn!("Token refresh dropped before completion");
            self.coordinator.settle(Err(RefreshError::Abandoned));
        }
    }
}

impl std::fmt::Debug for RefreshCoordinator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RefreshCoordinator")
            .field("phase", &self.phase())
            .field("debounce", &self.debounce)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn expect_refresher(role: RefreshRole<'_>) -> RefreshGuard<'_> {
        match role {
            RefreshRole::Refresher(guard) => guard,
            other => panic!("expected refresher, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_first_caller_refreshes_rest_wait() {
        let coordinator = RefreshCoordinator::new(Duration::from_secs(60));
        assert_eq!(coordinator.phase(), RefreshPhase::Idle);

        let guard = expect_refresher(coordinator.enter(Some("t1")));
        assert_eq!(coordinator.phase(), RefreshPhase::Refreshing);

        let mut receivers = Vec::new();
        for _ in 0..3 {
            match coordinator.enter(Some("t1")) {
                RefreshRole::Waiter(rx) => receivers.push(rx),
                other => panic!("expected waiter, got {:?}", other),
            }
        }
        assert_eq!(coordinator.pending(), 3);

        guard.settle(Ok("t2".to_string()));
        assert_eq!(coordinator.phase(), RefreshPhase::Cooldown);
        assert_eq!(coordinator.pending(), 0);

        for rx in receivers {
            assert_eq!(rx.await.unwrap(), Ok("t2".to_string()));
        }
    }

    #[tokio::test]
    async fn test_failure_reaches_every_waiter() {
        let coordinator = RefreshCoordinator::new(Duration::from_secs(60));
        let guard = expect_refresher(coordinator.enter(None));
        let rx = match coordinator.enter(None) {
            RefreshRole::Waiter(rx) => rx,
            other => panic!("expected waiter, got {:?}", other),
        };

        guard.settle(Err(RefreshError::Transport("timeout".to_string())));
        assert_eq!(
            rx.await.unwrap(),
            Err(RefreshError::Transport("timeout".to_string()))
        );
    }

    #[tokio::test]
    async fn test_dropped_refresher_releases_waiters() {
        let coordinator = RefreshCoordinator::new(Duration::from_secs(60));
        let guard = expect_refresher(coordinator.enter(Some("t1")));
        let rx = match coordinator.enter(Some("t1")) {
            RefreshRole::Waiter(rx) => rx,
            other => panic!("expected waiter, got {:?}", other),
        };

        drop(guard);
        assert_eq!(rx.await.unwrap(), Err(RefreshError::Abandoned));
        assert_eq!(coordinator.phase(), RefreshPhase::Cooldown);
    }

    #[tokio::test]
    async fn test_cooldown_coalesces_stale_token() {
        let coordinator = RefreshCoordinator::new(Duration::from_secs(60));
        expect_refresher(coordinator.enter(Some("t1"))).settle(Ok("t2".to_string()));

        match coordinator.enter(Some("t1")) {
            RefreshRole::Coalesced(token) => assert_eq!(token, "t2"),
            other => panic!("expected coalesced replay, got {:?}", other),
        }
        assert_eq!(coordinator.phase(), RefreshPhase::Cooldown);
    }

    #[tokio::test]
    async fn test_cooldown_allows_new_refresh_for_current_token() {
        let coordinator = RefreshCoordinator::new(Duration::from_secs(60));
        expect_refresher(coordinator.enter(Some("t1"))).settle(Ok("t2".to_string()));

        let guard = expect_refresher(coordinator.enter(Some("t2")));
        assert_eq!(coordinator.phase(), RefreshPhase::Refreshing);
        assert!(matches!(
            coordinator.enter(Some("t2")),
            RefreshRole::Waiter(_)
        ));
        guard.settle(Ok("t3".to_string()));
    }

    #[tokio::test]
    async fn test_cooldown_after_failure_reports_same_error() {
        let coordinator = RefreshCoordinator::new(Duration::from_secs(60));
        let error = RefreshError::Transport("timeout".to_string());
        expect_refresher(coordinator.enter(Some("t1"))).settle(Err(error.clone()));

        match coordinator.enter(Some("t1")) {
            RefreshRole::Failed(e) => assert_eq!(e, error),
            other => panic!("expected failed role, got {:?}", other),
        }
        assert!(matches!(coordinator.enter(None), RefreshRole::Failed(_)));
        assert_eq!(coordinator.phase(), RefreshPhase::Cooldown);
    }

    #[tokio::test]
    async fn test_cooldown_after_failure_refreshes_for_new_token() {
        let coordinator = RefreshCoordinator::new(Duration::from_secs(60));
        expect_refresher(coordinator.enter(Some("t1")))
            .settle(Err(RefreshError::MissingRefreshToken));

        // Signed in again during the cooldown
        assert!(matches!(
            coordinator.enter(Some("t5")),
            RefreshRole::Refresher(_)
        ));
    }

    #[tokio::test]
    async fn test_sign_in_clears_recorded_failure() {
        let coordinator = RefreshCoordinator::new(Duration::from_secs(60));
        expect_refresher(coordinator.enter(Some("t1")))
            .settle(Err(RefreshError::MissingRefreshToken));

        coordinator.clear_issued();
        assert!(matches!(
            coordinator.enter(Some("t1")),
            RefreshRole::Refresher(_)
        ));
    }

    #[tokio::test]
    async fn test_cooldown_returns_to_idle() {
        let coordinator = RefreshCoordinator::new(Duration::from_millis(100));
        expect_refresher(coordinator.enter(None)).settle(Ok("t2".to_string()));
        assert!(coordinator.in_progress());

        tokio::time::sleep(Duration::from_millis(300)).await;
        assert_eq!(coordinator.phase(), RefreshPhase::Idle);
        assert!(!coordinator.in_progress());
    }

    #[tokio::test]
    async fn test_debounce_restarts_on_every_settle() {
        let coordinator = RefreshCoordinator::new(Duration::from_millis(200));
        expect_refresher(coordinator.enter(Some("t1"))).settle(Ok("t2".to_string()));

        tokio::time::sleep(Duration::from_millis(120)).await;
        expect_refresher(coordinator.enter(Some("t2"))).settle(Ok("t3".to_string()));

        // First timer would have fired by now
        tokio::time::sleep(Duration::from_millis(120)).await;
        assert_eq!(coordinator.phase(), RefreshPhase::Cooldown);

        tokio::time::sleep(Duration::from_millis(250)).await;
        assert_eq!(coordinator.phase(), RefreshPhase::Idle);
    }

    #[tokio::test]
    async fn test_no_idle_transition_while_refreshing() {
        let coordinator = RefreshCoordinator::new(Duration::from_millis(50));
        expect_refresher(coordinator.enter(Some("t1"))).settle(Ok("t2".to_string()));
        let guard = expect_refresher(coordinator.enter(Some("t2")));

        tokio::time::sleep(Duration::from_millis(150)).await;
        assert_eq!(coordinator.phase(), RefreshPhase::Refreshing);
        guard.settle(Ok("t3".to_string()));
    }
}
