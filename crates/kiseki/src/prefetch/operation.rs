use std::sync::Arc;

use bytes::Bytes;
use futures::future::BoxFuture;
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;

use crate::error::{KisekiError, KisekiResult};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FetchStatus {
    Fetching,
    Fetched,
    Failed,
    Aborted,
}

#[derive(Debug, Clone)]
enum FetchState {
    Fetching,
    Fetched(Bytes),
    Failed(Arc<KisekiError>),
    Aborted,
}

impl FetchState {
    fn status(&self) -> FetchStatus {
        match self {
            Self::Fetching => FetchStatus::Fetching,
            Self::Fetched(_) => FetchStatus::Fetched,
            Self::Failed(_) => FetchStatus::Failed,
            Self::Aborted => FetchStatus::Aborted,
        }
    }
}

/// A running segment fetch which any number of callers may await, and which can be aborted.
///
/// Aborting drops the underlying future, releasing whatever request it held.
#[derive(Clone)]
pub struct FetchOperation {
    state: Arc<watch::Sender<FetchState>>,
    cancel: CancellationToken,
}

impl FetchOperation {
    /// Drives `fetch` on the current tokio runtime.
    pub fn spawn(fetch: BoxFuture<'static, KisekiResult<Bytes>>) -> Self {
        let (state, _) = watch::channel(FetchState::Fetching);
        let state = Arc::new(state);
        let cancel = CancellationToken::new();

        let task_state = state.clone();
        let task_cancel = cancel.clone();
        tokio::spawn(async move {
            let result = tokio::select! {
                _ = task_cancel.cancelled() => return,
                result = fetch => result,
            };
            let finished = match result {
                Ok(data) => FetchState::Fetched(data),
                Err(e) => FetchState::Failed(Arc::new(e)),
            };
            task_state.send_if_modified(|state| {
                if matches!(state, FetchState::Fetching) {
                    *state = finished;
                    true
                } else {
                    false
                }
            });
        });

        Self { state, cancel }
    }

    pub fn status(&self) -> FetchStatus {
        self.state.borrow().status()
    }

    pub fn is_pending(&self) -> bool {
        self.status() == FetchStatus::Fetching
    }

    /// Aborts a pending fetch. Returns `false` when the fetch had already settled.
    pub fn abort(&self) -> bool {
        let aborted = self.state.send_if_modified(|state| {
            if matches!(state, FetchState::Fetching) {
                *state = FetchState::Aborted;
                true
            } else {
                false
            }
        });
        if aborted {
            self.cancel.cancel();
        }
        aborted
    }

    /// Waits for the fetch to settle.
    ///
    /// An aborted fetch yields [`KisekiError::Aborted`]; a failed one yields the dispatcher's
    /// error wrapped in [`KisekiError::Shared`].
    pub async fn wait(&self) -> KisekiResult<Bytes> {
        let mut receiver = self.state.subscribe();
        let state = receiver
            .wait_for(|state| !matches!(state, FetchState::Fetching))
            .await
            .map(|state| state.clone())
            .map_err(|_| KisekiError::Aborted)?;

        match state {
            FetchState::Fetched(data) => Ok(data),
            FetchState::Failed(e) => Err(KisekiError::Shared(e)),
            FetchState::Aborted | FetchState::Fetching => Err(KisekiError::Aborted),
        }
    }
}

impl std::fmt::Debug for FetchOperation {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FetchOperation")
            .field("status", &self.status())
            .finish()
    }
}
