use parking_lot::Mutex;
use tokio::sync::oneshot;
use tokio::sync::oneshot::error::TryRecvError;
use tokio_util::sync::CancellationToken;

use crate::Error;
use crate::Result;

/// Handle on one refresh request.
///
/// Resolves once every fetch issued for the refresh has completed. Cancelling
/// only suppresses the completion notification; fetches already dispatched
/// keep running and still update the cache.
#[derive(Debug)]
pub struct RefreshToken {
    rx: oneshot::Receiver<Result<()>>,
    cancel: CancellationToken,
}

/// Producer side held by the refresher
#[derive(Debug)]
pub(crate) struct RefreshCompletion {
    tx: Mutex<Option<oneshot::Sender<Result<()>>>>,
    cancel: CancellationToken,
}

pub(crate) fn refresh_channel() -> (RefreshToken, RefreshCompletion) {
    let (tx, rx) = oneshot::channel();
    let cancel = CancellationToken::new();
    (
        RefreshToken {
            rx,
            cancel: cancel.clone(),
        },
        RefreshCompletion {
            tx: Mutex::new(Some(tx)),
            cancel,
        },
    )
}

impl RefreshToken {
    /// Token that is already resolved successfully
    pub(crate) fn completed() -> Self {
        let (token, completion) = refresh_channel();
        completion.complete(Ok(()));
        token
    }

    /// Token that is already resolved with `error`
    pub(crate) fn failed(error: Error) -> Self {
        let (token, completion) = refresh_channel();
        completion.complete(Err(error));
        token
    }

    pub fn cancel(&self) {
        self.cancel.cancel();
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancel.is_cancelled()
    }

    /// Waits for the refresh to finish.
    ///
    /// # Errors
    /// - [`Error::RefreshCancelled`] once the token is cancelled
    /// - [`Error::Closed`] if the cache was closed before the refresh finished
    /// - the error that prevented the refresh from being issued at all
    pub async fn wait(self) -> Result<()> {
        let Self { rx, cancel } = self;
        tokio::select! {
            biased;
            _ = cancel.cancelled() => Err(Error::RefreshCancelled),
            outcome = rx => match outcome {
                Ok(result) => result,
                Err(_) => Err(Error::Closed),
            },
        }
    }

    /// Non-blocking check; `None` while the refresh is still running
    pub fn try_result(&mut self) -> Option<Result<()>> {
        if self.is_cancelled() {
            return Some(Err(Error::RefreshCancelled));
        }
        match self.rx.try_recv() {
            Ok(result) => Some(result),
            Err(TryRecvError::Empty) => None,
            Err(TryRecvError::Closed) => Some(Err(Error::Closed)),
        }
    }
}

impl RefreshCompletion {
    pub(crate) fn is_cancelled(&self) -> bool {
        self.cancel.is_cancelled()
    }

    /// Resolves the token; only the first call has an effect
    pub(crate) fn complete(
        &self,
        result: Result<()>,
    ) {
        if let Some(tx) = self.tx.lock().take() {
            // The holder may have dropped the token
            let _ = tx.send(result);
        }
    }
}
