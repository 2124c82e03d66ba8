// Copyright 2020 Pants project contributors (see CONTRIBUTORS.md).
// Licensed under the Apache License, Version 2.0 (see LICENSE).

use std::sync::Arc;

use tokio::sync::watch;

///
/// A condition which starts out untriggered and may be triggered exactly once, releasing every
/// task that is waiting on it (and every task which waits on it afterward).
///
/// Clones share the same underlying condition, so a latch can be handed to a Session and also
/// held by whoever might want to cancel that Session.
///
#[derive(Clone)]
pub struct AsyncLatch {
    state: Arc<watch::Sender<bool>>,
}

impl AsyncLatch {
    pub fn new() -> AsyncLatch {
        let (state, _) = watch::channel(false);
        AsyncLatch {
            state: Arc::new(state),
        }
    }

    ///
    /// Mark this latch triggered. Only the first call has any effect.
    ///
    pub fn trigger(&self) {
        self.state.send_if_modified(|triggered| {
            if *triggered {
                false
            } else {
                *triggered = true;
                true
            }
        });
    }

    ///
    /// Wait for the latch to be triggered. Returns immediately if it already has been.
    ///
    pub async fn triggered(&self) {
        let mut receiver = self.state.subscribe();
        // The Sender is owned by `self`, so it cannot be dropped while we wait.
        let _ = receiver.wait_for(|triggered| *triggered).await;
    }

    ///
    /// Return true if the latch has been triggered.
    ///
    pub fn poll_triggered(&self) -> bool {
        *self.state.borrow()
    }
}
