// SPDX-License-Identifier: AGPL-3.0
// Ftper Core - Scoped subscriptions
//
// A UI context opens a SubscriptionScope, attaches listeners to it, and
// closes (or drops) the scope when it goes away. Every listener attached
// to the scope stops with it.

use crate::task::Task;
use tokio::runtime::Handle;
use tokio::sync::{broadcast, watch};
use tokio_util::sync::CancellationToken;

/// Handle to one listener; cancelling it stops only that listener
#[derive(Debug, Clone)]
pub struct Subscription {
    token: CancellationToken,
}

impl Subscription {
    pub fn cancel(&self) {
        self.token.cancel();
    }

    pub fn is_active(&self) -> bool {
        !self.token.is_cancelled()
    }
}

/// Owner of every listener a UI context has attached
pub struct SubscriptionScope {
    root: CancellationToken,
    handle: Handle,
}

impl SubscriptionScope {
    /// Listeners run as tasks on `handle`
    pub fn new(handle: Handle) -> Self {
        Self {
            root: CancellationToken::new(),
            handle,
        }
    }

    /// Call `f` for each message on an event channel until cancelled
    pub fn on_message<F>(&self, mut rx: broadcast::Receiver<String>, mut f: F) -> Subscription
    where
        F: FnMut(String) + Send + 'static,
    {
        let token = self.root.child_token();
        let cancel = token.clone();

        self.handle.spawn(async move {
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    msg = rx.recv() => match msg {
                        Ok(msg) => f(msg),
                        Err(broadcast::error::RecvError::Lagged(n)) => {
                            tracing::debug!("Listener lagged, skipped {} messages", n);
                        }
                        Err(broadcast::error::RecvError::Closed) => break,
                    },
                }
            }
        });

        Subscription { token }
    }

    /// Call `f` with the current task list and then with every newer one.
    ///
    /// Intermediate snapshots may be skipped; the latest is always delivered.
    pub fn on_snapshot<F>(&self, mut rx: watch::Receiver<Vec<Task>>, mut f: F) -> Subscription
    where
        F: FnMut(&[Task]) + Send + 'static,
    {
        let token = self.root.child_token();
        let cancel = token.clone();

        self.handle.spawn(async move {
            loop {
                {
                    let tasks = rx.borrow_and_update().clone();
                    f(&tasks);
                }
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    changed = rx.changed() => {
                        if changed.is_err() {
                            break;
                        }
                    }
                }
            }
        });

        Subscription { token }
    }

    /// Stop every listener attached to this scope
    pub fn close(&self) {
        self.root.cancel();
    }

    pub fn is_closed(&self) -> bool {
        self.root.is_cancelled()
    }
}

impl Drop for SubscriptionScope {
    fn drop(&mut self) {
        self.root.cancel();
    }
}
