//! Cooperative shutdown signalling over a `watch` channel.
//!
//! The process owns the single [`ShutdownTrigger`]; every loop holds a
//! `watch::Receiver<bool>` and checks it between iterations.

use std::time::Duration;

use tokio::sync::watch;

pub struct ShutdownTrigger {
    tx: watch::Sender<bool>,
}

impl ShutdownTrigger {
    pub fn trigger(&self) {
        let _ = self.tx.send(true);
    }
}

pub fn channel() -> (ShutdownTrigger, watch::Receiver<bool>) {
    let (tx, rx) = watch::channel(false);
    (ShutdownTrigger { tx }, rx)
}

pub fn requested(rx: &watch::Receiver<bool>) -> bool {
    *rx.borrow()
}

/// Sleep one quantum, waking early on shutdown. Returns `true` when the
/// caller should stop, including when the trigger has been dropped.
pub async fn idle(quantum: Duration, rx: &mut watch::Receiver<bool>) -> bool {
    tokio::select! {
        _ = tokio::time::sleep(quantum) => requested(rx),
        changed = rx.changed() => changed.is_err() || requested(rx),
    }
}

/// Wait until shutdown is requested or the trigger is dropped.
pub async fn wait(rx: &mut watch::Receiver<bool>) {
    while !requested(rx) {
        if rx.changed().await.is_err() {
            return;
        }
    }
}
