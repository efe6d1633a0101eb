//! The cooperative scheduler contract and its single-threaded reference
//! binding: spawn without running synchronously, and yield once.

use std::future::Future;

use crate::response::BoxFuture;

/// What the worker and accept dispatcher require of a scheduler.
/// Implementors must not run `fut` synchronously inside `spawn` — it has
/// to be scheduled for a later turn so the caller can keep making
/// progress.
pub trait Scheduler {
    fn spawn(&self, fut: BoxFuture<'static, ()>);
}

/// The reference binding: one OS thread driving one set of non-`Send`
/// tasks via a `tokio::task::LocalSet`. `spawn` requires the caller be
/// inside that set — see [`run_local`].
#[derive(Clone, Copy, Default)]
pub struct LocalScheduler;

impl Scheduler for LocalScheduler {
    fn spawn(&self, fut: BoxFuture<'static, ()>) {
        tokio::task::spawn_local(fut);
    }
}

/// Suspends the current task once, letting other ready tasks run before
/// the keep-alive loop issues its next read.
pub async fn yield_now() {
    tokio::task::yield_now().await;
}

/// Runs `fut` to completion on a single-threaded, `LocalSet`-backed
/// runtime — the reference scheduler binding this crate assumes. Intended
/// for the top-level entry point (`main`); library code below this point
/// only ever calls `spawn`/`yield_now`.
pub fn run_local<F>(fut: F) -> F::Output
where
    F: Future + 'static,
{
    let rt = tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()
        .expect("failed to build current-thread tokio runtime");
    let local = tokio::task::LocalSet::new();
    local.block_on(&rt, fut)
}
