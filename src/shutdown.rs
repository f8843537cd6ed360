//! Graceful shutdown shared by every long-lived loop

use parking_lot::RwLock;
use std::sync::Arc;
use tokio::task::JoinHandle;
use tokio::time::{Duration, Instant};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Process-wide shutdown flag
#[derive(Debug)]
pub struct ShutdownState {
    token: CancellationToken,
    shutdown_start: RwLock<Option<Instant>>,
}

impl ShutdownState {
    pub fn new() -> Self {
        Self {
            token: CancellationToken::new(),
            shutdown_start: RwLock::new(None),
        }
    }

    /// Token observed by loops at their suspension points
    pub fn token(&self) -> CancellationToken {
        self.token.clone()
    }

    pub fn begin_shutdown(&self) {
        if self.token.is_cancelled() {
            return;
        }
        *self.shutdown_start.write() = Some(Instant::now());
        self.token.cancel();
        info!("Shutdown initiated");
    }

    pub fn is_shutting_down(&self) -> bool {
        self.token.is_cancelled()
    }

    pub fn shutdown_duration(&self) -> Option<Duration> {
        self.shutdown_start.read().map(|start| start.elapsed())
    }
}

impl Default for ShutdownState {
    fn default() -> Self {
        Self::new()
    }
}

/// Cancel `state` on the first SIGINT or SIGTERM
pub fn install_signal_handlers(state: Arc<ShutdownState>) -> JoinHandle<()> {
    tokio::spawn(async move {
        let token = state.token();
        tokio::select! {
            _ = wait_for_signal() => state.begin_shutdown(),
            _ = token.cancelled() => {}
        }
    })
}

#[cfg(unix)]
async fn wait_for_signal() {
    use tokio::signal::unix::{signal, SignalKind};
    match (signal(SignalKind::interrupt()), signal(SignalKind::terminate())) {
        (Ok(mut int), Ok(mut term)) => {
            tokio::select! {
                _ = int.recv() => info!("Received SIGINT"),
                _ = term.recv() => info!("Received SIGTERM"),
            }
        }
        _ => {
            warn!("Unix signal handlers unavailable, falling back to ctrl-c");
            let _ = tokio::signal::ctrl_c().await;
        }
    }
}

#[cfg(not(unix))]
async fn wait_for_signal() {
    let _ = tokio::signal::ctrl_c().await;
    info!("Received ctrl-c");
}

/// Join named tasks, aborting whatever is still running after `timeout`
pub async fn join_with_timeout(tasks: Vec<(&'static str, JoinHandle<()>)>, timeout: Duration) {
    let deadline = Instant::now() + timeout;
    for (name, mut handle) in tasks {
        match tokio::time::timeout_at(deadline, &mut handle).await {
            Ok(Ok(())) => debug!(task = name, "Task stopped"),
            Ok(Err(e)) => warn!(task = name, "Task ended abnormally: {}", e),
            Err(_) => {
                warn!(task = name, "Task did not stop in time, aborting");
                handle.abort();
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_shutdown_state() {
        let state = ShutdownState::new();
        assert!(!state.is_shutting_down());
        assert!(state.shutdown_duration().is_none());

        let token = state.token();
        state.begin_shutdown();
        assert!(state.is_shutting_down());
        assert!(token.is_cancelled());
        assert!(state.shutdown_duration().is_some());

        state.begin_shutdown();
        assert!(token.is_cancelled());
    }

    #[tokio::test]
    async fn test_join_with_timeout_aborts_stragglers() {
        let quick = tokio::spawn(async {});
        let stuck = tokio::spawn(async {
            tokio::time::sleep(Duration::from_secs(60)).await;
        });
        let started = std::time::Instant::now();
        join_with_timeout(
            vec![("quick", quick), ("stuck", stuck)],
            Duration::from_millis(100),
        )
        .await;
        assert!(started.elapsed() < Duration::from_secs(5));
    }
}
