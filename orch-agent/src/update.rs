//! Check-for-update signal and the poller that hands it to the update engine.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tracing::{debug, error, info, warn};

/// Edge-triggered "check now" flag. Raises between two polls coalesce into one check.
#[derive(Debug, Clone, Default)]
pub struct UpdateSignal(Arc<AtomicBool>);

impl UpdateSignal {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn raise(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    /// Consume the flag. True at most once per raise.
    pub fn take(&self) -> bool {
        self.0.swap(false, Ordering::SeqCst)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct UpdateStatus {
    pub has_update: bool,
    pub forced: bool,
}

/// Package source and installer. Calls may block; the poller runs them off the async workers.
pub trait UpdateEngine: Send + Sync + 'static {
    fn check_for_update(&self) -> anyhow::Result<UpdateStatus>;
    fn install_latest(&self) -> bool;
}

/// Engine used when no update source is configured.
#[derive(Debug, Default)]
pub struct NoUpdateSource;

impl UpdateEngine for NoUpdateSource {
    fn check_for_update(&self) -> anyhow::Result<UpdateStatus> {
        info!("update check requested; no update source configured");
        Ok(UpdateStatus::default())
    }

    fn install_latest(&self) -> bool {
        false
    }
}

/// One poll: consume the signal, check, and install if there is something to install.
/// Returns true when an install ran and succeeded.
pub async fn poll_once(signal: &UpdateSignal, engine: &Arc<dyn UpdateEngine>) -> bool {
    if !signal.take() {
        return false;
    }
    let checker = Arc::clone(engine);
    let status = match tokio::task::spawn_blocking(move || checker.check_for_update()).await {
        Ok(Ok(s)) => s,
        Ok(Err(e)) => {
            warn!("update check failed: {:#}", e);
            return false;
        }
        Err(e) => {
            error!("update check panicked: {}", e);
            return false;
        }
    };
    if !status.has_update {
        debug!("no update available");
        return false;
    }
    info!(forced = status.forced, "installing update");
    let installer = Arc::clone(engine);
    match tokio::task::spawn_blocking(move || installer.install_latest()).await {
        Ok(true) => {
            info!("update installed");
            true
        }
        Ok(false) => {
            warn!("update install failed");
            false
        }
        Err(e) => {
            error!("update install panicked: {}", e);
            false
        }
    }
}

/// Poll forever. An install in flight holds the loop, so installs never overlap.
pub async fn run_poller(signal: UpdateSignal, engine: Arc<dyn UpdateEngine>, interval: Duration) {
    let mut ticker = tokio::time::interval(interval);
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
    loop {
        ticker.tick().await;
        poll_once(&signal, &engine).await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;

    #[derive(Default)]
    struct Recording {
        has_update: bool,
        checks: AtomicUsize,
        installs: AtomicUsize,
    }

    impl UpdateEngine for Recording {
        fn check_for_update(&self) -> anyhow::Result<UpdateStatus> {
            self.checks.fetch_add(1, Ordering::SeqCst);
            Ok(UpdateStatus {
                has_update: self.has_update,
                forced: false,
            })
        }

        fn install_latest(&self) -> bool {
            self.installs.fetch_add(1, Ordering::SeqCst);
            true
        }
    }

    #[test]
    fn signal_is_edge_triggered() {
        let s = UpdateSignal::new();
        assert!(!s.take());
        s.raise();
        s.raise();
        assert!(s.take());
        assert!(!s.take());
    }

    #[tokio::test]
    async fn no_signal_no_check() {
        let engine = Arc::new(Recording::default());
        let dyn_engine: Arc<dyn UpdateEngine> = engine.clone();
        assert!(!poll_once(&UpdateSignal::new(), &dyn_engine).await);
        assert_eq!(engine.checks.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn available_update_installed_once() {
        let engine = Arc::new(Recording {
            has_update: true,
            ..Recording::default()
        });
        let dyn_engine: Arc<dyn UpdateEngine> = engine.clone();
        let s = UpdateSignal::new();
        s.raise();
        s.raise();
        assert!(poll_once(&s, &dyn_engine).await);
        assert!(!poll_once(&s, &dyn_engine).await);
        assert_eq!(engine.checks.load(Ordering::SeqCst), 1);
        assert_eq!(engine.installs.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn nothing_to_install() {
        let engine = Arc::new(Recording::default());
        let dyn_engine: Arc<dyn UpdateEngine> = engine.clone();
        let s = UpdateSignal::new();
        s.raise();
        assert!(!poll_once(&s, &dyn_engine).await);
        assert_eq!(engine.checks.load(Ordering::SeqCst), 1);
        assert_eq!(engine.installs.load(Ordering::SeqCst), 0);
    }
}
