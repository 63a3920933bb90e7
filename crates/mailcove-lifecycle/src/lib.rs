//! Process lifetime for the capture daemon: admit sessions while the
//! process is healthy, and on shutdown stop admitting, wake idle
//! tasks, and drain in-flight sessions up to a grace deadline.

use once_cell::sync::OnceCell;
use std::sync::Mutex;
use std::time::Duration;
use tokio::sync::{mpsc, watch};

static STATE: OnceCell<SharedState> = OnceCell::new();

struct SharedState {
    /// Cloned into every SessionGuard. Taken at shutdown so new
    /// sessions are refused and the drain receiver can observe the
    /// last guard dropping.
    admit: Mutex<Option<mpsc::Sender<()>>>,
    /// Flipped to true exactly once, at shutdown.
    stop: watch::Sender<bool>,
    /// Programmatic shutdown trigger, for tests and tooling.
    request: watch::Sender<bool>,
}

/// Held by each live protocol session. While any guard is alive,
/// `Lifetime::run_until_shutdown` keeps waiting (up to its grace
/// deadline). Refused once shutdown has begun.
pub struct SessionGuard {
    _alive: mpsc::Sender<()>,
}

impl SessionGuard {
    pub fn begin() -> anyhow::Result<Self> {
        let state = STATE
            .get()
            .ok_or_else(|| anyhow::anyhow!("process lifetime is not initialized"))?;
        let alive = state
            .admit
            .lock()
            .unwrap()
            .clone()
            .ok_or_else(|| anyhow::anyhow!("shutting down"))?;
        Ok(Self { _alive: alive })
    }
}

/// A wakeup for idling tasks: select on your own work and
/// `Shutdown::wait` to notice the process stopping.
pub struct Shutdown {
    rx: watch::Receiver<bool>,
}

impl Shutdown {
    /// Outside an initialized lifetime (unit tests), the returned
    /// subscription simply never fires.
    pub fn subscribe() -> Self {
        let rx = match STATE.get() {
            Some(state) => state.stop.subscribe(),
            None => {
                let (tx, rx) = watch::channel(false);
                // Keep the sender alive forever so the subscription
                // pends rather than erroring out.
                std::mem::forget(tx);
                rx
            }
        };
        Self { rx }
    }

    /// Completes once shutdown has begun.
    pub async fn wait(&mut self) {
        self.rx.wait_for(|stopping| *stopping).await.ok();
    }
}

/// Ask the process to shut down without a signal. `run_until_shutdown`
/// treats this exactly like ctrl-c.
pub fn request_shutdown() {
    if let Some(state) = STATE.get() {
        state.request.send(true).ok();
    }
}

/// Owns the drain side of session admission. Construct one at startup,
/// before the listeners begin admitting sessions.
pub struct Lifetime {
    sessions_done: mpsc::Receiver<()>,
    request_rx: watch::Receiver<bool>,
}

impl Lifetime {
    /// Prepare the process-wide state. Panics if called twice.
    pub fn init() -> Self {
        let (admit, sessions_done) = mpsc::channel(1);
        let (stop, _) = watch::channel(false);
        let (request, request_rx) = watch::channel(false);
        if STATE
            .set(SharedState {
                admit: Mutex::new(Some(admit)),
                stop,
                request,
            })
            .is_err()
        {
            panic!("process lifetime initialized twice");
        }
        Self {
            sessions_done,
            request_rx,
        }
    }

    /// Block until ctrl-c or `request_shutdown`, then refuse new
    /// sessions, wake every `Shutdown` subscriber, and wait for live
    /// sessions to finish. Sessions still running after `grace` are
    /// abandoned.
    pub async fn run_until_shutdown(mut self, grace: Duration) {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {}
            _ = self.request_rx.wait_for(|requested| *requested) => {}
        }
        tracing::info!("shutdown requested, draining sessions");

        let state = STATE.get().expect("initialized by Lifetime::init");
        state.admit.lock().unwrap().take();
        state.stop.send(true).ok();

        if tokio::time::timeout(grace, self.sessions_done.recv())
            .await
            .is_err()
        {
            tracing::warn!("shutdown grace period expired, abandoning remaining sessions");
        }
    }
}
