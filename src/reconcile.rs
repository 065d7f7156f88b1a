//! The reconciliation loop
//!
//! One task owns every entry and the supervisor. Each tick sleeps for
//! `timing.tick_ms`; every `detect_every` ticks all entries are checked and
//! dirty ones re-rendered, every `poll_every` ticks the proxy is polled (and
//! reloaded if a fragment changed). A dead proxy ends the loop.

use crate::config::TimingConfig;
use crate::entry::BackendEntry;
use crate::error::ProxyError;
use crate::render::TemplateRenderer;
use crate::resolver::Resolver;
use crate::supervisor::{Liveness, ProxySupervisor};
use tokio::sync::watch;
use tracing::{debug, error, info};

/// Why the loop stopped
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExitReason {
    /// Shutdown was requested
    Shutdown,
    /// The proxy process exited (or was never running)
    ProxyExited { code: Option<i32> },
}

pub struct Reconciler<R, T> {
    entries: Vec<BackendEntry>,
    resolver: R,
    renderer: T,
    supervisor: ProxySupervisor,
    timing: TimingConfig,
    shutdown_rx: watch::Receiver<bool>,
}

impl<R: Resolver, T: TemplateRenderer> Reconciler<R, T> {
    pub fn new(
        entries: Vec<BackendEntry>,
        resolver: R,
        renderer: T,
        supervisor: ProxySupervisor,
        timing: TimingConfig,
        shutdown_rx: watch::Receiver<bool>,
    ) -> Self {
        Self {
            entries,
            resolver,
            renderer,
            supervisor,
            timing,
            shutdown_rx,
        }
    }

    pub fn entries(&self) -> &[BackendEntry] {
        &self.entries
    }

    pub fn entry(&self, name: &str) -> Option<&BackendEntry> {
        self.entries.iter().find(|e| e.name() == name)
    }

    pub fn supervisor(&self) -> &ProxySupervisor {
        &self.supervisor
    }

    /// Detect changes on every entry and render the dirty ones.
    ///
    /// Returns the number of fragments written. Nothing in here fails the loop.
    pub async fn reconcile(&mut self) -> usize {
        let mut rendered = 0;
        for entry in &mut self.entries {
            entry.detect_change(&self.resolver).await;
            if !entry.take_dirty() {
                continue;
            }
            // The flag is already clear: a failed render waits for the next change
            match self.renderer.render(entry) {
                Ok(text) => match self.supervisor.save_fragment(entry.name(), &text) {
                    Ok(path) => {
                        info!(name = %entry.name(), path = %path.display(), "Fragment rendered");
                        rendered += 1;
                    }
                    Err(e) => {
                        error!(name = %entry.name(), error = %e, "Failed to write fragment");
                    }
                },
                Err(e) if e.is_precondition() => {
                    error!(name = %entry.name(), error = %e, "Failed to render template");
                }
                Err(e) => {
                    error!(name = %entry.name(), error = ?e, "Failed to render template");
                }
            }
        }
        if rendered == 0 {
            debug!(entries = self.entries.len(), "No changes detected");
        }
        rendered
    }

    /// Poll the proxy, applying a pending reload if it is alive
    pub async fn poll(&mut self) -> Liveness {
        self.supervisor.check().await
    }

    /// Output directories and include file, initial render, proxy start.
    ///
    /// The include only globs the render directory, so it can be written
    /// before any fragment exists.
    pub async fn startup(&mut self) -> Result<(), ProxyError> {
        self.supervisor.prepare()?;
        let rendered = self.reconcile().await;
        info!(entries = self.entries.len(), rendered, "Initial render complete");
        self.supervisor.start()?;
        Ok(())
    }

    /// Run until shutdown is requested or the proxy dies.
    ///
    /// The proxy is always asked to terminate before this returns.
    pub async fn run(mut self) -> Result<ExitReason, ProxyError> {
        if let Err(e) = self.startup().await {
            self.supervisor.terminate();
            return Err(e);
        }

        let reason = self.steady_state().await;
        info!(reason = ?reason, "Exiting");
        self.supervisor.terminate();
        Ok(reason)
    }

    async fn steady_state(&mut self) -> ExitReason {
        let tick = self.timing.tick();
        let detect_every = self.timing.detect_every();
        let poll_every = self.timing.poll_every();
        let mut ticks: u64 = 0;

        loop {
            if *self.shutdown_rx.borrow() {
                return ExitReason::Shutdown;
            }

            tokio::select! {
                _ = tokio::time::sleep(tick) => {}
                changed = self.shutdown_rx.changed() => {
                    // A dropped sender can never signal again; treat it as shutdown
                    if changed.is_err() || *self.shutdown_rx.borrow() {
                        return ExitReason::Shutdown;
                    }
                    continue;
                }
            }

            if ticks % detect_every == 0 {
                self.reconcile().await;
            }

            if ticks % poll_every == 0 {
                match self.poll().await {
                    Liveness::Alive => {}
                    Liveness::Exited { code } => {
                        error!(code = ?code, "Proxy failed");
                        return ExitReason::ProxyExited { code };
                    }
                    Liveness::NotRunning => {
                        error!("Proxy is not running");
                        return ExitReason::ProxyExited { code: None };
                    }
                }
            }

            ticks = ticks.wrapping_add(1);
        }
    }
}
