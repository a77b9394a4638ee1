use std::ops::ControlFlow;
use std::thread;
use serde::Serialize;
use tokio::sync::mpsc::error::TryRecvError;
use tokio::sync::{mpsc, oneshot, watch};
use anyhow::{Context, Result};
use shared::types::Record;
use crate::bus::Bus;
use crate::cache::hash;
use crate::config::Config;
use crate::lookup::LookupStats;
use crate::pipeline::{Core, CycleOutcome, ScanPipeline, ScanTuner, SessionStats};
use crate::radio::{Advertisement, ScanDriver, ScanEnd};
use crate::store::{RestartReason, StoreStats};

/// Why the pipeline thread refused a command.
#[derive(Debug, thiserror::Error)]
pub enum CommandError {
    #[error("scanning must be paused first")]
    NotPaused,
    #[error("device store unavailable")]
    StoreUnavailable,
}

/// Commands sent to the pipeline thread
pub enum PipelineCommand {
    Pause(oneshot::Sender<()>),
    Resume(oneshot::Sender<()>),
    Prune(oneshot::Sender<Result<usize, CommandError>>),
    Reset(oneshot::Sender<()>),
    Stats(oneshot::Sender<StatsSnapshot>),
    Devices(oneshot::Sender<Vec<Record>>),
    Samples(usize, oneshot::Sender<Result<Vec<Record>, CommandError>>),
    Shutdown,
}

#[derive(Debug, Clone, Serialize)]
pub struct StatsSnapshot {
    pub paused: bool,
    /// The scan driver has nothing more to deliver
    pub exhausted: bool,
    pub scan_window_secs: u64,
    pub session: SessionStats,
    pub store: StoreStats,
    /// Store writes disabled until the next restart
    pub store_out_of_memory: bool,
    /// Store file quarantined, waiting for the restart
    pub store_corrupted: bool,
    pub vendors: LookupStats,
    pub oui: LookupStats,
    pub devices_cached: usize,
    pub device_capacity: usize,
    pub evictions: u64,
    pub staging_capacity: usize,
}

/// Handle to the thread that owns the pipeline core
#[derive(Clone)]
pub struct PipelineHandle {
    tx: mpsc::Sender<PipelineCommand>,
}

/// State owned by the pipeline thread.
struct Worker {
    config: Config,
    bus: Bus,
    core: Core,
    pipeline: ScanPipeline,
    tuner: ScanTuner,
    driver: Box<dyn ScanDriver>,
    digest_tx: watch::Sender<String>,
    paused: bool,
    exhausted: bool,
}

impl PipelineHandle {
    /// Boot the core and start scanning on a dedicated thread.
    pub fn spawn(
        config: Config,
        bus: Bus,
        driver: Box<dyn ScanDriver>,
        digest_tx: watch::Sender<String>,
    ) -> Result<Self> {
        let (tx, mut rx) = mpsc::channel::<PipelineCommand>(64);

        let core = Core::boot(&config, bus.clone()).context("Failed to boot pipeline core")?;
        let scanner = &config.scanner;
        let tuner = ScanTuner::new(
            scanner.initial_scan(),
            scanner.min_scan(),
            scanner.max_scan(),
            scanner.scan_step(),
        );
        let worker = Worker {
            pipeline: ScanPipeline::new(config.store.prune_every),
            config,
            bus,
            core,
            tuner,
            driver,
            digest_tx,
            paused: false,
            exhausted: false,
        };
        worker.publish_digest();

        thread::Builder::new()
            .name("pipeline".to_string())
            .spawn(move || worker.run(&mut rx))
            .context("Failed to spawn pipeline thread")?;

        Ok(Self { tx })
    }

    pub async fn pause(&self) -> Result<()> {
        let (reply, rx) = oneshot::channel();
        self.tx.send(PipelineCommand::Pause(reply)).await?;
        Ok(rx.await?)
    }

    pub async fn resume(&self) -> Result<()> {
        let (reply, rx) = oneshot::channel();
        self.tx.send(PipelineCommand::Resume(reply)).await?;
        Ok(rx.await?)
    }

    /// Delete uninformative rows now. Returns the number removed.
    pub async fn prune(&self) -> Result<usize> {
        let (reply, rx) = oneshot::channel();
        self.tx.send(PipelineCommand::Prune(reply)).await?;
        Ok(rx.await??)
    }

    /// Wipe the device table and rebuild the core.
    pub async fn reset(&self) -> Result<()> {
        let (reply, rx) = oneshot::channel();
        self.tx.send(PipelineCommand::Reset(reply)).await?;
        Ok(rx.await?)
    }

    pub async fn stats(&self) -> Result<StatsSnapshot> {
        let (reply, rx) = oneshot::channel();
        self.tx.send(PipelineCommand::Stats(reply)).await?;
        Ok(rx.await?)
    }

    /// Contents of the device pool
    pub async fn devices(&self) -> Result<Vec<Record>> {
        let (reply, rx) = oneshot::channel();
        self.tx.send(PipelineCommand::Devices(reply)).await?;
        Ok(rx.await?)
    }

    /// Most recently updated store rows. Only answered while paused.
    pub async fn samples(&self, limit: usize) -> Result<Vec<Record>> {
        let (reply, rx) = oneshot::channel();
        self.tx.send(PipelineCommand::Samples(limit, reply)).await?;
        Ok(rx.await??)
    }

    pub async fn shutdown(&self) -> Result<()> {
        self.tx.send(PipelineCommand::Shutdown).await?;
        Ok(())
    }
}

impl Worker {
    fn run(mut self, rx: &mut mpsc::Receiver<PipelineCommand>) {
        tracing::info!("Pipeline thread started");
        loop {
            if self.drain_commands(rx).is_break() {
                break;
            }
            if self.scan_once().is_break() {
                break;
            }
        }
        self.core.display.status("shutting down");
        tracing::info!("Pipeline thread shutting down");
    }

    /// Handle everything queued. While idle, block until there is a reason
    /// to scan again.
    fn drain_commands(&mut self, rx: &mut mpsc::Receiver<PipelineCommand>) -> ControlFlow<()> {
        loop {
            let command = if self.paused || self.exhausted {
                match rx.blocking_recv() {
                    Some(command) => command,
                    None => return ControlFlow::Break(()),
                }
            } else {
                match rx.try_recv() {
                    Ok(command) => command,
                    Err(TryRecvError::Empty) => return ControlFlow::Continue(()),
                    Err(TryRecvError::Disconnected) => return ControlFlow::Break(()),
                }
            };
            self.handle(command)?;
        }
    }

    fn handle(&mut self, command: PipelineCommand) -> ControlFlow<()> {
        match command {
            PipelineCommand::Pause(reply) => {
                if !self.paused {
                    tracing::info!("Scanning paused");
                    self.core.display.status("paused");
                }
                self.paused = true;
                let _ = reply.send(());
            }
            PipelineCommand::Resume(reply) => {
                if self.paused {
                    tracing::info!("Scanning resumed");
                    self.core.display.status("resumed");
                }
                self.paused = false;
                let _ = reply.send(());
            }
            PipelineCommand::Prune(reply) => {
                let result = self.core.store.prune().ok_or(CommandError::StoreUnavailable);
                self.check_restart()?;
                let _ = reply.send(result);
            }
            PipelineCommand::Reset(reply) => {
                self.core.store.reset();
                self.check_restart()?;
                let _ = reply.send(());
            }
            PipelineCommand::Stats(reply) => {
                let _ = reply.send(self.snapshot());
            }
            PipelineCommand::Devices(reply) => {
                let _ = reply.send(self.core.devices.iter_occupied().cloned().collect());
            }
            PipelineCommand::Samples(limit, reply) => {
                let result = if self.paused {
                    self.core.store.samples(limit).ok_or(CommandError::StoreUnavailable)
                } else {
                    Err(CommandError::NotPaused)
                };
                self.check_restart()?;
                let _ = reply.send(result);
            }
            PipelineCommand::Shutdown => return ControlFlow::Break(()),
        }
        ControlFlow::Continue(())
    }

    /// One scan window followed by one pipeline cycle.
    fn scan_once(&mut self) -> ControlFlow<()> {
        let window = self.tuner.current();
        let Core { staging, clock, .. } = &mut self.core;
        let scanned = self.driver.scan(window, &mut |advert: Advertisement| {
            staging.store(advert, clock.now());
        });

        match scanned {
            Ok(ScanEnd::Completed) => {}
            Ok(ScanEnd::Exhausted) => {
                tracing::info!("Scan driver exhausted, waiting for commands");
                self.exhausted = true;
            }
            Err(e) => {
                tracing::error!("Scan failed: {:#}", e);
                self.core.display.status("scan failed");
                self.exhausted = true;
            }
        }
        if self.exhausted && self.core.staging.is_empty() {
            return ControlFlow::Continue(());
        }

        let capacity = self.core.staging.capacity();
        match self.pipeline.run_cycle(&mut self.core) {
            CycleOutcome::Completed(report) => {
                self.tuner.adjust(report.staged, report.overflowed, capacity);
                self.publish_digest();
                ControlFlow::Continue(())
            }
            CycleOutcome::RestartRequired(reason) => self.restart(reason),
        }
    }

    fn check_restart(&mut self) -> ControlFlow<()> {
        match self.core.store.take_restart() {
            Some(reason) => self.restart(reason),
            None => ControlFlow::Continue(()),
        }
    }

    /// Throw away every in-memory cache and boot a fresh core. Devices
    /// rehydrate from the store as they are sighted again.
    fn restart(&mut self, reason: RestartReason) -> ControlFlow<()> {
        tracing::warn!("Restarting pipeline core ({})", reason);
        let restarts = self.core.stats.restarts + 1;
        match Core::boot(&self.config, self.bus.clone()) {
            Ok(core) => {
                self.core = core;
                self.core.stats.restarts = restarts;
                self.pipeline = ScanPipeline::new(self.config.store.prune_every);
                self.publish_digest();
                ControlFlow::Continue(())
            }
            Err(e) => {
                tracing::error!("Pipeline core failed to boot after restart: {:#}", e);
                ControlFlow::Break(())
            }
        }
    }

    fn publish_digest(&self) {
        let digest = hash::pool_digest(self.core.devices.iter_occupied());
        self.digest_tx.send_if_modified(|current| {
            if *current == digest {
                return false;
            }
            *current = digest;
            true
        });
    }

    fn snapshot(&self) -> StatsSnapshot {
        StatsSnapshot {
            paused: self.paused,
            exhausted: self.exhausted,
            scan_window_secs: self.tuner.current().as_secs(),
            session: self.core.stats,
            store: self.core.store.stats(),
            store_out_of_memory: self.core.store.is_out_of_memory(),
            store_corrupted: self.core.store.is_corrupted(),
            vendors: self.core.vendors.stats(),
            oui: self.core.oui.stats(),
            devices_cached: self.core.devices.occupied(),
            device_capacity: self.core.devices.capacity(),
            evictions: self.core.devices.evictions(),
            staging_capacity: self.core.staging.capacity(),
        }
    }
}
