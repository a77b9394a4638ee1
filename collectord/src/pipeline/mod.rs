//! Post-scan processing.
//!
//! After every completed scan the staged devices go through four phases,
//! strictly in order, each one running its cursor over every staged slot
//! before the next starts:
//!
//! 1. Populate: resolve organization and vendor names in bulk
//! 2. Classify and merge: fold each sighting into the device pool,
//!    rehydrating from the store when the pool has no stored copy
//! 3. Render: hand each record to the display
//! 4. Propagate: insert fresh, non-anonymous devices into the store
//!
//! Nothing carries from one cycle to the next except the device pool and
//! the store.

pub mod stats;
pub mod tuning;

use anyhow::Result;
use shared::types::{CopyMode, FieldValue, MacAddress, Record};
use crate::bus::Bus;
use crate::cache::DevicePool;
use crate::classify::is_anonymous;
use crate::clock::{Clock, SystemClock, UnsetClock};
use crate::config::Config;
use crate::display::{Display, TracingDisplay};
use crate::lookup::{
    needs_resolution, resolve_organization, resolve_vendor, LookupClient, OuiClient, VendorClient,
};
use crate::staging::StagingPool;
use crate::store::{DeviceStore, InsertOutcome, ReferenceTable, RestartReason};

pub use stats::{CycleReport, SessionStats};
pub use tuning::ScanTuner;

/// Everything the pipeline mutates. Owned by exactly one thread; a restart
/// drops the whole value and boots a new one.
pub struct Core {
    pub staging: StagingPool,
    pub devices: DevicePool,
    pub vendors: VendorClient,
    pub oui: OuiClient,
    pub store: DeviceStore,
    pub display: Box<dyn Display>,
    pub clock: Box<dyn Clock>,
    pub stats: SessionStats,
    pub settings: CoreSettings,
}

#[derive(Debug, Clone, Copy)]
pub struct CoreSettings {
    /// Bulk pre-resolution in the Populate phase
    pub auxiliary_memory: bool,
    pub touch_known: bool,
}

impl Core {
    pub fn boot(config: &Config, bus: Bus) -> Result<Self> {
        let capacities = config.cache.capacities();
        tracing::info!(
            "Booting pipeline core: {} device slots, {} staging slots, {} vendor / {} oui cache entries",
            capacities.devices,
            capacities.staging,
            capacities.vendors,
            capacities.oui
        );

        let mut store = DeviceStore::open(&config.store.devices_db, bus.clone())?;
        tracing::info!("Device store at {}", store.path().display());
        let total_entries = store.count().unwrap_or(0);
        if let Some(reason) = store.take_restart() {
            // Already a fresh core; nothing in memory to throw away
            tracing::warn!("Store recovered during boot ({})", reason);
        }

        let vendors = LookupClient::new(
            capacities.vendors,
            Box::new(ReferenceTable::vendors(&config.store.vendors_db, bus.clone())),
            FieldValue::Unknown,
        );
        let oui = LookupClient::new(
            capacities.oui,
            Box::new(ReferenceTable::oui(&config.store.oui_db, bus.clone())),
            FieldValue::Private,
        );
        let clock: Box<dyn Clock> = if config.scanner.use_system_clock {
            Box::new(SystemClock)
        } else {
            Box::new(UnsetClock)
        };

        Ok(Self {
            staging: StagingPool::with_capacity(capacities.staging),
            devices: DevicePool::with_capacity(capacities.devices),
            vendors,
            oui,
            store,
            display: Box::new(TracingDisplay::new(bus)),
            clock,
            stats: SessionStats {
                total_entries,
                ..Default::default()
            },
            settings: CoreSettings {
                auxiliary_memory: config.cache.auxiliary_memory,
                touch_known: config.store.touch_known,
            },
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
    Populate,
    ClassifyMerge,
    Render,
    Propagate,
}

impl Phase {
    pub const ALL: [Phase; 4] = [
        Phase::Populate,
        Phase::ClassifyMerge,
        Phase::Render,
        Phase::Propagate,
    ];

    fn bit(self) -> u8 {
        match self {
            Phase::Populate => 0b0001,
            Phase::ClassifyMerge => 0b0010,
            Phase::Render => 0b0100,
            Phase::Propagate => 0b1000,
        }
    }
}

/// Completion bits for the current cycle.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PhaseFlags(u8);

impl PhaseFlags {
    pub fn set(&mut self, phase: Phase) {
        self.0 |= phase.bit();
    }

    pub fn contains(self, phase: Phase) -> bool {
        self.0 & phase.bit() != 0
    }

    pub fn all_complete(self) -> bool {
        Phase::ALL.iter().all(|p| self.contains(*p))
    }

    pub fn clear(&mut self) {
        self.0 = 0;
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CycleOutcome {
    Completed(CycleReport),
    /// The store gave up; the caller must rebuild the core
    RestartRequired(RestartReason),
}

pub struct ScanPipeline {
    flags: PhaseFlags,
    cycles: u64,
    prune_every: u64,
}

impl ScanPipeline {
    pub fn new(prune_every: u64) -> Self {
        Self {
            flags: PhaseFlags::default(),
            cycles: 0,
            prune_every,
        }
    }

    /// Run all four phases over the staged devices, then empty staging.
    pub fn run_cycle(&mut self, core: &mut Core) -> CycleOutcome {
        let mut report = CycleReport {
            staged: core.staging.len(),
            overflowed: core.staging.overflowed(),
            ..Default::default()
        };

        for phase in Phase::ALL {
            self.run_phase(phase, core, &mut report);
            if let Some(reason) = core.store.take_restart() {
                return self.abandon(core, phase, reason);
            }
        }
        debug_assert!(self.flags.all_complete());
        self.flags.clear();
        core.staging.drain_reset();
        self.cycles += 1;

        if self.prune_every > 0 && self.cycles % self.prune_every == 0 {
            report.pruned = core.store.prune();
            if let Some(reason) = core.store.take_restart() {
                return self.abandon(core, Phase::Propagate, reason);
            }
        }

        core.stats.absorb(&report);
        core.display.status(&format!(
            "scan {}: {} seen, {} new, {} stored, {} total",
            core.stats.scans, report.staged, report.fresh, report.inserted, core.stats.total_entries
        ));
        tracing::debug!(?report, "Cycle complete");
        CycleOutcome::Completed(report)
    }

    /// Drain the cursor over every staged slot for one phase and mark it
    /// complete. Returns the number of slots visited.
    pub fn run_phase(&mut self, phase: Phase, core: &mut Core, report: &mut CycleReport) -> usize {
        let count = core.staging.len();
        let visited = match phase {
            Phase::Populate if !core.settings.auxiliary_memory => 0,
            Phase::Populate => {
                (0..count).for_each(|cursor| populate(core, cursor));
                count
            }
            Phase::ClassifyMerge => {
                (0..count).for_each(|cursor| classify_and_merge(core, cursor, report));
                count
            }
            Phase::Render => {
                (0..count).for_each(|cursor| render(core, cursor));
                count
            }
            Phase::Propagate => {
                (0..count).for_each(|cursor| propagate(core, cursor, report));
                count
            }
        };
        self.flags.set(phase);
        visited
    }

    fn abandon(&mut self, core: &mut Core, phase: Phase, reason: RestartReason) -> CycleOutcome {
        tracing::warn!("Cycle abandoned after {:?}: restart required ({})", phase, reason);
        core.display.status(&format!("store {}: restarting", reason));
        self.flags.clear();
        core.staging.drain_reset();
        CycleOutcome::RestartRequired(reason)
    }
}

fn resolve(oui: &mut OuiClient, vendors: &mut VendorClient, record: &mut Record) {
    if needs_resolution(record) {
        resolve_organization(oui, record);
        resolve_vendor(vendors, record);
    }
}

fn populate(core: &mut Core, cursor: usize) {
    let Core { staging, oui, vendors, .. } = core;
    if let Some(staged) = staging.get_mut(cursor).filter(|r| !r.is_vacant()) {
        resolve(oui, vendors, staged);
    }
}

fn classify_and_merge(core: &mut Core, cursor: usize, report: &mut CycleReport) {
    let Core {
        staging,
        devices,
        vendors,
        oui,
        store,
        settings,
        ..
    } = core;
    let Some(staged) = staging.get_mut(cursor).filter(|r| !r.is_vacant()) else {
        return;
    };
    if !settings.auxiliary_memory {
        resolve(oui, vendors, staged);
    }

    if let Some(slot) = devices.find(&staged.address) {
        report.pool_hits += 1;
        absorb_sighting(devices, slot, staged);
        // Cached while anonymous, so the store was never consulted
        if !staged.in_store && !staged.is_anonymous {
            if let Some(row) = store.lookup(&staged.address) {
                report.store_hits += 1;
                rehydrate(devices, slot, staged, &row);
            }
        }
        return;
    }

    staged.is_anonymous = is_anonymous(staged);
    if staged.is_anonymous {
        staged.in_store = false;
        devices.insert_or_update(staged);
        report.anonymous_new += 1;
    } else if let Some(slot) = store.exists(&staged.address, devices) {
        report.store_hits += 1;
        absorb_sighting(devices, slot, staged);
    } else {
        staged.in_store = false;
        devices.insert_or_update(staged);
        report.fresh += 1;
    }
}

/// Fold one sighting into its pool entry, then bring the staged copy up to
/// date with what the pool knows.
fn absorb_sighting(devices: &mut DevicePool, slot: usize, staged: &mut Record) {
    let Some(entry) = devices.get_mut(slot) else {
        return;
    };
    entry.hits = entry.hits.saturating_add(1);
    if let Err(e) = entry.copy_from(staged, CopyMode::Merge) {
        tracing::error!("Pool slot {}: {}", slot, e);
        return;
    }
    entry.rssi = staged.rssi;
    if staged.updated_at.is_some() {
        entry.updated_at = staged.updated_at;
    }
    entry.is_anonymous = is_anonymous(entry);

    if let Err(e) = staged.copy_from(entry, CopyMode::Merge) {
        tracing::error!("Staged {}: {}", staged.address, e);
    }
    staged.hits = entry.hits;
    staged.in_store = entry.in_store;
    staged.is_anonymous = entry.is_anonymous;
}

/// Fold a stored row into a pool entry that was created without it.
fn rehydrate(devices: &mut DevicePool, slot: usize, staged: &mut Record, row: &Record) {
    let Some(entry) = devices.get_mut(slot) else {
        return;
    };
    entry.hits = entry.hits.max(row.hits.saturating_add(1));
    if let Err(e) = entry.copy_from(row, CopyMode::Merge) {
        tracing::error!("Pool slot {}: {}", slot, e);
        return;
    }
    if let Some(created) = row.created_at {
        entry.created_at = Some(entry.created_at.map_or(created, |c| c.min(created)));
    }
    entry.in_store = true;

    if let Err(e) = staged.copy_from(entry, CopyMode::Merge) {
        tracing::error!("Staged {}: {}", staged.address, e);
    }
    staged.hits = entry.hits;
    staged.in_store = true;
}

fn render(core: &mut Core, cursor: usize) {
    if let Some(staged) = core.staging.get(cursor).filter(|r| !r.is_vacant()) {
        core.display.print_card(staged);
    }
}

fn propagate(core: &mut Core, cursor: usize, report: &mut CycleReport) {
    let Core {
        staging,
        devices,
        store,
        settings,
        ..
    } = core;
    if let Some(staged) = staging.get_mut(cursor).filter(|r| !r.is_vacant()) {
        if staged.is_anonymous {
            report.anonymous_hits += 1;
        } else if staged.in_store {
            report.known += 1;
            if settings.touch_known {
                store.touch(staged);
            }
        } else {
            match store.insert(staged) {
                InsertOutcome::Inserted => {
                    report.inserted += 1;
                    mark_stored(devices, &staged.address);
                }
                InsertOutcome::Refreshed => {
                    report.known += 1;
                    mark_stored(devices, &staged.address);
                }
                InsertOutcome::Rejected(reason) => {
                    report.rejected += 1;
                    tracing::debug!("Not storing {}: {:?}", staged.address, reason);
                }
                InsertOutcome::Failed => {
                    // Retried on the next sighting
                    report.insert_failures += 1;
                    tracing::warn!("Insert of {} failed", staged.address);
                }
            }
        }
    }
    staging.reset_slot(cursor);
}

fn mark_stored(devices: &mut DevicePool, address: &MacAddress) {
    if let Some(entry) = devices.find(address).and_then(|slot| devices.get_mut(slot)) {
        entry.in_store = true;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use shared::types::AddressKind;
    use tempfile::TempDir;
    use crate::bus::new_bus;
    use crate::display::testing::RecordingDisplay;
    use crate::radio::Advertisement;
    use crate::store::reference::testing::write_reference_dbs;

    const HP: MacAddress = MacAddress([0xb4, 0x99, 0xba, 0x01, 0x02, 0x03]);

    struct Fixture {
        _dir: TempDir,
        core: Core,
        display: RecordingDisplay,
    }

    fn fixture(auxiliary_memory: bool) -> Fixture {
        let dir = TempDir::new().unwrap();
        let bus = new_bus();
        let (vendors_path, oui_path) = write_reference_dbs(
            dir.path(),
            &[(6, "Microsoft"), (76, "Apple, Inc.")],
            &[("B499BA", "Hewlett Packard")],
        );
        let store = DeviceStore::open(dir.path().join("blemacs.db"), bus.clone()).unwrap();
        let display = RecordingDisplay::default();
        let core = Core {
            staging: StagingPool::with_capacity(8),
            devices: DevicePool::with_capacity(16),
            vendors: LookupClient::new(
                4,
                Box::new(ReferenceTable::vendors(vendors_path, bus.clone())),
                FieldValue::Unknown,
            ),
            oui: LookupClient::new(
                4,
                Box::new(ReferenceTable::oui(oui_path, bus)),
                FieldValue::Private,
            ),
            store,
            display: Box::new(display.clone()),
            clock: Box::new(UnsetClock),
            stats: SessionStats::default(),
            settings: CoreSettings {
                auxiliary_memory,
                touch_known: true,
            },
        };
        Fixture {
            _dir: dir,
            core,
            display,
        }
    }

    fn advert(address: MacAddress, name: Option<&str>) -> Advertisement {
        Advertisement {
            address,
            kind: AddressKind::Public,
            rssi: -60,
            name: name.map(str::to_string),
            appearance: None,
            manufacturer_data: Some("0600".to_string()),
            service_id: None,
        }
    }

    fn completed(outcome: CycleOutcome) -> CycleReport {
        match outcome {
            CycleOutcome::Completed(report) => report,
            other => panic!("expected a completed cycle, got {:?}", other),
        }
    }

    #[test]
    fn test_phase_flags() {
        let mut flags = PhaseFlags::default();
        flags.set(Phase::Populate);
        flags.set(Phase::Render);
        assert!(flags.contains(Phase::Render));
        assert!(!flags.contains(Phase::Propagate));
        assert!(!flags.all_complete());

        Phase::ALL.into_iter().for_each(|p| flags.set(p));
        assert!(flags.all_complete());
        flags.clear();
        assert_eq!(flags, PhaseFlags::default());
    }

    #[test]
    fn test_store_hit_is_rehydrated_and_not_reinserted() {
        let mut fx = fixture(true);
        let mut known = Record::new(HP);
        known.name = FieldValue::text("LaserJet");
        known.organization = FieldValue::text("Hewlett Packard");
        known.vendor = FieldValue::text("Microsoft");
        known.hits = 5;
        assert_eq!(fx.core.store.insert(&mut known), InsertOutcome::Inserted);

        fx.core.staging.store(advert(HP, None), Some(Utc::now()));
        let mut pipeline = ScanPipeline::new(0);
        let report = completed(pipeline.run_cycle(&mut fx.core));

        assert_eq!(report.store_hits, 1);
        assert_eq!(report.inserted, 0);
        assert_eq!(report.known, 1);

        let slot = fx.core.devices.find(&HP).unwrap();
        let entry = fx.core.devices.get(slot).unwrap();
        assert_eq!(entry.hits, 6);
        assert!(entry.in_store);
        assert_eq!(entry.name.as_str(), "LaserJet");

        assert_eq!(fx.core.store.count(), Some(1));
        assert_eq!(fx.core.store.stats().inserts, 1);
        assert_eq!(fx.core.store.lookup(&HP).unwrap().hits, 6);
    }

    #[test]
    fn test_fresh_device_is_inserted_once() {
        let mut fx = fixture(true);
        let mut pipeline = ScanPipeline::new(0);

        fx.core.staging.store(advert(HP, Some("LaserJet")), None);
        let report = completed(pipeline.run_cycle(&mut fx.core));
        assert_eq!(report.fresh, 1);
        assert_eq!(report.inserted, 1);
        assert_eq!(fx.core.stats.total_entries, 1);

        let slot = fx.core.devices.find(&HP).unwrap();
        assert!(fx.core.devices.get(slot).unwrap().in_store);

        // next sighting is a pool hit
        fx.core.staging.store(advert(HP, None), None);
        let report = completed(pipeline.run_cycle(&mut fx.core));
        assert_eq!(report.pool_hits, 1);
        assert_eq!(report.inserted, 0);
        assert_eq!(fx.core.store.stats().inserts, 1);
        assert_eq!(fx.core.store.count(), Some(1));
        assert_eq!(fx.core.devices.get(slot).unwrap().hits, 2);
    }

    #[test]
    fn test_anonymous_device_stays_in_pool_only() {
        let mut fx = fixture(true);
        let random = MacAddress([0x4a, 0x11, 0x22, 0x33, 0x44, 0x55]);
        let mut sighting = advert(random, None);
        sighting.kind = AddressKind::Random;
        sighting.manufacturer_data = Some("4c0010".to_string());
        fx.core.staging.store(sighting, None);

        let report = completed(ScanPipeline::new(0).run_cycle(&mut fx.core));
        assert_eq!(report.anonymous_new, 1);
        assert_eq!(report.anonymous_hits, 1);
        assert_eq!(report.fresh, 0);

        let slot = fx.core.devices.find(&random).unwrap();
        let entry = fx.core.devices.get(slot).unwrap();
        assert!(entry.is_anonymous);
        assert!(!entry.in_store);
        assert_eq!(entry.organization, FieldValue::Random);
        assert_eq!(entry.vendor.as_str(), "Apple, Inc.");
        assert_eq!(fx.core.store.count(), Some(0));
    }

    #[test]
    fn test_anonymous_first_sighting_keeps_stored_hits() {
        let mut fx = fixture(true);
        let mut known = Record::new(HP);
        known.organization = FieldValue::text("Hewlett Packard");
        known.vendor = FieldValue::text("Microsoft");
        known.hits = 50;
        assert_eq!(fx.core.store.insert(&mut known), InsertOutcome::Inserted);
        fx.core.stats.total_entries = 1;
        let mut pipeline = ScanPipeline::new(0);

        // no name and no manufacturer data: anonymous, cached without a store lookup
        let mut bare = advert(HP, None);
        bare.manufacturer_data = None;
        fx.core.staging.store(bare.clone(), None);
        let report = completed(pipeline.run_cycle(&mut fx.core));
        assert_eq!(report.anonymous_new, 1);
        assert_eq!(report.store_hits, 0);

        let mut named = bare;
        named.name = Some("LaserJet".to_string());
        fx.core.staging.store(named, None);
        let report = completed(pipeline.run_cycle(&mut fx.core));
        assert_eq!(report.pool_hits, 1);
        assert_eq!(report.store_hits, 1);
        assert_eq!(report.inserted, 0);
        assert_eq!(report.known, 1);

        let slot = fx.core.devices.find(&HP).unwrap();
        let entry = fx.core.devices.get(slot).unwrap();
        assert!(entry.in_store);
        assert_eq!(entry.hits, 51);

        assert_eq!(fx.core.store.lookup(&HP).unwrap().hits, 51);
        assert_eq!(fx.core.store.stats().inserts, 1);
        assert_eq!(fx.core.stats.total_entries, 1);
    }

    #[test]
    fn test_render_paints_each_staged_record() {
        let mut fx = fixture(true);
        fx.core.staging.store(advert(HP, Some("LaserJet")), None);
        fx.core
            .staging
            .store(advert(MacAddress([0xb4, 0x99, 0xba, 9, 9, 9]), Some("OfficeJet")), None);

        completed(ScanPipeline::new(0).run_cycle(&mut fx.core));

        let cards = fx.display.cards.lock();
        assert_eq!(cards.len(), 2);
        assert!(cards.iter().all(|c| c.organization.as_str() == "Hewlett Packard"));
        assert!(cards.iter().all(|c| c.vendor.as_str() == "Microsoft"));
        assert_eq!(fx.display.lines.lock().len(), 1);
    }

    #[test]
    fn test_without_aux_memory_resolution_is_deferred() {
        let mut fx = fixture(false);
        fx.core.staging.store(advert(HP, Some("LaserJet")), None);

        let mut pipeline = ScanPipeline::new(0);
        let mut report = CycleReport::default();
        assert_eq!(pipeline.run_phase(Phase::Populate, &mut fx.core, &mut report), 0);
        assert!(pipeline.flags.contains(Phase::Populate));
        let staged = fx.core.staging.get(0).unwrap();
        assert_eq!(staged.organization, FieldValue::Unpopulated);

        pipeline.run_phase(Phase::ClassifyMerge, &mut fx.core, &mut report);
        let staged = fx.core.staging.get(0).unwrap();
        assert_eq!(staged.organization.as_str(), "Hewlett Packard");
        assert_eq!(report.fresh, 1);
    }

    #[test]
    fn test_staging_is_drained_after_cycle() {
        let mut fx = fixture(true);
        let mut pipeline = ScanPipeline::new(0);
        for last in 0..12u8 {
            fx.core
                .staging
                .store(advert(MacAddress([0xb4, 0x99, 0xba, 0, 1, last]), Some("Tag")), None);
        }
        let report = completed(pipeline.run_cycle(&mut fx.core));

        assert_eq!(report.staged, 8);
        assert_eq!(report.overflowed, 4);
        assert!(fx.core.staging.is_empty());
        assert_eq!(fx.core.staging.overflowed(), 0);
        assert_eq!(pipeline.flags, PhaseFlags::default());
        assert_eq!(fx.core.stats.overflowed, 4);
    }

    #[test]
    fn test_malformed_store_requires_restart() {
        let mut fx = fixture(true);
        std::fs::write(fx.core.store.path(), vec![b'x'; 4096]).unwrap();
        fx.core.staging.store(advert(HP, Some("LaserJet")), None);

        let outcome = ScanPipeline::new(0).run_cycle(&mut fx.core);
        assert_eq!(outcome, CycleOutcome::RestartRequired(RestartReason::Malformed));
        assert!(fx.core.staging.is_empty());
        assert_eq!(fx.core.store.stats().resets, 1);
    }

    #[test]
    fn test_prune_runs_on_schedule() {
        let mut fx = fixture(true);
        let mut pipeline = ScanPipeline::new(2);

        let first = completed(pipeline.run_cycle(&mut fx.core));
        assert_eq!(first.pruned, None);
        let second = completed(pipeline.run_cycle(&mut fx.core));
        assert_eq!(second.pruned, Some(0));
    }
}
