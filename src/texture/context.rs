//! State shared by the loader threads, the swap table builder and the per-frame hook.
//!
//! A `PipelineContext` is created when the plugin is enabled and dropped when it is disabled.
//! Nothing in here is global, so tests can run several pipelines side by side.

use std::sync::{
    atomic::{AtomicUsize, Ordering},
    Arc,
};

use parking_lot::{Mutex, MutexGuard, RwLock};

use super::{
    bridge::IdentifierBridge,
    sources::KnownTextures,
    store::TextureStore,
    swap_table::{BuildStats, SwapTable},
};
use crate::device::Device;

/// Completion counters for one kind of load.
#[derive(Default, Debug)]
pub struct Progress {
    total: AtomicUsize,
    finished: AtomicUsize,
    failed: AtomicUsize,

    /// Jobs whose follow-up work (such as a swap table rebuild) is also done.
    settled: AtomicUsize,
}

impl Progress {
    /// Adds a batch of `count` jobs to the target. Must be called before the jobs are queued.
    pub fn add_total(&self, count: usize) {
        self.total.fetch_add(count, Ordering::SeqCst);
    }

    /// Records one finished job. Returns `true` for the job that brought the finished count up to
    /// the total.
    pub fn record(&self, success: bool) -> bool {
        // `failed` never runs ahead of `finished`.
        let finished = self.finished.fetch_add(1, Ordering::SeqCst) + 1;

        if !success {
            self.failed.fetch_add(1, Ordering::SeqCst);
        }

        finished == self.total.load(Ordering::SeqCst)
    }

    pub fn total(&self) -> usize {
        self.total.load(Ordering::SeqCst)
    }

    /// Jobs that have finished, successfully or not.
    pub fn finished(&self) -> usize {
        self.finished.load(Ordering::SeqCst)
    }

    pub fn failed(&self) -> usize {
        self.failed.load(Ordering::SeqCst)
    }

    pub fn succeeded(&self) -> usize {
        let failed = self.failed();
        self.finished().saturating_sub(failed)
    }

    pub fn is_complete(&self) -> bool {
        self.finished() >= self.total()
    }

    /// Marks one finished job as fully handled.
    pub fn settle(&self) {
        self.settled.fetch_add(1, Ordering::SeqCst);
    }

    /// Returns `true` once every job has finished and been settled.
    pub fn is_settled(&self) -> bool {
        self.settled.load(Ordering::SeqCst) >= self.total()
    }
}

/// The device that textures are decoded with. It can be replaced at any time, so workers take a
/// reference for each job rather than holding on to it.
#[derive(Default)]
pub struct DeviceSlot {
    device: RwLock<Option<Arc<dyn Device>>>,
}

/// A reference to the device that lasts for one job.
pub struct DeviceRef(Arc<dyn Device>);

impl std::ops::Deref for DeviceRef {
    type Target = dyn Device;

    fn deref(&self) -> &Self::Target {
        &*self.0
    }
}

impl Drop for DeviceRef {
    fn drop(&mut self) {
        self.0.release();
    }
}

impl DeviceSlot {
    /// Stores `device`, taking a reference to it. Any previous device is released.
    pub fn set(&self, device: Arc<dyn Device>) {
        device.add_ref();

        if let Some(old) = self.device.write().replace(device) {
            old.release();
        }
    }

    /// Takes a reference to the current device, if there is one.
    pub fn acquire(&self) -> Option<DeviceRef> {
        let device = self.device.read().clone()?;
        device.add_ref();
        Some(DeviceRef(device))
    }

    /// Releases the stored device.
    pub fn clear(&self) {
        if let Some(old) = self.device.write().take() {
            old.release();
        }
    }

    pub fn is_set(&self) -> bool {
        self.device.read().is_some()
    }
}

pub struct PipelineContext {
    pub store: TextureStore,
    pub bridge: IdentifierBridge,
    pub swap_table: SwapTable,
    pub device: DeviceSlot,

    /// Counts every load job.
    pub overall: Progress,

    /// Counts only jobs for archive entries.
    pub archives: Progress,

    known: Arc<KnownTextures>,

    /// Held around every call into the device's image decoder.
    decode_lock: Mutex<()>,

    /// Keeps rebuilds from overlapping. The swap table has its own lock for readers.
    rebuild_lock: Mutex<()>,
}

impl PipelineContext {
    pub fn new(known: KnownTextures) -> PipelineContext {
        PipelineContext {
            store: TextureStore::new(),
            bridge: IdentifierBridge::new(),
            swap_table: SwapTable::new(),
            device: DeviceSlot::default(),
            overall: Progress::default(),
            archives: Progress::default(),
            known: Arc::new(known),
            decode_lock: Mutex::new(()),
            rebuild_lock: Mutex::new(()),
        }
    }

    pub fn known_textures(&self) -> Arc<KnownTextures> {
        self.known.clone()
    }

    pub(crate) fn lock_decoder(&self) -> MutexGuard<'_, ()> {
        self.decode_lock.lock()
    }

    /// Builds a new swap table from the store and bridge and installs it unless it came out
    /// empty. Concurrent calls run one after the other.
    pub fn rebuild_swap_table(&self) -> BuildStats {
        let _rebuilding = self.rebuild_lock.lock();
        let known = self.known_textures();

        self.swap_table.rebuild(&self.store, &self.bridge, &known)
    }

    /// Gives back every texture reference held by the swap table and the store.
    pub fn release_textures(&self) {
        let from_table = self.swap_table.release_all();
        let from_store = self.store.release_textures();

        log::info!(
            "Released {} swap table and {} store texture references",
            from_table,
            from_store
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::MockDevice;

    #[test]
    fn only_the_last_completion_triggers() {
        let progress = Progress::default();
        progress.add_total(3);

        assert!(!progress.record(true));
        assert!(!progress.record(false));
        assert!(progress.record(true));

        assert_eq!(progress.succeeded(), 2);
        assert_eq!(progress.failed(), 1);
        assert!(progress.is_complete());
        assert!(!progress.is_settled());

        (0..3).for_each(|_| progress.settle());
        assert!(progress.is_settled());
    }

    #[test]
    fn later_batches_extend_the_target() {
        let progress = Progress::default();

        progress.add_total(1);
        assert!(progress.record(true));

        progress.add_total(2);
        assert!(!progress.is_complete());
        assert!(!progress.record(true));
        assert!(progress.record(true));
    }

    #[test]
    fn succeeded_stays_in_range_while_jobs_finish() {
        const JOBS: usize = 200_000;

        let progress = Arc::new(Progress::default());
        progress.add_total(JOBS);

        let recorder = {
            let progress = progress.clone();
            std::thread::spawn(move || {
                for _ in 0..JOBS {
                    progress.record(false);
                }
            })
        };

        while !progress.is_complete() {
            assert!(progress.succeeded() <= progress.finished());
        }

        recorder.join().unwrap();

        assert_eq!(progress.succeeded(), 0);
        assert_eq!(progress.failed(), JOBS);
    }

    #[test]
    fn device_references_are_balanced() {
        let device = Arc::new(MockDevice::new());
        let slot = DeviceSlot::default();

        assert!(slot.acquire().is_none());

        slot.set(device.clone());
        assert_eq!(device.ref_count(), 2);

        {
            let _job = slot.acquire().unwrap();
            assert_eq!(device.ref_count(), 3);
        }

        assert_eq!(device.ref_count(), 2);

        slot.clear();
        assert_eq!(device.ref_count(), 1);
        assert!(!slot.is_set());
    }
}
