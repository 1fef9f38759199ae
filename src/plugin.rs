//! The texture replacer as the game sees it: two hooks, a device to load with, and a clean way to
//! turn it all off again.

use std::{
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc,
    },
    time::Duration,
};

use eyre::{Context, Result};
use parking_lot::Mutex;

use crate::{
    device::{Device, MaterialParameterSetter, RenderContext},
    hook::{Hook, HookInstaller},
    settings::{LoadStrategy, Options},
    texture::{
        archive,
        context::PipelineContext,
        pipeline::{worker_count, LoadPipeline},
        sources::{find_archives, scan_loose_textures, scan_texture_packs, KnownTextures},
        ApplyStats, PathRegistration, SwapApplier,
    },
};

/// Signature of both hook replacements.
pub type HookFn = extern "C" fn();

/// The functions that the two game hooks jump to.
#[derive(Clone, Copy)]
pub struct HookEntries {
    /// Runs when the game loads its graphics settings.
    pub load: HookFn,

    /// Runs when the game sets up a material for drawing.
    pub frame: HookFn,
}

/// How long `Blocking` loading waits before giving up and letting the game continue.
const BLOCKING_LOAD_TIMEOUT: Duration = Duration::from_secs(600);

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct Stats {
    pub frames: u64,
    pub swaps: u64,
    pub loaded: usize,
    pub failed: usize,
    pub total: usize,
    pub textures: usize,
    pub swap_table_entries: usize,
}

pub struct TextureReplacer {
    options: Options,
    installer: Arc<dyn HookInstaller>,
    load_hook: Hook<HookFn>,
    frame_hook: Hook<HookFn>,
    context: Arc<PipelineContext>,
    pipeline: Mutex<Option<LoadPipeline>>,
    applier: Mutex<SwapApplier>,

    /// Files found by the last path scan, waiting for a device to load them with.
    registrations: Mutex<Vec<PathRegistration>>,

    paths_loaded: AtomicBool,
    loads_posted: AtomicBool,
    shutting_down: AtomicBool,
}

impl TextureReplacer {
    /// Finds replacement files, hooks the game and starts the loader threads. Textures aren't
    /// loaded until a device is attached.
    pub fn enable(
        options: Options,
        installer: Arc<dyn HookInstaller>,
        entries: HookEntries,
    ) -> Result<TextureReplacer> {
        log::info!("Enabling texture replacement");

        let known = KnownTextures::load(&options.known_textures_file).unwrap_or_else(|err| {
            log::error!("{:?}", err);
            KnownTextures::default()
        });

        let context = Arc::new(PipelineContext::new(known));
        context.bridge.load(options.bridge_cache_file.as_deref());

        let replacer = TextureReplacer {
            load_hook: Hook::new(options.host.load_hook),
            frame_hook: Hook::new(options.host.frame_hook),
            options,
            installer,
            context,
            pipeline: Mutex::new(None),
            applier: Mutex::new(SwapApplier::new()),
            registrations: Mutex::new(Vec::new()),
            paths_loaded: AtomicBool::new(false),
            loads_posted: AtomicBool::new(false),
            shutting_down: AtomicBool::new(false),
        };

        replacer.reload_paths();

        if let Err(err) = replacer.start(entries) {
            replacer.remove_hooks();
            return Err(err);
        }

        Ok(replacer)
    }

    fn start(&self, entries: HookEntries) -> Result<()> {
        self.load_hook
            .install(&*self.installer, entries.load)
            .wrap_err("unable to hook settings load")?;

        self.frame_hook
            .install(&*self.installer, entries.frame)
            .wrap_err("unable to hook material setup")?;

        let threads = worker_count(self.options.worker_threads);
        let pipeline = LoadPipeline::start(self.context.clone(), threads)?;

        *self.pipeline.lock() = Some(pipeline);
        Ok(())
    }

    fn remove_hooks(&self) {
        for hook in [&self.load_hook, &self.frame_hook] {
            if !hook.is_installed() {
                continue;
            }

            if let Err(err) = hook.remove(&*self.installer) {
                log::error!("{}", err);
            }
        }
    }

    pub fn context(&self) -> &Arc<PipelineContext> {
        &self.context
    }

    pub fn options(&self) -> &Options {
        &self.options
    }

    /// The game's own implementation of the settings load function.
    pub fn original_load(&self) -> Option<HookFn> {
        self.load_hook.original()
    }

    /// The game's own code at the material hook.
    pub fn original_frame(&self) -> Option<HookFn> {
        self.frame_hook.original()
    }

    /// Scans the texture pack and loose texture folders and registers every file found. Only the
    /// first call after enabling does anything. Returns `true` if a scan happened.
    pub fn reload_paths(&self) -> bool {
        if self.paths_loaded.swap(true, Ordering::SeqCst) {
            log::debug!("Texture paths are already loaded");
            return false;
        }

        let (mut registrations, errors) = scan_texture_packs(&self.options.texture_packs_dir);

        for err in errors {
            log::warn!("{:?}", err);
        }

        let pack_count = registrations.len();

        if self.options.loose_textures_dir.is_dir() {
            registrations.extend(scan_loose_textures(&self.options.loose_textures_dir));
        }

        for registration in &registrations {
            self.context
                .store
                .add_path(registration.id, registration.path.clone());
        }

        log::info!(
            "Registered {} texture paths ({} from packs, {} loose)",
            registrations.len(),
            pack_count,
            registrations.len() - pack_count
        );

        *self.registrations.lock() = registrations;
        true
    }

    /// Gives the loader a device and, the first time, queues everything that was found: the
    /// registered files and the contents of every archive. Returns the number of loads queued.
    ///
    /// With `LoadStrategy::Blocking` this doesn't return until the loads are done.
    pub fn attach_device(&self, device: Arc<dyn Device>) -> usize {
        self.context.device.set(device);

        if self.loads_posted.swap(true, Ordering::SeqCst) {
            log::info!("Device replaced");
            return 0;
        }

        let pipeline = self.pipeline.lock();

        let Some(pipeline) = pipeline.as_ref() else {
            log::warn!("Device attached while the loader isn't running");
            return 0;
        };

        let mut posted = pipeline.post_files(self.registrations.lock().clone());

        let archives = if self.options.archives_dir.is_dir() {
            find_archives(&self.options.archives_dir)
        } else {
            vec![]
        };

        for path in archives {
            let mut entries = vec![];

            match archive::extract(&path, &self.context.bridge, |entry| entries.push(entry)) {
                Ok(summary) => log::info!("Extracted {:?}: {:?}", path, summary),
                Err(err) => {
                    log::error!("Unable to extract {:?}: {}", path, err);
                    continue;
                }
            }

            posted += pipeline.post_archive_entries(entries);
        }

        if self.options.load_strategy == LoadStrategy::Blocking
            && !pipeline.wait_until_idle(BLOCKING_LOAD_TIMEOUT)
        {
            log::warn!("Gave up waiting for textures to load; the rest will load in the background");
        }

        posted
    }

    /// Waits for every queued load to finish. Returns `false` on timeout or if the loader isn't
    /// running.
    pub fn wait_until_loaded(&self, timeout: Duration) -> bool {
        self.pipeline
            .lock()
            .as_ref()
            .map_or(false, |pipeline| pipeline.wait_until_idle(timeout))
    }

    /// The material hook's body. Returns the number of slots swapped.
    pub fn on_frame(&self, render: &dyn RenderContext, setter: &dyn MaterialParameterSetter) -> usize {
        if !self.paths_loaded.load(Ordering::SeqCst) {
            return 0;
        }

        self.applier.lock().apply(&self.context, render, setter)
    }

    /// Marks the process as exiting. `disable` will then leave every texture and the device
    /// alone, since they may already have been destroyed.
    pub fn set_shutting_down(&self) {
        self.shutting_down.store(true, Ordering::SeqCst);
    }

    /// Stops loading, removes the hooks and gives back every texture reference.
    pub fn disable(&self) {
        let shutting_down = self.shutting_down.load(Ordering::SeqCst);

        if let Some(pipeline) = self.pipeline.lock().take() {
            if shutting_down {
                pipeline.stop();
            } else {
                pipeline.shutdown();
            }
        }

        self.remove_hooks();

        if shutting_down {
            log::info!("Process is exiting; not releasing textures");
            return;
        }

        self.applier.lock().release();
        self.context.release_textures();
        self.context.store.clear_paths();
        self.registrations.lock().clear();

        self.paths_loaded.store(false, Ordering::SeqCst);
        self.loads_posted.store(false, Ordering::SeqCst);

        log::info!("Texture replacement disabled");
    }

    pub fn stats(&self) -> Stats {
        let ApplyStats { frames, swaps } = self.applier.lock().stats();
        let overall = &self.context.overall;

        Stats {
            frames,
            swaps,
            loaded: overall.succeeded(),
            failed: overall.failed(),
            total: overall.total(),
            textures: self.context.store.count_textures(),
            swap_table_entries: self.context.swap_table.len(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        device::Slot,
        testing::{MockDevice, MockHookInstaller, MockRenderContext, RecordingSetter},
    };
    use std::path::Path;

    extern "C" fn entry() {}

    const ENTRIES: HookEntries = HookEntries {
        load: entry,
        frame: entry,
    };

    fn options_in(dir: &Path) -> Options {
        Options {
            texture_packs_dir: dir.join("packs"),
            loose_textures_dir: dir.join("loose"),
            archives_dir: dir.join("archives"),
            bridge_cache_file: None,
            known_textures_file: dir.join("known.txt"),
            log_file: dir.join("texswap.log"),
            worker_threads: Some(2),
            ..Options::default()
        }
    }

    #[test]
    fn enable_hooks_and_disable_unhooks() {
        let dir = tempfile::tempdir().unwrap();
        let installer = Arc::new(MockHookInstaller::default());

        let replacer =
            TextureReplacer::enable(options_in(dir.path()), installer.clone(), ENTRIES).unwrap();

        assert_eq!(installer.hooked_count(), 2);
        assert!(replacer.original_load().is_some());

        replacer.disable();
        assert_eq!(installer.hooked_count(), 0);
    }

    #[test]
    fn a_failed_hook_undoes_the_other() {
        let dir = tempfile::tempdir().unwrap();
        let options = options_in(dir.path());

        let installer = Arc::new(MockHookInstaller::default());
        installer.fail_on(options.host.frame_hook);

        assert!(TextureReplacer::enable(options, installer.clone(), ENTRIES).is_err());
        assert_eq!(installer.hooked_count(), 0);
    }

    #[test]
    fn paths_are_only_scanned_once() {
        let dir = tempfile::tempdir().unwrap();
        let loose = dir.path().join("loose");
        std::fs::create_dir_all(&loose).unwrap();
        std::fs::write(loose.join("0x00001111.dds"), b"one").unwrap();

        let replacer = TextureReplacer::enable(
            options_in(dir.path()),
            Arc::new(MockHookInstaller::default()),
            ENTRIES,
        )
        .unwrap();

        assert_eq!(replacer.context().store.count_paths(), 1);
        assert!(!replacer.reload_paths());
        assert_eq!(replacer.context().store.count_paths(), 1);

        replacer.disable();
    }

    #[test]
    fn loads_and_swaps_loose_textures() {
        let dir = tempfile::tempdir().unwrap();
        let loose = dir.path().join("loose");
        std::fs::create_dir_all(&loose).unwrap();
        std::fs::write(loose.join("0x00001111.dds"), b"texture bytes").unwrap();
        std::fs::write(dir.path().join("known.txt"), "0x00001111\n").unwrap();

        let mut options = options_in(dir.path());
        options.load_strategy = LoadStrategy::Blocking;

        let replacer =
            TextureReplacer::enable(options, Arc::new(MockHookInstaller::default()), ENTRIES)
                .unwrap();

        let device = Arc::new(MockDevice::new());
        assert_eq!(replacer.attach_device(device.clone()), 1);

        let stats = replacer.stats();
        assert_eq!(stats.loaded, 1);
        assert_eq!(stats.swap_table_entries, 1);

        let mut render = MockRenderContext::with_material();
        render.set_slot(Slot::Diffuse, 0x1111);

        let setter = RecordingSetter::default();
        assert_eq!(replacer.on_frame(&render, &setter), 1);

        let loaded = device.decoded().pop().unwrap();

        // Store, swap table and the diffuse slot. The decoder's own reference was given back.
        assert_eq!(loaded.ref_count(), 3);

        replacer.disable();
        assert_eq!(loaded.ref_count(), 0);
        assert_eq!(device.ref_count(), 1);
    }

    #[test]
    fn shutting_down_leaves_references_alone() {
        let dir = tempfile::tempdir().unwrap();
        let loose = dir.path().join("loose");
        std::fs::create_dir_all(&loose).unwrap();
        std::fs::write(loose.join("0x00002222.dds"), b"texture bytes").unwrap();

        let installer = Arc::new(MockHookInstaller::default());
        let replacer =
            TextureReplacer::enable(options_in(dir.path()), installer.clone(), ENTRIES).unwrap();

        let device = Arc::new(MockDevice::new());
        replacer.attach_device(device.clone());
        assert!(replacer.wait_until_loaded(Duration::from_secs(10)));

        let loaded = device.decoded().pop().unwrap();
        let before = loaded.ref_count();

        replacer.set_shutting_down();
        replacer.disable();

        assert_eq!(installer.hooked_count(), 0);
        assert_eq!(loaded.ref_count(), before);
        assert_eq!(device.ref_count(), 2);
    }
}
