//! Background texture loading.
//!
//! A fixed pool of worker threads takes load jobs from a shared queue, decodes them through the
//! device and publishes the results in the texture store. When a batch of jobs has finished, the
//! swap table is rebuilt so the per-frame hook starts using the new textures.

use std::{
    path::PathBuf,
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc,
    },
    thread::JoinHandle,
    time::{Duration, Instant},
};

use crossbeam_channel::{Receiver, RecvTimeoutError, Sender};
use eyre::{Context, Result};

use super::{
    archive::ArchiveEntry,
    context::PipelineContext,
    hash::{texture_content_hash, TextureId},
    sources::{PathRegistration, TextureKind},
};

/// How long an idle worker waits before checking whether it should stop.
const POLL_INTERVAL: Duration = Duration::from_millis(500);

const MIN_WORKERS: usize = 2;
const MAX_WORKERS: usize = 16;

/// A texture to load.
#[derive(Debug)]
pub enum LoadRequest {
    /// A file on disk, loaded under its registered identifier.
    File {
        id: TextureId,
        path: PathBuf,
        kind: TextureKind,
    },

    /// An image extracted from an archive, loaded under its content hash and every name the
    /// bridge associates with it.
    Memory {
        content_hash: TextureId,
        file_name: String,
        bytes: Vec<u8>,
    },
}

impl LoadRequest {
    fn from_archive(entry: ArchiveEntry) -> LoadRequest {
        LoadRequest::Memory {
            content_hash: entry.content_hash,
            file_name: entry.file_name,
            bytes: entry.bytes,
        }
    }

    fn is_archive(&self) -> bool {
        matches!(self, LoadRequest::Memory { .. })
    }

    /// Short description for logging. The derived `Debug` output would include the image bytes.
    fn describe(&self) -> String {
        match self {
            LoadRequest::File { id, path, .. } => format!("{:#010x} from {:?}", id, path),
            LoadRequest::Memory {
                content_hash,
                file_name,
                ..
            } => format!("{:#010x} from archive image {}", content_hash, file_name),
        }
    }
}

enum Job {
    Load(LoadRequest),

    /// Does nothing, but gets a blocked worker to check the stop flag.
    Wake,
}

/// Picks a worker count from the number of CPUs, or from an explicit override. Either way the
/// result is kept between 2 and 16.
pub fn worker_count(requested: Option<usize>) -> usize {
    let wanted = requested.unwrap_or_else(|| {
        std::thread::available_parallelism()
            .map(|count| count.get())
            .unwrap_or(MIN_WORKERS)
    });

    wanted.clamp(MIN_WORKERS, MAX_WORKERS)
}

/// The worker pool.
pub struct LoadPipeline {
    context: Arc<PipelineContext>,
    sender: Sender<Job>,
    stop: Arc<AtomicBool>,
    workers: Vec<JoinHandle<()>>,
}

impl LoadPipeline {
    /// Starts `threads` workers. If any thread fails to start, the ones that did are stopped again
    /// and the error is returned.
    pub fn start(context: Arc<PipelineContext>, threads: usize) -> Result<LoadPipeline> {
        let (sender, receiver) = crossbeam_channel::unbounded();
        let stop = Arc::new(AtomicBool::new(false));

        let mut pipeline = LoadPipeline {
            context,
            sender,
            stop,
            workers: Vec::with_capacity(threads),
        };

        for index in 0..threads {
            let worker = Worker {
                context: pipeline.context.clone(),
                receiver: receiver.clone(),
                stop: pipeline.stop.clone(),
            };

            let spawned = std::thread::Builder::new()
                .name(format!("texture-loader-{}", index))
                .spawn(move || worker.run())
                .wrap_err_with(|| format!("unable to start loader thread {}", index));

            match spawned {
                Ok(handle) => pipeline.workers.push(handle),
                Err(err) => {
                    pipeline.stop_workers();
                    return Err(err);
                }
            }
        }

        log::info!("Started {} texture loader threads", threads);
        Ok(pipeline)
    }

    pub fn context(&self) -> &Arc<PipelineContext> {
        &self.context
    }

    pub fn worker_count(&self) -> usize {
        self.workers.len()
    }

    /// Queues a load for every registration. Returns the number queued.
    pub fn post_files(&self, registrations: impl IntoIterator<Item = PathRegistration>) -> usize {
        let requests = registrations
            .into_iter()
            .map(|registration| LoadRequest::File {
                id: registration.id,
                path: registration.path,
                kind: registration.kind,
            })
            .collect();

        self.post(requests)
    }

    /// Queues a load for every extracted archive image. Returns the number queued.
    pub fn post_archive_entries(&self, entries: impl IntoIterator<Item = ArchiveEntry>) -> usize {
        self.post(entries.into_iter().map(LoadRequest::from_archive).collect())
    }

    /// Queues a batch. Progress targets are raised for the whole batch before the first job is
    /// sent, so a fast worker can't see a finished batch early.
    pub fn post(&self, requests: Vec<LoadRequest>) -> usize {
        if requests.is_empty() {
            return 0;
        }

        let archive_count = requests.iter().filter(|request| request.is_archive()).count();

        self.context.overall.add_total(requests.len());
        self.context.archives.add_total(archive_count);

        let count = requests.len();

        for request in requests {
            // The receiver lives in the workers, which only exit after `stop_workers`.
            if self.sender.send(Job::Load(request)).is_err() {
                log::error!("Load queue is closed; dropping request");
            }
        }

        log::info!("Queued {} texture loads ({} from archives)", count, archive_count);
        count
    }

    /// Blocks until every queued load has finished and any rebuild it triggered is done, or until
    /// `timeout` passes. Returns `true` if everything finished.
    pub fn wait_until_idle(&self, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;

        while !self.context.overall.is_settled() {
            if Instant::now() >= deadline {
                return false;
            }

            std::thread::sleep(Duration::from_millis(5));
        }

        true
    }

    fn stop_workers(&mut self) {
        self.stop.store(true, Ordering::SeqCst);

        for _ in 0..self.workers.len() {
            let _ = self.sender.send(Job::Wake);
        }

        for worker in self.workers.drain(..) {
            if worker.join().is_err() {
                log::error!("A texture loader thread panicked");
            }
        }
    }

    /// Stops the workers and waits for them to exit. Jobs that are already running are allowed to
    /// finish; queued jobs are dropped. The device is left as it is.
    pub fn stop(mut self) {
        self.stop_workers();
        log::info!("Texture loader stopped");
    }

    /// Stops the workers, then lets go of the device.
    pub fn shutdown(self) {
        let context = self.context.clone();

        self.stop();
        context.device.clear();
    }
}

struct Worker {
    context: Arc<PipelineContext>,
    receiver: Receiver<Job>,
    stop: Arc<AtomicBool>,
}

/// Worker failures are logged for the first few, then only occasionally.
fn should_log_failure(failures: usize) -> bool {
    failures <= 10 || failures % 100 == 0
}

impl Worker {
    fn run(self) {
        while !self.stop.load(Ordering::SeqCst) {
            let job = match self.receiver.recv_timeout(POLL_INTERVAL) {
                Ok(job) => job,
                Err(RecvTimeoutError::Timeout) => continue,
                Err(RecvTimeoutError::Disconnected) => break,
            };

            match job {
                Job::Wake => continue,

                // Don't start anything new once we've been told to stop.
                Job::Load(_) if self.stop.load(Ordering::SeqCst) => break,

                Job::Load(request) => {
                    let is_archive = request.is_archive();
                    let success = self.load(request);

                    self.finish(success, is_archive);
                }
            }
        }
    }

    fn finish(&self, success: bool, is_archive: bool) {
        let context = &self.context;

        let batch_done = context.overall.record(success);
        let archives_done = is_archive && context.archives.record(success);

        let finished = context.overall.finished();

        if finished % 100 == 0 || batch_done {
            log::info!(
                "Loaded {}/{} textures ({} failed)",
                finished,
                context.overall.total(),
                context.overall.failed()
            );
        }

        if archives_done {
            log::info!("All archive textures loaded; rebuilding swap table");
            context.rebuild_swap_table();
        }

        if batch_done {
            log::info!("All queued textures loaded; rebuilding swap table");
            context.rebuild_swap_table();
        }

        context.overall.settle();
    }

    /// Runs one load. Returns `false` if it failed.
    fn load(&self, request: LoadRequest) -> bool {
        let context = &self.context;

        // Take the device now rather than when the job was queued, since it may have changed.
        let Some(device) = context.device.acquire() else {
            log::warn!("No device available; dropping load of {}", request.describe());
            return false;
        };

        match request {
            LoadRequest::File { id, path, kind } => {
                let already_loaded = match kind {
                    TextureKind::Planar => context.store.texture(id).is_some(),
                    TextureKind::Volume => context.store.volume_texture(id).is_some(),
                };

                if already_loaded {
                    log::debug!("{:#010x} is already loaded; skipping {:?}", id, path);
                    return true;
                }

                let decoded = {
                    let _decoding = context.lock_decoder();

                    match kind {
                        TextureKind::Planar => device.decode_image_file(&path),
                        TextureKind::Volume => device.decode_volume_image_file(&path),
                    }
                };

                let texture = match decoded {
                    Ok(texture) => texture,
                    Err(err) => {
                        if should_log_failure(context.overall.failed() + 1) {
                            log::warn!("Failed to load {:?}: {}", path, err);
                        }

                        return false;
                    }
                };

                match kind {
                    TextureKind::Planar => {
                        context.store.add_texture(id, &texture);

                        if let Some(content_hash) = texture_content_hash(&texture) {
                            context.store.set_content_hash(id, content_hash);
                        }
                    }

                    TextureKind::Volume => context.store.add_volume_texture(id, &texture),
                }

                // The store has its own reference now.
                texture.release();
                true
            }

            LoadRequest::Memory {
                content_hash,
                file_name,
                bytes,
            } => {
                let decoded = {
                    let _decoding = context.lock_decoder();
                    device.decode_image_from_memory(&bytes)
                };

                let texture = match decoded {
                    Ok(texture) => texture,
                    Err(err) => {
                        if should_log_failure(context.overall.failed() + 1) {
                            log::warn!("Failed to load archive image {}: {}", file_name, err);
                        }

                        return false;
                    }
                };

                context.store.add_texture(content_hash, &texture);

                for name_hash in context.bridge.name_hashes(content_hash) {
                    if name_hash != content_hash {
                        context.store.add_texture(name_hash, &texture);
                    }
                }

                texture.release();
                true
            }
        }
    }
}
