use std::collections::{BTreeMap, HashSet};
use std::sync::{mpsc, Arc, Condvar, Mutex, MutexGuard, PoisonError};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use tracing::warn;

use super::{
    bind_upload, AsyncPixelTransferManager, CompletionObserver, PixelUpload, TransferDelegate, TransferStats, UploadMeta,
};
use crate::backend::SharedBackend;
use crate::resource::ResourceKey;
use crate::shared_memory::MemoryRange;

enum Job {
    Upload { seq: u64, data: MemoryRange },
    Notify(CompletionObserver),
}

#[derive(Default)]
struct Finished {
    uploads: Vec<(u64, Vec<u8>, Duration)>,
}

#[derive(Default)]
struct Shared {
    finished: Mutex<Finished>,
    cv: Condvar,
}

impl Shared {
    fn lock(&self) -> MutexGuard<'_, Finished> {
        self.finished.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

/// Runs uploads on a dedicated worker thread. Completion observers run on the worker.
pub struct ThreadedTransferManager {
    jobs: Option<mpsc::Sender<Job>>,
    worker: Option<JoinHandle<()>>,
    shared: Arc<Shared>,
    next_seq: u64,
    /// Submitted uploads whose bytes have not been collected from the worker yet.
    in_flight: BTreeMap<u64, UploadMeta>,
    completed: Vec<(UploadMeta, Vec<u8>)>,
    stats: TransferStats,
}

impl Default for ThreadedTransferManager {
    fn default() -> Self {
        Self::new()
    }
}

impl ThreadedTransferManager {
    pub fn new() -> Self {
        let (tx, rx) = mpsc::channel::<Job>();
        let shared = Arc::new(Shared::default());
        let worker_shared = Arc::clone(&shared);
        let worker = thread::Builder::new()
            .name("gpucmd-transfer".into())
            .spawn(move || {
                for job in rx {
                    match job {
                        Job::Upload { seq, data } => {
                            let start = Instant::now();
                            let bytes = data.read_all();
                            worker_shared.lock().uploads.push((seq, bytes, start.elapsed()));
                            worker_shared.cv.notify_all();
                        }
                        Job::Notify(observer) => observer(),
                    }
                }
            });
        let (jobs, worker) = match worker {
            Ok(handle) => (Some(tx), Some(handle)),
            Err(err) => {
                warn!(%err, "failed to spawn transfer thread; uploads will run inline");
                (None, None)
            }
        };
        Self {
            jobs,
            worker,
            shared,
            next_seq: 0,
            in_flight: BTreeMap::new(),
            completed: Vec::new(),
            stats: TransferStats::default(),
        }
    }

    /// Move finished uploads out of the shared state.
    fn collect(&mut self) {
        let finished = std::mem::take(&mut self.shared.lock().uploads);
        self.absorb(finished);
    }

    fn absorb(&mut self, finished: Vec<(u64, Vec<u8>, Duration)>) {
        for (seq, bytes, elapsed) in finished {
            if let Some(meta) = self.in_flight.remove(&seq) {
                self.stats.texture_uploads += 1;
                self.stats.total_texture_upload_time += elapsed;
                self.completed.push((meta, bytes));
            }
        }
    }

    /// Block until every upload in `seqs` has been collected.
    fn wait_for(&mut self, mut seqs: HashSet<u64>) {
        loop {
            seqs.retain(|seq| self.in_flight.contains_key(seq));
            if seqs.is_empty() {
                return;
            }
            let finished = {
                let mut guard = self.shared.lock();
                while guard.uploads.is_empty() {
                    guard = self.shared.cv.wait(guard).unwrap_or_else(PoisonError::into_inner);
                }
                std::mem::take(&mut guard.uploads)
            };
            self.absorb(finished);
        }
    }
}

impl AsyncPixelTransferManager for ThreadedTransferManager {
    fn submit(&mut self, delegate: &TransferDelegate, upload: PixelUpload) {
        let meta = UploadMeta::new(delegate, &upload);
        let seq = self.next_seq;
        self.next_seq += 1;
        self.in_flight.insert(seq, meta);
        let job = Job::Upload { seq, data: upload.data };
        let unsent = match &self.jobs {
            Some(jobs) => jobs.send(job).err().map(|e| e.0),
            None => Some(job),
        };
        // No worker: do the copy here so the upload still completes.
        if let Some(Job::Upload { seq, data }) = unsent {
            let start = Instant::now();
            let bytes = data.read_all();
            self.absorb(vec![(seq, bytes, start.elapsed())]);
        }
    }

    fn transfer_in_progress(&self, texture: ResourceKey) -> bool {
        self.in_flight.values().any(|meta| meta.texture.key() == texture)
            || self.completed.iter().any(|(meta, _)| meta.texture.key() == texture)
    }

    fn wait_for_transfer_completion(&mut self, texture: ResourceKey) {
        let seqs = self
            .in_flight
            .iter()
            .filter(|(_, meta)| meta.texture.key() == texture)
            .map(|(&seq, _)| seq)
            .collect();
        self.wait_for(seqs);
    }

    fn bind_completed_async_transfers(&mut self, backend: &SharedBackend) -> usize {
        self.collect();
        let completed = std::mem::take(&mut self.completed);
        completed
            .iter()
            .filter(|(meta, data)| bind_upload(backend, meta, data))
            .count()
    }

    fn async_notify_completion(&mut self, observer: CompletionObserver) {
        let unsent = match &self.jobs {
            Some(jobs) => jobs.send(Job::Notify(observer)).err().map(|e| e.0),
            None => Some(Job::Notify(observer)),
        };
        if let Some(Job::Notify(observer)) = unsent {
            observer();
        }
    }

    fn process_more_pending_transfers(&mut self) {
        self.collect();
    }

    fn needs_process_more_pending_transfers(&self) -> bool {
        false
    }

    fn wait_all_async_tex_image_2d(&mut self, backend: &SharedBackend) {
        let seqs = self.in_flight.keys().copied().collect();
        self.wait_for(seqs);
        self.bind_completed_async_transfers(backend);
    }

    fn stats(&self) -> TransferStats {
        self.stats
    }
}

impl Drop for ThreadedTransferManager {
    fn drop(&mut self) {
        // Closing the channel ends the worker loop.
        self.jobs = None;
        if let Some(worker) = self.worker.take() {
            if worker.join().is_err() {
                warn!("transfer thread panicked");
            }
        }
    }
}
