use std::collections::VecDeque;
use std::time::Instant;

use super::{
    bind_upload, AsyncPixelTransferManager, CompletionObserver, PixelUpload, TransferDelegate, TransferStats, UploadMeta,
};
use crate::backend::SharedBackend;
use crate::resource::ResourceKey;
use crate::shared_memory::MemoryRange;

enum Task {
    Upload { meta: UploadMeta, data: MemoryRange },
    Notify(CompletionObserver),
}

/// Runs uploads on the decoder thread, a few at a time, from
/// [`AsyncPixelTransferManager::process_more_pending_transfers`].
pub struct IdleTransferManager {
    queue: VecDeque<Task>,
    completed: Vec<(UploadMeta, Vec<u8>)>,
    budget: usize,
    stats: TransferStats,
}

impl IdleTransferManager {
    pub fn new(budget: usize) -> Self {
        Self {
            queue: VecDeque::new(),
            completed: Vec::new(),
            budget: budget.max(1),
            stats: TransferStats::default(),
        }
    }

    /// Run the front task. Returns `false` once the queue is empty.
    fn run_one(&mut self) -> bool {
        let Some(task) = self.queue.pop_front() else {
            return false;
        };
        match task {
            Task::Upload { meta, data } => {
                let start = Instant::now();
                let bytes = data.read_all();
                self.stats.texture_uploads += 1;
                self.stats.total_texture_upload_time += start.elapsed();
                self.completed.push((meta, bytes));
            }
            Task::Notify(observer) => observer(),
        }
        true
    }

    fn has_queued_upload(&self, texture: ResourceKey) -> bool {
        self.queue
            .iter()
            .any(|task| matches!(task, Task::Upload { meta, .. } if meta.texture.key() == texture))
    }
}

impl AsyncPixelTransferManager for IdleTransferManager {
    fn submit(&mut self, delegate: &TransferDelegate, upload: PixelUpload) {
        let meta = UploadMeta::new(delegate, &upload);
        self.queue.push_back(Task::Upload { meta, data: upload.data });
    }

    fn transfer_in_progress(&self, texture: ResourceKey) -> bool {
        self.has_queued_upload(texture) || self.completed.iter().any(|(meta, _)| meta.texture.key() == texture)
    }

    fn wait_for_transfer_completion(&mut self, texture: ResourceKey) {
        while self.has_queued_upload(texture) {
            self.run_one();
        }
    }

    fn bind_completed_async_transfers(&mut self, backend: &SharedBackend) -> usize {
        let completed = std::mem::take(&mut self.completed);
        completed
            .iter()
            .filter(|(meta, data)| bind_upload(backend, meta, data))
            .count()
    }

    fn async_notify_completion(&mut self, observer: CompletionObserver) {
        if self.queue.is_empty() {
            observer();
        } else {
            self.queue.push_back(Task::Notify(observer));
        }
    }

    fn process_more_pending_transfers(&mut self) {
        let mut uploads = 0;
        while uploads < self.budget {
            match self.queue.front() {
                None => break,
                Some(Task::Upload { .. }) => uploads += 1,
                Some(Task::Notify(_)) => {}
            }
            self.run_one();
        }
        // Observers queued behind the last processed upload are due now.
        while matches!(self.queue.front(), Some(Task::Notify(_))) {
            self.run_one();
        }
    }

    fn needs_process_more_pending_transfers(&self) -> bool {
        !self.queue.is_empty()
    }

    fn wait_all_async_tex_image_2d(&mut self, backend: &SharedBackend) {
        while self.run_one() {}
        self.bind_completed_async_transfers(backend);
    }

    fn stats(&self) -> TransferStats {
        self.stats
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::sync::Arc;

    use crate::pixel_transfer::tests::Fixture;

    #[test]
    fn uploads_progress_only_when_processed() {
        let f = Fixture::new();
        let texture = f.texture();
        let mut m = IdleTransferManager::new(1);
        let delegate = m.create_transfer_delegate(&texture);
        m.submit(&delegate, f.upload(0));
        m.submit(&delegate, f.upload(16));

        let done = Arc::new(AtomicBool::new(false));
        let flag = Arc::clone(&done);
        m.async_notify_completion(Box::new(move || flag.store(true, Ordering::SeqCst)));

        assert!(m.transfer_in_progress(texture.key()));
        assert!(m.needs_process_more_pending_transfers());
        m.process_more_pending_transfers();
        assert!(!done.load(Ordering::SeqCst));
        m.process_more_pending_transfers();
        assert!(done.load(Ordering::SeqCst));
        assert!(!m.needs_process_more_pending_transfers());

        assert_eq!(m.bind_completed_async_transfers(&f.backend), 2);
        assert!(!m.transfer_in_progress(texture.key()));
        assert_eq!(f.pixels(&texture), (16..32).collect::<Vec<u8>>());
        assert_eq!(m.stats().texture_uploads, 2);
    }

    #[test]
    fn notify_with_nothing_queued_runs_immediately() {
        let mut m = IdleTransferManager::new(4);
        let done = Arc::new(AtomicBool::new(false));
        let flag = Arc::clone(&done);
        m.async_notify_completion(Box::new(move || flag.store(true, Ordering::SeqCst)));
        assert!(done.load(Ordering::SeqCst));
    }

    #[test]
    fn deleted_texture_discards_result() {
        let f = Fixture::new();
        let texture = f.texture();
        let sid = texture.service_id();
        let mut m = IdleTransferManager::new(4);
        let delegate = m.create_transfer_delegate(&texture);
        m.submit(&delegate, f.upload(0));
        drop(texture);
        assert!(!f.soft.borrow().is_live(sid));

        m.wait_all_async_tex_image_2d(&f.backend);
        assert_eq!(m.stats().texture_uploads, 1);
        assert!(!m.needs_process_more_pending_transfers());
    }
}
