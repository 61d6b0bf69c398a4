use serde::Serialize;
use std::any::Any;
use std::panic::{self, AssertUnwindSafe};
use std::sync::Mutex;
use std::sync::mpsc::{self, Receiver, SyncSender};
use std::thread;

use crate::config::{EngineConfig, PoolLifetime};
use crate::core::features::{ExtractorFactory, FeatureAdapter, FeatureExtractor};
use crate::core::hash::FingerprintHasher;
use crate::core::image::{ImageRef, ProcessResult};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct PoolProgress {
    /// 1-based index of the batch currently being drained.
    pub batch: usize,
    pub batches: usize,
    /// Images finished so far, including ones that never reached a worker.
    pub processed: usize,
    pub total: usize,
    /// Images a batch was short of, e.g. files that failed to decode.
    pub skipped: usize,
}

pub type ProgressCallback = Box<dyn Fn(PoolProgress) + Send + Sync>;

/// Fans batches of images out over a bounded set of worker threads.
///
/// Each worker builds its own extractor before taking any work and keeps
/// it for every image it processes. A batch is fully drained before the
/// next one is queued. Results come back in completion order.
pub struct BatchWorkerPool<'f, F> {
    factory: &'f F,
    batch_size: usize,
    workers: usize,
    lifetime: PoolLifetime,
    progress: Option<ProgressCallback>,
}

struct RunState {
    batches: usize,
    total: usize,
    batch: usize,
    skipped: usize,
    results: Vec<ProcessResult>,
}

impl<'f, F: ExtractorFactory> BatchWorkerPool<'f, F> {
    pub fn new(factory: &'f F, config: &EngineConfig) -> Self {
        Self {
            factory,
            batch_size: config.batch_size.max(1),
            workers: config.worker_count(),
            lifetime: config.pool_lifetime,
            progress: None,
        }
    }

    pub fn with_progress_callback(mut self, callback: ProgressCallback) -> Self {
        self.progress = Some(callback);
        self
    }

    pub fn batch_size(&self) -> usize {
        self.batch_size
    }

    /// Split `images` into batches and process all of them.
    pub fn process(&self, images: Vec<ImageRef>) -> Vec<ProcessResult> {
        let total = images.len();
        let batch_size = self.batch_size;
        let mut iter = images.into_iter();
        let batches = std::iter::from_fn(move || {
            let batch: Vec<ImageRef> = iter.by_ref().take(batch_size).collect();
            (!batch.is_empty()).then_some(batch)
        });
        self.process_batches(batches, total)
    }

    /// Process pre-built batches. `total` is the number of images the
    /// batches were cut from, `batch_size` at a time, and feeds progress
    /// reporting and worker sizing. Images missing from a batch (such as
    /// files that failed to decode) count as skipped, so progress still
    /// ends at `total`.
    pub fn process_batches<I>(&self, batches: I, total: usize) -> Vec<ProcessResult>
    where
        I: IntoIterator<Item = Vec<ImageRef>>,
    {
        let mut state = RunState {
            batches: total.div_ceil(self.batch_size),
            total,
            batch: 0,
            skipped: 0,
            results: Vec::with_capacity(total),
        };
        if total == 0 {
            return state.results;
        }

        match self.lifetime {
            PoolLifetime::Run => {
                let workers = self.workers.min(total);
                self.run_pool(workers, batches.into_iter(), &mut state);
            }
            PoolLifetime::PerBatch => {
                for batch in batches {
                    if batch.is_empty() {
                        self.begin_batch(&mut state, 0);
                        continue;
                    }
                    let workers = self.workers.min(batch.len());
                    self.run_pool(workers, std::iter::once(batch), &mut state);
                }
            }
        }

        state.results
    }

    fn run_pool(
        &self,
        workers: usize,
        batches: impl Iterator<Item = Vec<ImageRef>>,
        state: &mut RunState,
    ) {
        let (job_tx, job_rx) = mpsc::channel::<ImageRef>();
        let job_rx = Mutex::new(job_rx);
        let (result_tx, result_rx) = mpsc::sync_channel::<ProcessResult>(workers);

        thread::scope(|scope| {
            let mut spawned = 0;
            for index in 0..workers {
                let jobs = &job_rx;
                let results = result_tx.clone();
                let factory = self.factory;
                let handle = thread::Builder::new()
                    .name(format!("imgdupes-worker-{index}"))
                    .spawn_scoped(scope, move || worker_loop(index, factory, jobs, results));
                match handle {
                    Ok(_) => spawned += 1,
                    Err(e) => log::error!("Failed to spawn worker {}: {}", index, e),
                }
            }
            drop(result_tx);
            log::info!("Started {} worker(s)", spawned);

            if spawned == 0 {
                // No threads at all: do the work on this thread instead
                drop(job_tx);
                let mut worker = Worker::start(0, self.factory);
                for batch in batches {
                    self.begin_batch(state, batch.len());
                    for image in batch {
                        let result = worker.process(image);
                        self.record(state, result);
                    }
                }
                return;
            }

            for batch in batches {
                let expected = batch.len();
                self.begin_batch(state, expected);
                for image in batch {
                    if job_tx.send(image).is_err() {
                        break;
                    }
                }

                let mut received = 0;
                while received < expected {
                    match result_rx.recv() {
                        Ok(result) => {
                            received += 1;
                            self.record(state, result);
                        }
                        Err(_) => {
                            log::error!(
                                "All workers exited with {} image(s) of batch {} outstanding",
                                expected - received,
                                state.batch
                            );
                            break;
                        }
                    }
                }
            }
            drop(job_tx);
        });
    }

    fn begin_batch(&self, state: &mut RunState, size: usize) {
        let expected = state
            .total
            .saturating_sub(state.batch * self.batch_size)
            .min(self.batch_size);
        state.batch += 1;
        log::info!(
            "Processing batch {}/{} ({} image(s))",
            state.batch,
            state.batches,
            size
        );

        let missing = expected.saturating_sub(size);
        if missing > 0 {
            log::debug!("Batch {} is short {} image(s)", state.batch, missing);
            state.skipped += missing;
            self.report(state);
        }
    }

    fn record(&self, state: &mut RunState, result: ProcessResult) {
        state.results.push(result);
        self.report(state);
    }

    fn report(&self, state: &RunState) {
        if let Some(callback) = &self.progress {
            callback(PoolProgress {
                batch: state.batch,
                batches: state.batches,
                processed: state.results.len() + state.skipped,
                total: state.total,
                skipped: state.skipped,
            });
        }
    }
}

fn worker_loop<F: ExtractorFactory>(
    index: usize,
    factory: &F,
    jobs: &Mutex<Receiver<ImageRef>>,
    results: SyncSender<ProcessResult>,
) {
    let mut worker = Worker::start(index, factory);

    loop {
        let job = {
            let guard = match jobs.lock() {
                Ok(guard) => guard,
                Err(poisoned) => poisoned.into_inner(),
            };
            guard.recv()
        };
        let Ok(image) = job else {
            break;
        };

        if results.send(worker.process(image)).is_err() {
            break;
        }
    }

    log::debug!("Worker {} finished", index);
}

/// Per-thread processing state: a hasher and, if it could be built, this
/// worker's own extractor.
struct Worker<E> {
    index: usize,
    hasher: FingerprintHasher,
    adapter: Option<FeatureAdapter<E>>,
}

impl<E: FeatureExtractor> Worker<E> {
    fn start<F: ExtractorFactory<Extractor = E>>(index: usize, factory: &F) -> Self {
        let adapter = match panic::catch_unwind(AssertUnwindSafe(|| factory.build())) {
            Ok(Ok(extractor)) => Some(FeatureAdapter::new(extractor)),
            Ok(Err(e)) => {
                log::warn!(
                    "Worker {}: feature extractor unavailable, features disabled: {}",
                    index,
                    e
                );
                None
            }
            Err(payload) => {
                log::warn!(
                    "Worker {}: feature extractor initialization panicked: {}",
                    index,
                    panic_message(payload.as_ref())
                );
                None
            }
        };

        Self {
            index,
            hasher: FingerprintHasher::new(),
            adapter,
        }
    }

    fn process(&mut self, item: ImageRef) -> ProcessResult {
        let ImageRef { path, image } = item;

        let fingerprint = match panic::catch_unwind(AssertUnwindSafe(|| self.hasher.fingerprint(&image))) {
            Ok(Ok(fingerprint)) => Some(fingerprint),
            Ok(Err(e)) => {
                log::warn!("Error hashing image {}: {}", path.display(), e);
                None
            }
            Err(payload) => {
                log::warn!(
                    "Hashing {} panicked: {}",
                    path.display(),
                    panic_message(payload.as_ref())
                );
                None
            }
        };

        let features = match self.adapter.as_mut() {
            None => None,
            Some(adapter) => match panic::catch_unwind(AssertUnwindSafe(|| adapter.extract(&image))) {
                Ok(Ok(features)) => Some(features),
                Ok(Err(e)) => {
                    log::warn!("Error extracting features from {}: {}", path.display(), e);
                    None
                }
                Err(payload) => {
                    log::warn!(
                        "Feature extraction for {} panicked on worker {}: {}",
                        path.display(),
                        self.index,
                        panic_message(payload.as_ref())
                    );
                    None
                }
            },
        };

        log::debug!("Worker {} processed {}", self.index, path.display());
        ProcessResult::new(path, fingerprint, features)
    }
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        s.to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic".to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::features::{ColorHistogramFactory, ExtractError, ModelInput};
    use crate::core::hash::tests::{solid_image, split_image};
    use std::collections::HashSet;
    use std::path::PathBuf;
    use std::sync::Arc;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct CountingFactory {
        builds: AtomicUsize,
    }

    struct CountingExtractor {
        calls: usize,
    }

    impl FeatureExtractor for CountingExtractor {
        fn input_size(&self) -> (u32, u32) {
            (2, 2)
        }

        fn dimension(&self) -> usize {
            1
        }

        fn extract(&mut self, input: &ModelInput) -> Result<Vec<f32>, ExtractError> {
            self.calls += 1;
            Ok(vec![input.data[0]])
        }
    }

    impl ExtractorFactory for CountingFactory {
        type Extractor = CountingExtractor;

        fn build(&self) -> Result<CountingExtractor, ExtractError> {
            self.builds.fetch_add(1, Ordering::SeqCst);
            Ok(CountingExtractor { calls: 0 })
        }
    }

    struct PanickingExtractor;

    impl FeatureExtractor for PanickingExtractor {
        fn dimension(&self) -> usize {
            1
        }

        fn extract(&mut self, input: &ModelInput) -> Result<Vec<f32>, ExtractError> {
            if input.data[0] > 0.5 {
                panic!("model blew up");
            }
            Ok(vec![input.data[0]])
        }
    }

    fn config(batch_size: usize, workers: usize, lifetime: PoolLifetime) -> EngineConfig {
        EngineConfig {
            batch_size,
            workers: Some(workers),
            pool_lifetime: lifetime,
            ..Default::default()
        }
    }

    fn numbered_images(count: usize) -> Vec<ImageRef> {
        (0..count)
            .map(|i| {
                let shade = (i % 256) as u8;
                ImageRef::new(format!("img_{i}.png"), solid_image(6, 6, [shade, shade, shade]))
            })
            .collect()
    }

    #[test]
    fn test_every_image_processed_once() {
        let factory = ColorHistogramFactory::default();
        let pool = BatchWorkerPool::new(&factory, &config(64, 4, PoolLifetime::Run));

        let results = pool.process(numbered_images(130));

        assert_eq!(results.len(), 130);
        let paths: HashSet<PathBuf> = results.iter().map(|r| r.path.clone()).collect();
        assert_eq!(paths.len(), 130);
        for i in 0..130 {
            assert!(paths.contains(&PathBuf::from(format!("img_{i}.png"))));
        }
        assert!(results.iter().all(|r| r.is_complete()));
    }

    #[test]
    fn test_batches_reported_in_order() {
        let factory = ColorHistogramFactory::default();
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&seen);
        let pool = BatchWorkerPool::new(&factory, &config(64, 3, PoolLifetime::Run))
            .with_progress_callback(Box::new(move |p: PoolProgress| sink.lock().unwrap().push(p)));

        pool.process(numbered_images(130));

        let seen = seen.lock().unwrap();
        assert_eq!(seen.len(), 130);
        assert!(seen.iter().all(|p| p.batches == 3 && p.total == 130));
        // Batch 2 only starts once all 64 of batch 1 are in, and so on
        assert!(seen[..64].iter().all(|p| p.batch == 1));
        assert!(seen[64..128].iter().all(|p| p.batch == 2));
        assert!(seen[128..].iter().all(|p| p.batch == 3));
        assert_eq!(seen.last().unwrap().processed, 130);
    }

    #[test]
    fn test_short_batches_count_as_skipped() {
        let factory = ColorHistogramFactory::default();
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&seen);
        let pool = BatchWorkerPool::new(&factory, &config(2, 2, PoolLifetime::Run))
            .with_progress_callback(Box::new(move |p: PoolProgress| sink.lock().unwrap().push(p)));

        // 5 images cut into 2/2/1, with one lost from the first batch and
        // the whole last batch lost
        let mut images = numbered_images(3).into_iter();
        let batches = vec![
            images.by_ref().take(1).collect::<Vec<_>>(),
            images.by_ref().take(2).collect(),
            Vec::new(),
        ];
        let results = pool.process_batches(batches, 5);

        assert_eq!(results.len(), 3);
        let seen = seen.lock().unwrap();
        let last = seen.last().unwrap();
        assert_eq!(last.processed, 5);
        assert_eq!(last.total, 5);
        assert_eq!(last.skipped, 2);
        assert_eq!(last.batch, 3);
    }

    #[test]
    fn test_short_batches_per_batch_lifetime() {
        let factory = ColorHistogramFactory::default();
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&seen);
        let pool = BatchWorkerPool::new(&factory, &config(2, 2, PoolLifetime::PerBatch))
            .with_progress_callback(Box::new(move |p: PoolProgress| sink.lock().unwrap().push(p)));

        let batches = vec![Vec::new(), numbered_images(2)];
        let results = pool.process_batches(batches, 4);

        assert_eq!(results.len(), 2);
        let last = *seen.lock().unwrap().last().unwrap();
        assert_eq!(last.processed, 4);
        assert_eq!(last.skipped, 2);
    }

    #[test]
    fn test_extractor_built_once_per_worker() {
        let factory = CountingFactory {
            builds: AtomicUsize::new(0),
        };
        let pool = BatchWorkerPool::new(&factory, &config(10, 3, PoolLifetime::Run));

        let results = pool.process(numbered_images(50));

        assert_eq!(results.len(), 50);
        assert_eq!(factory.builds.load(Ordering::SeqCst), 3);
    }

    #[test]
    fn test_per_batch_lifetime_rebuilds_extractors() {
        let factory = CountingFactory {
            builds: AtomicUsize::new(0),
        };
        let pool = BatchWorkerPool::new(&factory, &config(10, 2, PoolLifetime::PerBatch));

        let results = pool.process(numbered_images(25));

        assert_eq!(results.len(), 25);
        // 3 batches, 2 workers each
        assert_eq!(factory.builds.load(Ordering::SeqCst), 6);
    }

    #[test]
    fn test_workers_capped_by_input_size() {
        let factory = CountingFactory {
            builds: AtomicUsize::new(0),
        };
        let pool = BatchWorkerPool::new(&factory, &config(64, 8, PoolLifetime::Run));

        pool.process(numbered_images(2));

        assert_eq!(factory.builds.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn test_empty_input() {
        let factory = CountingFactory {
            builds: AtomicUsize::new(0),
        };
        let pool = BatchWorkerPool::new(&factory, &config(64, 4, PoolLifetime::Run));

        assert!(pool.process(Vec::new()).is_empty());
        assert_eq!(factory.builds.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn test_failing_factory_keeps_hashes() {
        let factory = || -> Result<CountingExtractor, ExtractError> {
            Err(ExtractError::Init {
                message: "model weights missing".to_string(),
            })
        };
        let pool = BatchWorkerPool::new(&factory, &config(4, 2, PoolLifetime::Run));

        let results = pool.process(numbered_images(9));

        assert_eq!(results.len(), 9);
        assert!(results.iter().all(|r| r.fingerprint.is_some()));
        assert!(results.iter().all(|r| r.features.is_none()));
    }

    #[test]
    fn test_panicking_factory_keeps_hashes() {
        let factory = || -> Result<CountingExtractor, ExtractError> { panic!("no GPU") };
        let pool = BatchWorkerPool::new(&factory, &config(4, 2, PoolLifetime::Run));

        let results = pool.process(numbered_images(5));

        assert_eq!(results.len(), 5);
        assert!(results.iter().all(|r| r.fingerprint.is_some() && r.features.is_none()));
    }

    #[test]
    fn test_extractor_panic_is_isolated() {
        let factory = || -> Result<PanickingExtractor, ExtractError> { Ok(PanickingExtractor) };
        let pool = BatchWorkerPool::new(&factory, &config(8, 2, PoolLifetime::Run));

        let images = vec![
            ImageRef::new("dark.png", solid_image(8, 8, [0, 0, 0])),
            ImageRef::new("bright.png", solid_image(8, 8, [255, 255, 255])),
            ImageRef::new("split.png", split_image(8, 8)),
        ];
        let results = pool.process(images);

        assert_eq!(results.len(), 3);
        let bright = results
            .iter()
            .find(|r| r.path == PathBuf::from("bright.png"))
            .unwrap();
        assert!(bright.fingerprint.is_some());
        assert!(bright.features.is_none());

        let dark = results
            .iter()
            .find(|r| r.path == PathBuf::from("dark.png"))
            .unwrap();
        assert!(dark.is_complete());
    }

    #[test]
    fn test_empty_image_has_no_fingerprint() {
        let factory = ColorHistogramFactory::default();
        let pool = BatchWorkerPool::new(&factory, &config(8, 2, PoolLifetime::Run));

        let images = vec![
            ImageRef::new("empty.png", image::DynamicImage::new_rgb8(0, 0)),
            ImageRef::new("fine.png", solid_image(8, 8, [9, 9, 9])),
        ];
        let results = pool.process(images);

        assert_eq!(results.len(), 2);
        let empty = results
            .iter()
            .find(|r| r.path == PathBuf::from("empty.png"))
            .unwrap();
        assert_eq!(empty, &ProcessResult::failed(PathBuf::from("empty.png")));
    }

    #[test]
    fn test_panic_message() {
        let payload: Box<dyn Any + Send> = Box::new("static message");
        assert_eq!(panic_message(payload.as_ref()), "static message");

        let payload: Box<dyn Any + Send> = Box::new(String::from("owned message"));
        assert_eq!(panic_message(payload.as_ref()), "owned message");

        let payload: Box<dyn Any + Send> = Box::new(42u32);
        assert_eq!(panic_message(payload.as_ref()), "unknown panic");
    }
}
