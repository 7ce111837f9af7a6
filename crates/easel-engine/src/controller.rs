use std::io::ErrorKind;
use std::path::PathBuf;
use std::sync::{Arc, Mutex, MutexGuard};
use std::thread::{self, JoinHandle};
use std::time::Duration;

use easel_contracts::events::{EventHub, Subscription};
use easel_contracts::history::{HistoryRecord, HistoryStats, HistoryStore};
use easel_contracts::paths::ImagePath;
use easel_contracts::prompts::{is_prompt_id, PromptCache, DEFAULT_PROMPT_CACHE_CAPACITY};

use crate::error::{Result, SessionError};
use crate::expander::PromptExpander;
use crate::session::{SessionSnapshot, SessionState, DEFAULT_COUNT, DEFAULT_HEIGHT, DEFAULT_WIDTH};
use crate::synthesizer::ImageSynthesizer;
use crate::worker::{self, CancelToken, WorkerTicket};

/// External services the worker drives on the session's behalf.
#[derive(Clone)]
pub struct Collaborators {
    pub expander: Arc<dyn PromptExpander>,
    pub synthesizer: Arc<dyn ImageSynthesizer>,
    pub history: Arc<dyn HistoryStore>,
}

#[derive(Debug, Clone)]
pub struct SessionOptions {
    /// Root under which `<promptId>/<uuid>.png` files are written.
    pub images_dir: PathBuf,
    pub prompt_cache_capacity: usize,
    pub prompt_cache_ttl: Option<Duration>,
    /// Pause after broadcasting a worker failure, before the worker exits.
    pub error_backoff: Duration,
}

impl SessionOptions {
    pub fn new(images_dir: impl Into<PathBuf>) -> Self {
        Self {
            images_dir: images_dir.into(),
            prompt_cache_capacity: DEFAULT_PROMPT_CACHE_CAPACITY,
            prompt_cache_ttl: None,
            error_backoff: Duration::from_secs(1),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StartRequest {
    pub prompt: Option<String>,
    pub count: u64,
    pub width: u32,
    pub height: u32,
    pub reference_image: Option<PathBuf>,
}

impl Default for StartRequest {
    fn default() -> Self {
        Self {
            prompt: None,
            count: DEFAULT_COUNT,
            width: DEFAULT_WIDTH,
            height: DEFAULT_HEIGHT,
            reference_image: None,
        }
    }
}

impl StartRequest {
    pub fn prompt(prompt: impl Into<String>, count: u64) -> Self {
        Self {
            prompt: Some(prompt.into()),
            count,
            ..Self::default()
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StartOutcome {
    pub prompt_text: Option<String>,
    pub target_count: u64,
}

pub(crate) struct Core {
    shared: Mutex<Shared>,
    pub(crate) expander: Arc<dyn PromptExpander>,
    pub(crate) synthesizer: Arc<dyn ImageSynthesizer>,
    pub(crate) history: Arc<dyn HistoryStore>,
    pub(crate) prompt_cache: PromptCache,
    pub(crate) events: EventHub,
    pub(crate) images_dir: PathBuf,
    pub(crate) error_backoff: Duration,
}

impl Core {
    pub(crate) fn lock(&self) -> Result<MutexGuard<'_, Shared>> {
        self.shared.lock().map_err(|_| SessionError::LockPoisoned)
    }
}

/// Everything guarded by the session lock.
pub(crate) struct Shared {
    pub(crate) session: SessionState,
    worker: Option<ActiveWorker>,
    retired: Vec<JoinHandle<()>>,
    next_worker_id: u64,
}

struct ActiveWorker {
    id: u64,
    cancel: CancelToken,
    handle: JoinHandle<()>,
}

impl Shared {
    pub(crate) fn owns(&self, worker_id: u64) -> bool {
        self.worker.as_ref().map(|worker| worker.id) == Some(worker_id)
    }

    /// Called by the owning worker as it exits.
    pub(crate) fn release_worker(&mut self, worker_id: u64) {
        if !self.owns(worker_id) {
            return;
        }
        if let Some(worker) = self.worker.take() {
            self.park(worker.handle);
        }
        self.session.running = false;
    }

    /// Cancels whichever worker owns the session, without waiting for it.
    fn retire_worker(&mut self) {
        if let Some(worker) = self.worker.take() {
            worker.cancel.cancel();
            tracing::debug!(worker = worker.id, "generation worker cancelled");
            self.park(worker.handle);
        }
        self.session.running = false;
    }

    fn park(&mut self, handle: JoinHandle<()>) {
        self.retired.retain(|handle| !handle.is_finished());
        self.retired.push(handle);
    }
}

/// Public operation surface over the single generation session.
///
/// Every state change happens inside one critical section of the session
/// lock. Network work happens outside it; the only disk writes under it are
/// the worker committing a prompt record or an image file. Cloning is cheap
/// and all clones drive the same session.
#[derive(Clone)]
pub struct SessionController {
    core: Arc<Core>,
}

impl SessionController {
    pub fn new(collaborators: Collaborators, options: SessionOptions, events: EventHub) -> Self {
        let Collaborators {
            expander,
            synthesizer,
            history,
        } = collaborators;
        Self {
            core: Arc::new(Core {
                shared: Mutex::new(Shared {
                    session: SessionState::default(),
                    worker: None,
                    retired: Vec::new(),
                    next_worker_id: 1,
                }),
                expander,
                synthesizer,
                history,
                prompt_cache: PromptCache::new(
                    options.prompt_cache_capacity,
                    options.prompt_cache_ttl,
                ),
                events,
                images_dir: options.images_dir,
                error_backoff: options.error_backoff,
            }),
        }
    }

    pub fn events(&self) -> &EventHub {
        &self.core.events
    }

    pub fn subscribe(&self) -> Subscription {
        self.core.events.subscribe()
    }

    pub fn images_dir(&self) -> &std::path::Path {
        &self.core.images_dir
    }

    /// Starts a new prompt, or extends the current one when `prompt` is
    /// empty or unchanged, and makes sure exactly one worker is running.
    pub fn start(&self, request: StartRequest) -> Result<StartOutcome> {
        if request.width == 0 || request.height == 0 {
            return Err(SessionError::InvalidArgument(format!(
                "image size must be positive, got {}x{}",
                request.width, request.height
            )));
        }
        let prompt = request
            .prompt
            .as_deref()
            .map(str::trim)
            .filter(|text| !text.is_empty());

        let mut shared = self.core.lock()?;
        match prompt {
            Some(text) if shared.session.prompt_text.as_deref() != Some(text) => {
                tracing::info!(count = request.count, "starting new prompt");
                shared.session.reset(
                    text,
                    request.count,
                    request.width,
                    request.height,
                    request.reference_image,
                );
            }
            _ => {
                if shared.session.prompt_text.is_none() {
                    return Err(SessionError::InvalidArgument(
                        "a prompt is required to start a new session".to_string(),
                    ));
                }
                shared.session.extend(request.count, request.reference_image);
            }
        }
        if shared.worker.is_none() {
            self.launch(&mut shared)?;
        }
        Ok(StartOutcome {
            prompt_text: shared.session.prompt_text.clone(),
            target_count: shared.session.target_count,
        })
    }

    /// Advisory stop: flips the flags and cancels the worker's token. The
    /// worker exits at its next checkpoint.
    pub fn stop(&self) -> Result<()> {
        let mut shared = self.core.lock()?;
        shared.session.stop_requested = true;
        shared.retire_worker();
        tracing::info!("generation stop requested");
        Ok(())
    }

    /// Raises the target; relaunches the worker when idle and a prompt exists.
    pub fn add_more(&self, count: u64) -> Result<u64> {
        let mut shared = self.core.lock()?;
        shared.session.extend(count, None);
        if shared.worker.is_none() && shared.session.prompt_text.is_some() {
            self.launch(&mut shared)?;
        }
        Ok(shared.session.target_count)
    }

    pub fn status(&self) -> Result<SessionSnapshot> {
        Ok(self.core.lock()?.session.snapshot())
    }

    /// Deletes one generated image from disk, its history record and, when
    /// listed, the live session. Returns the live image list.
    pub fn delete_image(&self, raw_path: &str) -> Result<Vec<String>> {
        let path = ImagePath::parse(raw_path)
            .map_err(|err| SessionError::InvalidArgument(err.to_string()))?;

        let removed_file = match std::fs::remove_file(path.resolve(&self.core.images_dir)) {
            Ok(()) => true,
            Err(err) if err.kind() == ErrorKind::NotFound => false,
            Err(err) => return Err(err.into()),
        };
        let removed_record = self
            .core
            .history
            .remove_image(path.prompt_id(), path.filename())
            .map_err(|err| SessionError::storage(&err))?;

        let mut shared = self.core.lock()?;
        let removed_live = shared.session.remove_image(&path.to_string());
        if !(removed_file || removed_record || removed_live) {
            return Err(SessionError::NotFound(format!("image {path}")));
        }
        tracing::info!(path = %path, "image deleted");
        Ok(shared.session.images.clone())
    }

    /// Re-points the session at a stored prompt with nothing pending.
    pub fn switch_prompt(&self, prompt_id: &str) -> Result<(HistoryRecord, Vec<String>)> {
        if !is_prompt_id(prompt_id) {
            return Err(SessionError::InvalidArgument(format!(
                "invalid prompt id {prompt_id:?}"
            )));
        }
        let record = self.get_history(prompt_id)?;
        if !record.positive_prompt.is_empty() {
            self.core
                .prompt_cache
                .insert(record.id.clone(), record.prompt_pair());
        }

        let mut shared = self.core.lock()?;
        shared.retire_worker();
        shared.session.load_record(&record);
        let images = shared.session.images.clone();
        tracing::info!(prompt_id = %record.id, images = images.len(), "switched prompt");
        Ok((record, images))
    }

    pub fn list_history(&self) -> Result<Vec<HistoryRecord>> {
        self.core
            .history
            .list()
            .map_err(|err| SessionError::storage(&err))
    }

    pub fn get_history(&self, prompt_id: &str) -> Result<HistoryRecord> {
        self.core
            .history
            .get(prompt_id)
            .map_err(|err| SessionError::storage(&err))?
            .ok_or_else(|| SessionError::NotFound(format!("prompt {prompt_id}")))
    }

    /// Deletes a stored prompt together with its image directory.
    pub fn delete_history(&self, prompt_id: &str) -> Result<()> {
        if !is_prompt_id(prompt_id) {
            return Err(SessionError::InvalidArgument(format!(
                "invalid prompt id {prompt_id:?}"
            )));
        }
        {
            let mut shared = self.core.lock()?;
            let bound = shared.session.prompt_id.as_deref() == Some(prompt_id)
                || shared
                    .session
                    .prompt_text
                    .as_deref()
                    .is_some_and(|text| easel_contracts::prompts::prompt_id(text) == prompt_id);
            if bound {
                shared.retire_worker();
                shared.session.clear_images();
            }
        }

        let removed_dir = match std::fs::remove_dir_all(self.core.images_dir.join(prompt_id)) {
            Ok(()) => true,
            Err(err) if err.kind() == ErrorKind::NotFound => false,
            Err(err) => return Err(err.into()),
        };
        let removed_record = self
            .core
            .history
            .delete(prompt_id)
            .map_err(|err| SessionError::storage(&err))?;
        self.core.prompt_cache.remove(prompt_id);
        if !(removed_dir || removed_record) {
            return Err(SessionError::NotFound(format!("prompt {prompt_id}")));
        }
        tracing::info!(prompt_id, "history record deleted");
        Ok(())
    }

    pub fn history_stats(&self) -> Result<HistoryStats> {
        self.core
            .history
            .stats()
            .map_err(|err| SessionError::storage(&err))
    }

    /// Stops generation and waits for every worker thread to exit.
    pub fn shutdown(&self) -> Result<()> {
        let handles = {
            let mut shared = self.core.lock()?;
            shared.session.stop_requested = true;
            shared.retire_worker();
            std::mem::take(&mut shared.retired)
        };
        for handle in handles {
            if handle.join().is_err() {
                tracing::warn!("generation worker panicked");
            }
        }
        Ok(())
    }

    fn launch(&self, shared: &mut Shared) -> Result<()> {
        let id = shared.next_worker_id;
        shared.next_worker_id += 1;
        let cancel = CancelToken::new();
        let ticket = WorkerTicket {
            id,
            cancel: cancel.clone(),
        };
        let core = Arc::clone(&self.core);
        let handle = thread::Builder::new()
            .name(format!("easel-worker-{id}"))
            .spawn(move || worker::run(core, ticket))?;

        shared.worker = Some(ActiveWorker { id, cancel, handle });
        shared.session.running = true;
        shared.session.stop_requested = false;
        shared.session.last_error = None;
        tracing::info!(worker = id, "generation worker launched");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use std::collections::HashSet;
    use std::path::{Path, PathBuf};
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::mpsc::{self, Receiver, Sender};
    use std::sync::{Arc, Barrier, Mutex, OnceLock};
    use std::thread::{self, ThreadId};
    use std::time::{Duration, Instant};

    use anyhow::{anyhow, bail};
    use easel_contracts::events::{EventHub, GenerationEvent, ProgressStatus, Subscription};
    use easel_contracts::history::{HistoryRecord, HistoryStore, SqliteHistoryStore};
    use easel_contracts::prompts::{prompt_id, PromptPair};

    use super::{Collaborators, SessionController, SessionOptions, StartRequest};
    use crate::error::SessionError;
    use crate::expander::{DryrunExpander, PromptExpander};
    use crate::synthesizer::{DryrunSynthesizer, ImageSynthesizer, SynthesisRequest};

    const WAIT: Duration = Duration::from_secs(10);

    /// Dryrun expander that records how often, and from which threads, it ran.
    #[derive(Default)]
    struct RecordingExpander {
        calls: AtomicUsize,
        threads: Mutex<HashSet<ThreadId>>,
        fail_with: Option<String>,
    }

    impl PromptExpander for RecordingExpander {
        fn name(&self) -> &str {
            "recording"
        }

        fn expand(&self, prompt_text: &str, sink: &mut dyn FnMut(&str)) -> anyhow::Result<PromptPair> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            if let Ok(mut threads) = self.threads.lock() {
                threads.insert(thread::current().id());
            }
            if let Some(message) = &self.fail_with {
                bail!("{message}");
            }
            DryrunExpander.expand(prompt_text, sink)
        }
    }

    /// Instruction for one synthesizer call: render `n` images or fail.
    type GateStep = Result<usize, String>;

    /// Synthesizer that blocks every call until the test releases it.
    struct GatedSynthesizer {
        steps: Mutex<Receiver<GateStep>>,
        active: AtomicUsize,
        max_active: AtomicUsize,
        threads: Mutex<HashSet<ThreadId>>,
    }

    impl GatedSynthesizer {
        fn new() -> (Arc<Self>, Sender<GateStep>) {
            let (tx, rx) = mpsc::channel();
            let synth = Arc::new(Self {
                steps: Mutex::new(rx),
                active: AtomicUsize::new(0),
                max_active: AtomicUsize::new(0),
                threads: Mutex::new(HashSet::new()),
            });
            (synth, tx)
        }
    }

    impl ImageSynthesizer for GatedSynthesizer {
        fn name(&self) -> &str {
            "gated"
        }

        fn synthesize(&self, request: &SynthesisRequest) -> anyhow::Result<Vec<Vec<u8>>> {
            let active = self.active.fetch_add(1, Ordering::SeqCst) + 1;
            self.max_active.fetch_max(active, Ordering::SeqCst);
            if let Ok(mut threads) = self.threads.lock() {
                threads.insert(thread::current().id());
            }
            let step = self
                .steps
                .lock()
                .map_err(|_| anyhow!("gate lock poisoned"))?
                .recv_timeout(WAIT);
            self.active.fetch_sub(1, Ordering::SeqCst);
            match step {
                Ok(Ok(n)) => DryrunSynthesizer::new(n).synthesize(request),
                Ok(Err(message)) => bail!("{message}"),
                Err(_) => bail!("gate never released"),
            }
        }
    }

    type AppendHook = Box<dyn Fn(&SessionController, &str) -> anyhow::Result<()> + Send + Sync>;

    /// Real store that calls back into the controller right after each
    /// image lands on a record, while the worker is between images.
    struct HookedHistory {
        inner: Arc<dyn HistoryStore>,
        controller: OnceLock<SessionController>,
        after_append: AppendHook,
    }

    impl HistoryStore for HookedHistory {
        fn upsert(
            &self,
            prompt_text: &str,
            pair: &PromptPair,
            width: u32,
            height: u32,
        ) -> anyhow::Result<String> {
            self.inner.upsert(prompt_text, pair, width, height)
        }

        fn append_image(&self, prompt_id: &str, filename: &str) -> anyhow::Result<()> {
            self.inner.append_image(prompt_id, filename)?;
            match self.controller.get() {
                Some(controller) => (self.after_append)(controller, prompt_id),
                None => Ok(()),
            }
        }

        fn remove_image(&self, prompt_id: &str, filename: &str) -> anyhow::Result<bool> {
            self.inner.remove_image(prompt_id, filename)
        }

        fn get(&self, prompt_id: &str) -> anyhow::Result<Option<HistoryRecord>> {
            self.inner.get(prompt_id)
        }

        fn delete(&self, prompt_id: &str) -> anyhow::Result<bool> {
            self.inner.delete(prompt_id)
        }

        fn list(&self) -> anyhow::Result<Vec<HistoryRecord>> {
            self.inner.list()
        }
    }

    struct Harness {
        _temp: tempfile::TempDir,
        images_dir: PathBuf,
        history: Arc<dyn HistoryStore>,
        controller: SessionController,
        events: Subscription,
    }

    fn harness(
        expander: Arc<dyn PromptExpander>,
        synthesizer: Arc<dyn ImageSynthesizer>,
    ) -> anyhow::Result<Harness> {
        build_harness(expander, synthesizer, None)
    }

    fn hooked_harness(
        synthesizer: Arc<dyn ImageSynthesizer>,
        after_append: AppendHook,
    ) -> anyhow::Result<Harness> {
        build_harness(
            Arc::new(RecordingExpander::default()),
            synthesizer,
            Some(after_append),
        )
    }

    fn build_harness(
        expander: Arc<dyn PromptExpander>,
        synthesizer: Arc<dyn ImageSynthesizer>,
        after_append: Option<AppendHook>,
    ) -> anyhow::Result<Harness> {
        let temp = tempfile::tempdir()?;
        let images_dir = temp.path().join("generated");
        let history: Arc<dyn HistoryStore> =
            Arc::new(SqliteHistoryStore::open(temp.path().join("history.db"))?);
        let hooked = after_append.map(|after_append| {
            Arc::new(HookedHistory {
                inner: history.clone(),
                controller: OnceLock::new(),
                after_append,
            })
        });
        let worker_history: Arc<dyn HistoryStore> = match &hooked {
            Some(hooked) => hooked.clone(),
            None => history.clone(),
        };
        let mut options = SessionOptions::new(&images_dir);
        options.error_backoff = Duration::ZERO;
        let controller = SessionController::new(
            Collaborators {
                expander,
                synthesizer,
                history: worker_history,
            },
            options,
            EventHub::new(),
        );
        if let Some(hooked) = &hooked {
            if hooked.controller.set(controller.clone()).is_err() {
                bail!("history hook already bound");
            }
        }
        let events = controller.subscribe();
        Ok(Harness {
            _temp: temp,
            images_dir,
            history,
            controller,
            events,
        })
    }

    fn dryrun_harness() -> anyhow::Result<Harness> {
        harness(
            Arc::new(RecordingExpander::default()),
            Arc::new(DryrunSynthesizer::new(1)),
        )
    }

    fn small(prompt: &str, count: u64) -> StartRequest {
        StartRequest {
            width: 16,
            height: 24,
            ..StartRequest::prompt(prompt, count)
        }
    }

    fn wait_for(
        events: &Subscription,
        mut done: impl FnMut(&GenerationEvent) -> bool,
    ) -> anyhow::Result<Vec<GenerationEvent>> {
        let deadline = Instant::now() + WAIT;
        let mut seen = Vec::new();
        while let Some(remaining) = deadline.checked_duration_since(Instant::now()) {
            let Some(event) = events.recv_timeout(remaining) else {
                break;
            };
            let finished = done(&event);
            seen.push(event);
            if finished {
                return Ok(seen);
            }
        }
        bail!("timed out waiting for event; saw {seen:?}")
    }

    fn is_complete(event: &GenerationEvent) -> bool {
        matches!(event, GenerationEvent::GenerationComplete { .. })
    }

    fn new_image_paths(events: &[GenerationEvent]) -> Vec<String> {
        events
            .iter()
            .filter_map(|event| match event {
                GenerationEvent::NewImage { path, .. } => Some(path.clone()),
                _ => None,
            })
            .collect()
    }

    fn exists(images_dir: &Path, path: &str) -> bool {
        images_dir.join(path).exists()
    }

    #[test]
    fn two_image_run_completes_and_persists() -> anyhow::Result<()> {
        let h = dryrun_harness()?;
        let outcome = h.controller.start(small("mountain lake", 2))?;
        assert_eq!(outcome.prompt_text.as_deref(), Some("mountain lake"));
        assert_eq!(outcome.target_count, 2);

        let events = wait_for(&h.events, is_complete)?;
        let paths = new_image_paths(&events);
        assert_eq!(paths.len(), 2);
        assert_eq!(
            events.last(),
            Some(&GenerationEvent::GenerationComplete { total: 2 })
        );
        assert!(events.iter().any(|event| matches!(
            event,
            GenerationEvent::Progress {
                status: ProgressStatus::GeneratingPrompt,
                ..
            }
        )));
        assert!(events
            .iter()
            .any(|event| matches!(event, GenerationEvent::Log { .. })));

        let status = h.controller.status()?;
        assert!(!status.running);
        assert_eq!(status.produced_count, 2);
        assert_eq!(status.images, paths);
        let id = prompt_id("mountain lake");
        assert_eq!(status.prompt_id.as_deref(), Some(id.as_str()));
        assert!(paths.iter().all(|path| exists(&h.images_dir, path)));

        let record = h
            .history
            .get(&id)?
            .ok_or_else(|| anyhow!("history record missing"))?;
        assert_eq!(record.image_paths(), paths);
        h.controller.shutdown()?;
        Ok(())
    }

    #[test]
    fn same_prompt_extends_target() -> anyhow::Result<()> {
        let (synth, gate) = GatedSynthesizer::new();
        let h = harness(Arc::new(RecordingExpander::default()), synth)?;

        assert_eq!(h.controller.start(small("lake", 3))?.target_count, 3);
        assert_eq!(h.controller.start(small("lake", 2))?.target_count, 5);
        let empty = StartRequest {
            prompt: Some("  ".to_string()),
            ..small("", 4)
        };
        assert_eq!(h.controller.start(empty)?.target_count, 9);
        assert_eq!(h.controller.add_more(1)?, 10);
        assert!(h.controller.status()?.running);

        h.controller.stop()?;
        let _ = gate.send(Ok(1));
        h.controller.shutdown()?;
        assert!(!h.controller.status()?.running);
        Ok(())
    }

    #[test]
    fn different_prompt_resets_progress() -> anyhow::Result<()> {
        let (synth, gate) = GatedSynthesizer::new();
        let h = harness(Arc::new(RecordingExpander::default()), synth)?;
        gate.send(Ok(1))?;
        h.controller.start(small("first", 1))?;
        wait_for(&h.events, is_complete)?;
        assert_eq!(h.controller.status()?.produced_count, 1);

        let outcome = h.controller.start(small("second", 4))?;
        assert_eq!(outcome.target_count, 4);
        let status = h.controller.status()?;
        assert_eq!(status.prompt_text.as_deref(), Some("second"));
        assert_eq!(status.produced_count, 0);
        assert!(status.images.is_empty());
        assert!(status.running);

        h.controller.stop()?;
        let _ = gate.send(Ok(1));
        h.controller.shutdown()?;
        Ok(())
    }

    #[test]
    fn concurrent_starts_launch_a_single_worker() -> anyhow::Result<()> {
        const CALLERS: usize = 8;
        let expander = Arc::new(RecordingExpander::default());
        let (synth, gate) = GatedSynthesizer::new();
        let h = harness(expander.clone(), synth.clone())?;

        let barrier = Arc::new(Barrier::new(CALLERS));
        let callers: Vec<_> = (0..CALLERS)
            .map(|_| {
                let controller = h.controller.clone();
                let barrier = barrier.clone();
                thread::spawn(move || {
                    barrier.wait();
                    controller.start(small("single flight", 1))
                })
            })
            .collect();
        for caller in callers {
            caller
                .join()
                .map_err(|_| anyhow!("caller panicked"))??;
        }
        assert_eq!(h.controller.status()?.target_count, CALLERS as u64);

        for _ in 0..CALLERS {
            gate.send(Ok(1))?;
        }
        let events = wait_for(&h.events, is_complete)?;
        assert_eq!(
            events.last(),
            Some(&GenerationEvent::GenerationComplete {
                total: CALLERS as u64
            })
        );
        assert_eq!(synth.max_active.load(Ordering::SeqCst), 1);
        assert_eq!(synth.threads.lock().map(|t| t.len()).unwrap_or(0), 1);
        assert_eq!(expander.threads.lock().map(|t| t.len()).unwrap_or(0), 1);
        assert_eq!(expander.calls.load(Ordering::SeqCst), 1);
        h.controller.shutdown()?;
        Ok(())
    }

    #[test]
    fn stop_mid_run_keeps_partial_progress() -> anyhow::Result<()> {
        let (synth, gate) = GatedSynthesizer::new();
        let h = harness(Arc::new(RecordingExpander::default()), synth)?;
        h.controller.start(small("prompt A", 5))?;

        gate.send(Ok(1))?;
        wait_for(&h.events, |event| {
            matches!(event, GenerationEvent::NewImage { .. })
        })?;
        h.controller.stop()?;
        let _ = gate.send(Ok(1));
        h.controller.shutdown()?;

        let status = h.controller.status()?;
        assert!(!status.running);
        assert!(status.stop_requested);
        assert_eq!(status.produced_count, 1);
        assert!(!h.events.drain().iter().any(is_complete));
        Ok(())
    }

    #[test]
    fn stop_between_images_of_one_batch_keeps_only_the_first() -> anyhow::Result<()> {
        let h = hooked_harness(
            Arc::new(DryrunSynthesizer::new(3)),
            Box::new(|controller: &SessionController, _: &str| -> anyhow::Result<()> {
                Ok(controller.stop()?)
            }),
        )?;
        h.controller.start(small("harbour at dusk", 5))?;
        wait_for(&h.events, |event| {
            matches!(event, GenerationEvent::NewImage { .. })
        })?;
        h.controller.shutdown()?;

        let status = h.controller.status()?;
        assert!(!status.running);
        assert_eq!(status.produced_count, 1);
        assert_eq!(status.images.len(), 1);
        assert!(exists(&h.images_dir, &status.images[0]));
        let record = h
            .history
            .get(&prompt_id("harbour at dusk"))?
            .ok_or_else(|| anyhow!("history record missing"))?;
        assert_eq!(record.image_paths(), status.images);
        let rest = h.events.drain();
        assert!(new_image_paths(&rest).is_empty());
        assert!(!rest.iter().any(is_complete));
        Ok(())
    }

    #[test]
    fn delete_history_during_persist_leaves_no_orphans() -> anyhow::Result<()> {
        let h = hooked_harness(
            Arc::new(DryrunSynthesizer::new(2)),
            Box::new(
                |controller: &SessionController, prompt_id: &str| -> anyhow::Result<()> {
                    Ok(controller.delete_history(prompt_id)?)
                },
            ),
        )?;
        h.controller.start(small("vanishing", 4))?;
        let id = prompt_id("vanishing");
        let deadline = Instant::now() + WAIT;
        while h.history.get(&id)?.is_some() || h.controller.status()?.running {
            if Instant::now() > deadline {
                bail!("history was never deleted");
            }
            thread::sleep(Duration::from_millis(10));
        }
        h.controller.shutdown()?;

        assert!(!h.images_dir.join(&id).exists());
        assert!(h.history.get(&id)?.is_none());
        let status = h.controller.status()?;
        assert!(status.images.is_empty());
        assert!(status.last_error.is_none());
        let events = h.events.drain();
        assert!(new_image_paths(&events).is_empty());
        assert!(!events
            .iter()
            .any(|event| matches!(event, GenerationEvent::Error { .. })));
        Ok(())
    }

    #[test]
    fn synthesis_failure_reports_error_and_keeps_earlier_images() -> anyhow::Result<()> {
        let (synth, gate) = GatedSynthesizer::new();
        let h = harness(Arc::new(RecordingExpander::default()), synth)?;
        gate.send(Ok(1))?;
        gate.send(Err("render engine exploded".to_string()))?;
        h.controller.start(small("failing", 3))?;

        let events = wait_for(&h.events, |event| {
            matches!(event, GenerationEvent::Error { .. })
        })?;
        let Some(GenerationEvent::Error { message }) = events.last() else {
            bail!("expected an error event");
        };
        assert!(message.contains("render engine exploded"));
        assert_eq!(new_image_paths(&events).len(), 1);

        let status = h.controller.status()?;
        assert!(!status.running);
        assert_eq!(status.produced_count, 1);
        assert!(status
            .last_error
            .as_deref()
            .is_some_and(|err| err.contains("render engine exploded")));
        assert!(exists(&h.images_dir, &status.images[0]));
        let record = h
            .history
            .get(&prompt_id("failing"))?
            .ok_or_else(|| anyhow!("history record missing"))?;
        assert_eq!(record.image_count(), 1);

        // Recovery is an explicit new request.
        assert_eq!(h.controller.add_more(0)?, 3);
        let status = h.controller.status()?;
        assert!(status.running);
        assert!(status.last_error.is_none());
        h.controller.stop()?;
        let _ = gate.send(Ok(1));
        h.controller.shutdown()?;
        Ok(())
    }

    #[test]
    fn expansion_failure_stops_before_synthesis() -> anyhow::Result<()> {
        let expander = Arc::new(RecordingExpander {
            fail_with: Some("model offline".to_string()),
            ..RecordingExpander::default()
        });
        let (synth, _gate) = GatedSynthesizer::new();
        let h = harness(expander, synth.clone())?;
        h.controller.start(small("lake", 2))?;

        let events = wait_for(&h.events, |event| {
            matches!(event, GenerationEvent::Error { .. })
        })?;
        assert!(matches!(
            events.last(),
            Some(GenerationEvent::Error { message }) if message.contains("model offline")
        ));
        h.controller.shutdown()?;
        assert!(!h.controller.status()?.running);
        assert!(synth.threads.lock().map(|t| t.is_empty()).unwrap_or(false));
        Ok(())
    }

    #[test]
    fn start_validates_arguments() -> anyhow::Result<()> {
        let h = dryrun_harness()?;
        assert!(matches!(
            h.controller.start(StartRequest::default()),
            Err(SessionError::InvalidArgument(_))
        ));
        assert!(matches!(
            h.controller.start(StartRequest {
                width: 0,
                ..StartRequest::prompt("lake", 1)
            }),
            Err(SessionError::InvalidArgument(_))
        ));
        assert!(!h.controller.status()?.running);
        // add_more without a prompt only raises the target.
        assert_eq!(h.controller.add_more(3)?, 3);
        assert!(!h.controller.status()?.running);
        Ok(())
    }

    #[test]
    fn delete_image_is_idempotent() -> anyhow::Result<()> {
        let h = dryrun_harness()?;
        h.controller.start(small("lake", 2))?;
        wait_for(&h.events, is_complete)?;
        let status = h.controller.status()?;
        let victim = status.images[0].clone();

        let remaining = h.controller.delete_image(&victim)?;
        assert_eq!(remaining, vec![status.images[1].clone()]);
        assert!(!exists(&h.images_dir, &victim));
        assert_eq!(h.controller.status()?.produced_count, 1);
        let record = h
            .history
            .get(&prompt_id("lake"))?
            .ok_or_else(|| anyhow!("history record missing"))?;
        assert_eq!(record.image_count(), 1);

        assert!(matches!(
            h.controller.delete_image(&victim),
            Err(SessionError::NotFound(_))
        ));
        assert!(matches!(
            h.controller.delete_image("no-slash.png"),
            Err(SessionError::InvalidArgument(_))
        ));
        assert!(matches!(
            h.controller.delete_image("../../etc/passwd"),
            Err(SessionError::InvalidArgument(_))
        ));
        h.controller.shutdown()?;
        Ok(())
    }

    #[test]
    fn switch_prompt_round_trips_history_and_reuses_prompt() -> anyhow::Result<()> {
        let expander = Arc::new(RecordingExpander::default());
        let h = harness(expander.clone(), Arc::new(DryrunSynthesizer::new(1)))?;
        h.controller.start(StartRequest {
            width: 20,
            height: 30,
            ..StartRequest::prompt("lake", 2)
        })?;
        wait_for(&h.events, is_complete)?;
        h.controller.start(small("city", 1))?;
        wait_for(&h.events, is_complete)?;

        let lake = prompt_id("lake");
        let (record, images) = h.controller.switch_prompt(&lake)?;
        let status = h.controller.status()?;
        assert_eq!(status.prompt_text.as_deref(), Some(record.prompt_text.as_str()));
        assert_eq!((status.width, status.height), (20, 30));
        assert_eq!(status.images, images);
        assert_eq!(status.images, record.image_paths());
        assert_eq!(status.target_count, status.produced_count);
        assert!(!status.running);

        assert!(matches!(
            h.controller.switch_prompt("0123456789ab"),
            Err(SessionError::NotFound(_))
        ));

        h.events.drain();
        assert_eq!(h.controller.add_more(1)?, 3);
        let events = wait_for(&h.events, is_complete)?;
        assert_eq!(
            events.last(),
            Some(&GenerationEvent::GenerationComplete { total: 3 })
        );
        assert!(events.iter().any(|event| matches!(
            event,
            GenerationEvent::Log { message } if message.contains("cached")
        )));
        assert_eq!(expander.calls.load(Ordering::SeqCst), 2);
        h.controller.shutdown()?;
        Ok(())
    }

    #[test]
    fn worker_with_nothing_pending_completes_immediately() -> anyhow::Result<()> {
        let h = dryrun_harness()?;
        h.controller.start(small("lake", 1))?;
        wait_for(&h.events, is_complete)?;

        h.controller.add_more(0)?;
        let events = wait_for(&h.events, is_complete)?;
        assert_eq!(events, vec![GenerationEvent::GenerationComplete { total: 1 }]);
        h.controller.shutdown()?;
        assert!(!h.controller.status()?.running);
        Ok(())
    }

    #[test]
    fn reset_mid_batch_keeps_old_images_out_of_new_session() -> anyhow::Result<()> {
        let (synth, gate) = GatedSynthesizer::new();
        let h = harness(Arc::new(RecordingExpander::default()), synth)?;
        h.controller.start(small("old prompt", 2))?;
        h.controller.start(small("new prompt", 1))?;
        gate.send(Ok(1))?;
        gate.send(Ok(1))?;

        let events = wait_for(&h.events, is_complete)?;
        assert_eq!(
            events.last(),
            Some(&GenerationEvent::GenerationComplete { total: 1 })
        );
        let status = h.controller.status()?;
        let fresh = prompt_id("new prompt");
        assert_eq!(status.images.len(), 1);
        assert!(status.images[0].starts_with(&format!("{fresh}/")));
        h.controller.shutdown()?;
        Ok(())
    }

    #[test]
    fn delete_history_removes_directory_and_clears_live_session() -> anyhow::Result<()> {
        let h = dryrun_harness()?;
        h.controller.start(small("lake", 1))?;
        wait_for(&h.events, is_complete)?;
        let id = prompt_id("lake");
        assert!(h.images_dir.join(&id).is_dir());
        assert_eq!(h.controller.history_stats()?.total_images, 1);

        h.controller.delete_history(&id)?;
        assert!(!h.images_dir.join(&id).exists());
        assert!(h.history.get(&id)?.is_none());
        let status = h.controller.status()?;
        assert!(status.images.is_empty());
        assert_eq!(status.prompt_text.as_deref(), Some("lake"));

        assert!(matches!(
            h.controller.delete_history(&id),
            Err(SessionError::NotFound(_))
        ));
        assert!(matches!(
            h.controller.delete_history(".."),
            Err(SessionError::InvalidArgument(_))
        ));
        h.controller.shutdown()?;
        Ok(())
    }
}
