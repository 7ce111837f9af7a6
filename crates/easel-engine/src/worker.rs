use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;

use easel_contracts::events::{GenerationEvent, ProgressStatus};
use easel_contracts::paths::ImagePath;
use easel_contracts::prompts::{prompt_id, PromptPair};
use uuid::Uuid;

use crate::controller::Core;
use crate::error::{SessionError, Stage};
use crate::synthesizer::SynthesisRequest;

/// Cooperative cancellation flag shared between the controller and one
/// worker run. The worker polls it at loop-top and between images.
#[derive(Debug, Clone, Default)]
pub struct CancelToken {
    cancelled: Arc<AtomicBool>,
}

impl CancelToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.cancelled.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::SeqCst)
    }
}

#[derive(Debug)]
pub enum WorkerOutcome {
    Completed { total: u64 },
    Stopped,
    Failed(SessionError),
}

pub(crate) struct WorkerTicket {
    pub(crate) id: u64,
    pub(crate) cancel: CancelToken,
}

/// Session fields read at loop-top; the rest of the iteration works from
/// this copy without holding the lock.
struct Iteration {
    epoch: u64,
    prompt_text: String,
    width: u32,
    height: u32,
    reference_image: Option<PathBuf>,
    current: u64,
    total: u64,
}

enum Checkpoint {
    Continue,
    Cancelled,
    Superseded,
}

pub(crate) fn run(core: Arc<Core>, ticket: WorkerTicket) {
    tracing::info!(worker = ticket.id, "generation worker started");
    match drive(&core, &ticket) {
        WorkerOutcome::Completed { total } => {
            tracing::info!(worker = ticket.id, total, "generation complete");
        }
        WorkerOutcome::Stopped => {
            tracing::info!(worker = ticket.id, "generation worker stopped");
        }
        WorkerOutcome::Failed(err) => {
            tracing::warn!(worker = ticket.id, error = %err, "generation worker failed");
        }
    }
}

fn drive(core: &Core, ticket: &WorkerTicket) -> WorkerOutcome {
    loop {
        let job = match begin_iteration(core, ticket) {
            Ok(Ok(job)) => job,
            Ok(Err(outcome)) => return outcome,
            Err(err) => return fail(core, ticket, err),
        };
        core.events.emit(GenerationEvent::Progress {
            current: job.current,
            total: job.total,
            status: ProgressStatus::GeneratingPrompt,
        });

        let pair = match expand_prompt(core, ticket, &job) {
            Ok(pair) => pair,
            Err(err) => return fail(core, ticket, err),
        };
        let prompt_id = match record_prompt(core, ticket, &job, &pair) {
            Ok(Ok(id)) => id,
            Ok(Err(Checkpoint::Superseded)) => continue,
            Ok(Err(_)) => return WorkerOutcome::Stopped,
            Err(err) => return fail(core, ticket, err),
        };

        let (current, total) = progress_counts(core).unwrap_or((job.current, job.total));
        core.events.emit(GenerationEvent::Progress {
            current,
            total,
            status: ProgressStatus::GeneratingImage,
        });

        let request = SynthesisRequest {
            prompt: pair,
            width: job.width,
            height: job.height,
            reference_image: job.reference_image.clone(),
        };
        let batch = match core.synthesizer.synthesize(&request) {
            Ok(batch) if !batch.is_empty() => batch,
            Ok(_) => {
                let err = SessionError::Upstream {
                    stage: Stage::Image,
                    message: format!("{} returned no images", core.synthesizer.name()),
                };
                return fail(core, ticket, err);
            }
            Err(err) => return fail(core, ticket, SessionError::upstream(Stage::Image, &err)),
        };

        let mut superseded = false;
        for bytes in &batch {
            match persist_image(core, ticket, &job, &prompt_id, bytes) {
                Ok(Checkpoint::Continue) => {}
                Ok(Checkpoint::Cancelled) => return WorkerOutcome::Stopped,
                Ok(Checkpoint::Superseded) => {
                    superseded = true;
                    break;
                }
                Err(err) => return fail(core, ticket, err),
            }
        }
        if superseded {
            tracing::debug!(worker = ticket.id, "session re-pointed mid-batch; rereading");
            continue;
        }

        match complete_if_met(core, ticket) {
            Ok(Some(total)) => return WorkerOutcome::Completed { total },
            Ok(None) => {}
            Err(err) => return fail(core, ticket, err),
        }
    }
}

/// Loop-top checkpoint: honours stop requests, finishes when nothing is
/// pending, otherwise snapshots what this iteration should generate.
fn begin_iteration(
    core: &Core,
    ticket: &WorkerTicket,
) -> Result<Result<Iteration, WorkerOutcome>, SessionError> {
    let total = {
        let mut shared = core.lock()?;
        if ticket.cancel.is_cancelled() || !shared.owns(ticket.id) {
            return Ok(Err(WorkerOutcome::Stopped));
        }
        let session = &shared.session;
        if !session.is_target_met() {
            let Some(prompt_text) = session.prompt_text.clone() else {
                return Err(SessionError::InvalidArgument(
                    "session has no prompt to generate".to_string(),
                ));
            };
            return Ok(Ok(Iteration {
                epoch: session.epoch,
                prompt_text,
                width: session.width,
                height: session.height,
                reference_image: session.reference_image.clone(),
                current: session.produced_count,
                total: session.target_count,
            }));
        }
        shared.release_worker(ticket.id);
        shared.session.produced_count
    };
    core.events
        .emit(GenerationEvent::GenerationComplete { total });
    Ok(Err(WorkerOutcome::Completed { total }))
}

fn expand_prompt(
    core: &Core,
    ticket: &WorkerTicket,
    job: &Iteration,
) -> Result<PromptPair, SessionError> {
    let id = prompt_id(&job.prompt_text);
    if let Some(pair) = core.prompt_cache.get(&id) {
        core.events.emit(GenerationEvent::Log {
            message: format!("using cached prompt {id}"),
        });
        return Ok(pair);
    }

    let events = core.events.clone();
    let cancel = ticket.cancel.clone();
    let pair = core
        .expander
        .expand(&job.prompt_text, &mut |chunk| {
            if !cancel.is_cancelled() {
                events.emit(GenerationEvent::Log {
                    message: chunk.to_string(),
                });
            }
        })
        .map_err(|err| SessionError::upstream(Stage::Prompt, &err))?;
    core.prompt_cache.insert(id, pair.clone());
    Ok(pair)
}

/// Stores the expanded prompt in history and on the session. Runs under the
/// session lock so a retired worker can never recreate a deleted record.
fn record_prompt(
    core: &Core,
    ticket: &WorkerTicket,
    job: &Iteration,
    pair: &PromptPair,
) -> Result<Result<String, Checkpoint>, SessionError> {
    let mut shared = core.lock()?;
    if ticket.cancel.is_cancelled() || !shared.owns(ticket.id) {
        return Ok(Err(Checkpoint::Cancelled));
    }
    if shared.session.epoch != job.epoch {
        return Ok(Err(Checkpoint::Superseded));
    }
    let prompt_id = core
        .history
        .upsert(&job.prompt_text, pair, job.width, job.height)
        .map_err(|err| SessionError::storage(&err))?;
    shared.session.set_prompt_pair(&prompt_id, pair);
    Ok(Ok(prompt_id))
}

/// Writes one image of a batch and appends it to history and the live
/// session. Stop and re-point requests are honoured before the write, and the
/// file is written under the session lock so `delete_history` either sees it
/// or retires this worker first.
fn persist_image(
    core: &Core,
    ticket: &WorkerTicket,
    job: &Iteration,
    prompt_id: &str,
    bytes: &[u8],
) -> Result<Checkpoint, SessionError> {
    let filename = format!("{}.png", Uuid::new_v4().simple());
    let path = ImagePath::new(prompt_id, &filename).map_err(|err| SessionError::storage(&err))?;
    {
        let shared = core.lock()?;
        if ticket.cancel.is_cancelled() || !shared.owns(ticket.id) {
            return Ok(Checkpoint::Cancelled);
        }
        if shared.session.epoch != job.epoch {
            return Ok(Checkpoint::Superseded);
        }
        let file = path.resolve(&core.images_dir);
        if let Some(dir) = file.parent() {
            std::fs::create_dir_all(dir)?;
        }
        std::fs::write(&file, bytes)?;
    }

    core.history
        .append_image(prompt_id, &filename)
        .map_err(|err| SessionError::storage(&err))?;

    let (current, total) = {
        let mut shared = core.lock()?;
        if shared.session.epoch != job.epoch {
            return Ok(Checkpoint::Superseded);
        }
        shared.session.push_image(path.to_string());
        (shared.session.produced_count, shared.session.target_count)
    };
    tracing::debug!(worker = ticket.id, path = %path, current, total, "image stored");
    core.events.emit(GenerationEvent::NewImage {
        path: path.to_string(),
        current,
        total,
    });
    core.events.emit(GenerationEvent::Progress {
        current,
        total,
        status: ProgressStatus::Generating,
    });

    if ticket.cancel.is_cancelled() {
        return Ok(Checkpoint::Cancelled);
    }
    Ok(Checkpoint::Continue)
}

/// Marks the session finished when the target is met, under the same lock
/// `start`/`add_more` use, so a concurrent extension is never lost.
fn complete_if_met(core: &Core, ticket: &WorkerTicket) -> Result<Option<u64>, SessionError> {
    let total = {
        let mut shared = core.lock()?;
        if !shared.owns(ticket.id) || !shared.session.is_target_met() {
            return Ok(None);
        }
        shared.release_worker(ticket.id);
        shared.session.produced_count
    };
    core.events
        .emit(GenerationEvent::GenerationComplete { total });
    Ok(Some(total))
}

fn progress_counts(core: &Core) -> Option<(u64, u64)> {
    let shared = core.lock().ok()?;
    Some((shared.session.produced_count, shared.session.target_count))
}

/// Ends the run after an unrecovered error. Only the worker that still owns
/// the session reports it; a superseded worker exits quietly.
fn fail(core: &Core, ticket: &WorkerTicket, err: SessionError) -> WorkerOutcome {
    let message = err.to_string();
    let owned = match core.lock() {
        Ok(mut shared) => {
            let owned = shared.owns(ticket.id);
            if owned {
                shared.release_worker(ticket.id);
                shared.session.last_error = Some(message.clone());
            }
            owned
        }
        // Poisoned: nobody can observe the session any more, report anyway.
        Err(_) => true,
    };
    if !owned || ticket.cancel.is_cancelled() {
        return WorkerOutcome::Stopped;
    }
    core.events.emit(GenerationEvent::Error { message });
    thread::sleep(core.error_backoff);
    WorkerOutcome::Failed(err)
}
