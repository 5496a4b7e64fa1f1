use std::collections::HashMap;

use magister_storage::{ConversationId, Turn};
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;

use crate::backend::{ConversationBackend, ConversationSummary, LoadedConversation};
use crate::chat::{ControllerInput, ConversationHandle};

/// Outcome of background persistence work, delivered to the controller inbox.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ReconcileEvent {
    Created {
        conversation: ConversationHandle,
        id: ConversationId,
    },
    Opened {
        conversation: ConversationHandle,
        loaded: LoadedConversation,
    },
    OpenFailed {
        conversation: ConversationHandle,
        message: String,
    },
    TitleResolved {
        conversation: ConversationHandle,
        id: ConversationId,
        title: String,
    },
    /// The user picked a title.
    Renamed {
        id: ConversationId,
        title: String,
    },
    Listed {
        conversations: Vec<ConversationSummary>,
    },
    Deleted {
        id: ConversationId,
    },
    Cleared,
    Failed {
        operation: &'static str,
        message: String,
    },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeleteTarget {
    Id(ConversationId),
    Handle(ConversationHandle),
}

#[derive(Debug)]
enum ReconcileJob {
    Mirror {
        conversation: ConversationHandle,
        turns: Vec<Turn>,
    },
    Exchange {
        conversation: ConversationHandle,
        user_text: String,
        assistant_text: String,
        first_user_text: String,
    },
    Open {
        conversation: ConversationHandle,
        id: ConversationId,
    },
    Rename {
        id: ConversationId,
        title: String,
    },
    /// The controller moved on from this handle.
    Release(ConversationHandle),
    List,
    Delete(DeleteTarget),
    DeleteAll,
    Flush(oneshot::Sender<()>),
}

/// Durable identity and title state for one local conversation.
#[derive(Debug, Clone, Copy, Default)]
struct LedgerEntry {
    id: Option<ConversationId>,
    title_resolved: bool,
}

/// Handle to the sequential persistence worker.
///
/// Jobs run strictly in submission order, so lazy creation happens once and every
/// later job for the same conversation sees the new id.
#[derive(Clone)]
pub struct Reconciler {
    jobs: mpsc::UnboundedSender<ReconcileJob>,
}

impl Reconciler {
    pub fn spawn(
        backend: ConversationBackend,
        title_max_chars: usize,
        inbox: mpsc::UnboundedSender<ControllerInput>,
    ) -> (Self, JoinHandle<()>) {
        let (jobs_tx, jobs_rx) = mpsc::unbounded_channel();
        let worker = ReconcileWorker {
            backend,
            title_max_chars,
            inbox,
            ledger: HashMap::new(),
        };
        let task = tokio::spawn(worker.run(jobs_rx));
        (Self { jobs: jobs_tx }, task)
    }

    /// Guest sessions save the settled turns; remote sessions ignore this.
    pub fn mirror(&self, conversation: ConversationHandle, turns: Vec<Turn>) {
        self.submit(ReconcileJob::Mirror {
            conversation,
            turns,
        });
    }

    /// Records one completed exchange and derives the title if it is still the default.
    pub fn record_exchange(
        &self,
        conversation: ConversationHandle,
        user_text: String,
        assistant_text: String,
        first_user_text: String,
    ) {
        self.submit(ReconcileJob::Exchange {
            conversation,
            user_text,
            assistant_text,
            first_user_text,
        });
    }

    pub fn open(&self, conversation: ConversationHandle, id: ConversationId) {
        self.submit(ReconcileJob::Open { conversation, id });
    }

    pub fn rename(&self, id: ConversationId, title: String) {
        self.submit(ReconcileJob::Rename { id, title });
    }

    /// Forgets a handle once no further jobs will name it.
    pub fn release(&self, conversation: ConversationHandle) {
        self.submit(ReconcileJob::Release(conversation));
    }

    pub fn list(&self) {
        self.submit(ReconcileJob::List);
    }

    pub fn delete(&self, target: DeleteTarget) {
        self.submit(ReconcileJob::Delete(target));
    }

    pub fn delete_all(&self) {
        self.submit(ReconcileJob::DeleteAll);
    }

    /// Resolves once every job submitted before it has finished.
    pub async fn flush(&self) {
        let (done_tx, done_rx) = oneshot::channel();
        self.submit(ReconcileJob::Flush(done_tx));
        let _ = done_rx.await;
    }

    fn submit(&self, job: ReconcileJob) {
        if self.jobs.send(job).is_err() {
            tracing::warn!("reconcile worker has stopped; dropping job");
        }
    }
}

struct ReconcileWorker {
    backend: ConversationBackend,
    title_max_chars: usize,
    inbox: mpsc::UnboundedSender<ControllerInput>,
    ledger: HashMap<ConversationHandle, LedgerEntry>,
}

impl ReconcileWorker {
    async fn run(mut self, mut jobs: mpsc::UnboundedReceiver<ReconcileJob>) {
        while let Some(job) = jobs.recv().await {
            self.handle(job).await;
        }
        tracing::debug!("reconcile worker stopped");
    }

    async fn handle(&mut self, job: ReconcileJob) {
        match job {
            ReconcileJob::Mirror {
                conversation,
                turns,
            } => self.mirror(conversation, turns).await,
            ReconcileJob::Exchange {
                conversation,
                user_text,
                assistant_text,
                first_user_text,
            } => {
                self.record_exchange(conversation, &user_text, &assistant_text, &first_user_text)
                    .await
            }
            ReconcileJob::Open { conversation, id } => self.open(conversation, id).await,
            ReconcileJob::Rename { id, title } => self.rename(id, &title).await,
            ReconcileJob::Release(conversation) => {
                self.ledger.remove(&conversation);
            }
            ReconcileJob::List => match self.backend.list().await {
                Ok(conversations) => self.emit(ReconcileEvent::Listed { conversations }),
                Err(error) => self.fail("list-conversations", &error),
            },
            ReconcileJob::Delete(target) => self.delete(target).await,
            ReconcileJob::DeleteAll => match self.backend.delete_all().await {
                Ok(()) => {
                    self.ledger.clear();
                    self.emit(ReconcileEvent::Cleared);
                }
                Err(error) => self.fail("delete-all-conversations", &error),
            },
            ReconcileJob::Flush(done) => {
                let _ = done.send(());
            }
        }
    }

    async fn mirror(&mut self, conversation: ConversationHandle, turns: Vec<Turn>) {
        if !self.backend.is_guest() {
            return;
        }
        let Some(id) = self.ensure_conversation(conversation).await else {
            return;
        };
        if let Err(error) = self.backend.mirror_turns(id, turns).await {
            self.fail("mirror-turns", &error);
        }
    }

    async fn record_exchange(
        &mut self,
        conversation: ConversationHandle,
        user_text: &str,
        assistant_text: &str,
        first_user_text: &str,
    ) {
        let Some(id) = self.ensure_conversation(conversation).await else {
            return;
        };

        if let Err(error) = self
            .backend
            .submit_exchange(id, user_text, assistant_text)
            .await
        {
            self.fail("submit-exchange", &error);
        }

        let entry = self.ledger.entry(conversation).or_default();
        if entry.title_resolved {
            return;
        }
        // One attempt per conversation, successful or not.
        entry.title_resolved = true;

        match self
            .backend
            .resolve_title(id, first_user_text, self.title_max_chars)
            .await
        {
            Ok(title) => self.emit(ReconcileEvent::TitleResolved {
                conversation,
                id,
                title,
            }),
            Err(error) => self.fail("resolve-title", &error),
        }
    }

    async fn open(&mut self, conversation: ConversationHandle, id: ConversationId) {
        match self.backend.open(id).await {
            Ok(loaded) => {
                self.ledger.insert(
                    conversation,
                    LedgerEntry {
                        id: Some(loaded.summary.id),
                        title_resolved: !loaded.summary.has_default_title(),
                    },
                );
                self.emit(ReconcileEvent::Opened {
                    conversation,
                    loaded,
                });
            }
            Err(error) => {
                tracing::warn!(conversation = ?conversation, id = %id, error = %error, "failed to open conversation");
                self.emit(ReconcileEvent::OpenFailed {
                    conversation,
                    message: error.to_string(),
                });
            }
        }
    }

    async fn rename(&mut self, id: ConversationId, title: &str) {
        match self.backend.rename(id, title).await {
            Ok(title) => {
                // A chosen title is never replaced by a derived one.
                for entry in self.ledger.values_mut() {
                    if entry.id == Some(id) {
                        entry.title_resolved = true;
                    }
                }
                self.emit(ReconcileEvent::Renamed { id, title });
            }
            Err(error) => self.fail("rename-conversation", &error),
        }
    }

    async fn delete(&mut self, target: DeleteTarget) {
        let id = match target {
            DeleteTarget::Id(id) => Some(id),
            DeleteTarget::Handle(conversation) => self
                .ledger
                .remove(&conversation)
                .and_then(|entry| entry.id),
        };
        // Nothing durable exists yet for a conversation that never got an id.
        let Some(id) = id else {
            return;
        };
        self.ledger.retain(|_, entry| entry.id != Some(id));

        match self.backend.delete(id).await {
            Ok(()) => self.emit(ReconcileEvent::Deleted { id }),
            Err(error) => self.fail("delete-conversation", &error),
        }
    }

    /// Returns the durable id, creating the conversation on first use.
    async fn ensure_conversation(&mut self, conversation: ConversationHandle) -> Option<ConversationId> {
        if let Some(id) = self.ledger.get(&conversation).and_then(|entry| entry.id) {
            return Some(id);
        }

        match self.backend.create().await {
            Ok(summary) => {
                let entry = self.ledger.entry(conversation).or_default();
                entry.id = Some(summary.id);
                self.emit(ReconcileEvent::Created {
                    conversation,
                    id: summary.id,
                });
                Some(summary.id)
            }
            Err(error) => {
                self.fail("create-conversation", &error);
                None
            }
        }
    }

    fn fail(&self, operation: &'static str, error: &crate::backend::BackendError) {
        tracing::warn!(operation, error = %error, "persistence operation failed");
        self.emit(ReconcileEvent::Failed {
            operation,
            message: error.to_string(),
        });
    }

    fn emit(&self, event: ReconcileEvent) {
        let _ = self.inbox.send(ControllerInput::Reconciled(event));
    }
}
