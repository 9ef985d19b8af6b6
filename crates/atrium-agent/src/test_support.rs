//! Test doubles shared by the unit tests of this crate.

use std::collections::{BTreeMap, HashMap, VecDeque};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, TimeZone, Utc};

use atrium_booking::{BookingAllocator, EventFeed};
use atrium_core::clock::{Clock, ManualClock};
use atrium_core::config::{ProjectConfig, ScheduleConfig, WorkHours};
use atrium_core::journal::{BookingJournal, MemoryJournal};
use atrium_core::types::ConversationKey;
use atrium_queue::{Fragment, Turn, TurnId};
use atrium_storage::{Database, DialogueRepository, FeedbackRepository};

use crate::credentials::CredentialPool;
use crate::error::{AgentError, ModelError};
use crate::gateway::AiGateway;
use crate::model::{CompletionRequest, LanguageModel, Purpose};
use crate::processor::TurnProcessor;
use crate::registry::ProjectRegistry;
use crate::sink::{OutboundReply, ReplySink};

/// Language model answering from a per-purpose script. An exhausted script
/// answers `Unavailable`.
pub(crate) struct ScriptedModel {
    script: Mutex<HashMap<Purpose, VecDeque<Result<String, ModelError>>>>,
    calls: Mutex<Vec<(String, CompletionRequest)>>,
    delay: Option<Duration>,
}

impl ScriptedModel {
    pub(crate) fn new() -> Self {
        Self {
            script: Mutex::new(HashMap::new()),
            calls: Mutex::new(Vec::new()),
            delay: None,
        }
    }

    pub(crate) fn with_delay(delay: Duration) -> Self {
        Self {
            delay: Some(delay),
            ..Self::new()
        }
    }

    pub(crate) fn push(&self, purpose: Purpose, response: Result<String, ModelError>) {
        self.script
            .lock()
            .unwrap()
            .entry(purpose)
            .or_default()
            .push_back(response);
    }

    pub(crate) fn keys_used(&self) -> Vec<String> {
        self.calls
            .lock()
            .unwrap()
            .iter()
            .map(|(key, _)| key.clone())
            .collect()
    }

    pub(crate) fn prompts(&self, purpose: Purpose) -> Vec<String> {
        self.calls
            .lock()
            .unwrap()
            .iter()
            .filter(|(_, r)| r.purpose == purpose)
            .map(|(_, r)| r.prompt.clone())
            .collect()
    }
}

#[async_trait]
impl LanguageModel for ScriptedModel {
    async fn complete(
        &self,
        api_key: &str,
        request: &CompletionRequest,
    ) -> Result<String, ModelError> {
        self.calls
            .lock()
            .unwrap()
            .push((api_key.to_string(), request.clone()));
        if let Some(delay) = self.delay {
            tokio::time::sleep(delay).await;
        }
        self.script
            .lock()
            .unwrap()
            .get_mut(&request.purpose)
            .and_then(|queue| queue.pop_front())
            .unwrap_or_else(|| Err(ModelError::Unavailable("no scripted response".to_string())))
    }
}

#[derive(Default)]
pub(crate) struct RecordingSink {
    pub(crate) replies: Mutex<Vec<OutboundReply>>,
}

impl RecordingSink {
    pub(crate) fn texts(&self) -> Vec<String> {
        self.replies
            .lock()
            .unwrap()
            .iter()
            .map(|r| r.text.clone())
            .collect()
    }

    /// Poll until `count` replies arrived or two seconds passed.
    pub(crate) async fn wait_for(&self, count: usize) -> Vec<OutboundReply> {
        for _ in 0..200 {
            {
                let replies = self.replies.lock().unwrap();
                if replies.len() >= count {
                    return replies.clone();
                }
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        self.replies.lock().unwrap().clone()
    }
}

#[async_trait]
impl ReplySink for RecordingSink {
    async fn deliver(&self, reply: &OutboundReply) -> Result<(), AgentError> {
        self.replies.lock().unwrap().push(reply.clone());
        Ok(())
    }
}

pub(crate) fn salon() -> ProjectConfig {
    ProjectConfig {
        project_id: "salon".to_string(),
        name: "Salon Aurora".to_string(),
        specialists: vec!["Anna".to_string(), "Olga".to_string()],
        sheet_id: None,
        reply_webhook: None,
        services: BTreeMap::from([
            ("Haircut".to_string(), 2),
            ("Manicure".to_string(), 1),
        ]),
        work_hours: WorkHours::default(),
    }
}

/// Monday 2026-03-02 08:00 UTC.
pub(crate) fn monday_morning() -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2026, 3, 2, 8, 0, 0).unwrap()
}

pub(crate) fn turn(client: &str, seq: u64, texts: &[&str]) -> Turn {
    let at = monday_morning();
    Turn {
        id: TurnId::new(),
        key: ConversationKey::new("salon", client),
        seq,
        fragments: texts
            .iter()
            .map(|t| Fragment {
                text: t.to_string(),
                received_at: at,
            })
            .collect(),
        attempt: 1,
        created_at: at,
    }
}

/// A processor over in-memory storage with the salon project registered.
pub(crate) struct Harness {
    pub(crate) processor: Arc<TurnProcessor>,
    pub(crate) model: Arc<ScriptedModel>,
    pub(crate) sink: Arc<RecordingSink>,
    pub(crate) allocator: Arc<BookingAllocator>,
    pub(crate) dialogues: Arc<DialogueRepository>,
    pub(crate) feedback: Arc<FeedbackRepository>,
    pub(crate) clock: Arc<ManualClock>,
}

impl Harness {
    pub(crate) fn new() -> Self {
        Self::with_model(ScriptedModel::new())
    }

    pub(crate) fn with_model(model: ScriptedModel) -> Self {
        let model = Arc::new(model);
        let clock = Arc::new(ManualClock::new(monday_morning()));
        let schedule = ScheduleConfig {
            slot_minutes: 30,
            horizon_days: 30,
            utc_offset_minutes: 0,
        };
        let allocator = Arc::new(
            BookingAllocator::new(
                &salon(),
                schedule.slot_minutes,
                Arc::new(MemoryJournal::new()) as Arc<dyn BookingJournal>,
                Arc::new(EventFeed::new()),
            )
            .unwrap(),
        );
        let mut registry = ProjectRegistry::new();
        registry.insert(salon(), Arc::clone(&allocator));

        let db = Arc::new(Database::in_memory().unwrap());
        let dialogues = Arc::new(DialogueRepository::new(Arc::clone(&db)));
        let feedback = Arc::new(FeedbackRepository::new(db));
        let gateway = Arc::new(AiGateway::new(
            Arc::clone(&model) as Arc<dyn LanguageModel>,
            CredentialPool::new(vec!["k1".to_string()], Duration::from_secs(60)),
            2000,
        ));
        let sink = Arc::new(RecordingSink::default());
        let processor = Arc::new(TurnProcessor::new(
            Arc::new(registry),
            gateway,
            Arc::clone(&dialogues),
            Arc::clone(&feedback),
            Arc::clone(&sink) as Arc<dyn ReplySink>,
            Arc::clone(&clock) as Arc<dyn Clock>,
            schedule,
            10,
        ));
        Self {
            processor,
            model,
            sink,
            allocator,
            dialogues,
            feedback,
            clock,
        }
    }

    pub(crate) fn script(&self, purpose: Purpose, text: &str) {
        self.model.push(purpose, Ok(text.to_string()));
    }
}
