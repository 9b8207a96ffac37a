//! Test doubles shared by the client_core test modules.

use std::{
    collections::{HashMap, VecDeque},
    time::Duration,
};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde_json::Value;
use shared::{
    domain::{Deal, DealId, DealStatus, PipelineId, PipelineStage, StageId},
    protocol::MoveStageResponse,
};
use tokio::sync::{oneshot, Notify};

use crate::{
    backend::{BackendError, CrmBackend, Mutation},
    board::PipelineBoard,
    cache::Clock,
    resource::ResourceKey,
};

pub(crate) const PIPELINE: PipelineId = PipelineId(1);
pub(crate) const S1: StageId = StageId(1);
pub(crate) const S2: StageId = StageId(2);
pub(crate) const S3: StageId = StageId(3);
pub(crate) const TTL: Duration = Duration::from_secs(300);

pub(crate) struct ManualClock {
    now: Mutex<DateTime<Utc>>,
}

impl ManualClock {
    pub(crate) fn new() -> Self {
        Self {
            now: Mutex::new(
                DateTime::<Utc>::from_timestamp(1_700_000_000, 0).expect("fixed start time"),
            ),
        }
    }

    pub(crate) fn advance(&self, by: Duration) {
        let mut now = self.now.lock();
        *now += chrono::Duration::from_std(by).expect("duration in range");
    }
}

impl Clock for ManualClock {
    fn now(&self) -> DateTime<Utc> {
        *self.now.lock()
    }
}

pub(crate) fn stage(id: StageId, name: &str, order: i32, probability: u8) -> PipelineStage {
    PipelineStage {
        id,
        name: name.to_string(),
        order,
        win_probability_percent: probability,
    }
}

pub(crate) fn stages() -> Vec<PipelineStage> {
    vec![
        stage(S1, "Lead", 1, 10),
        stage(S2, "Qualified", 2, 40),
        stage(S3, "Proposal", 3, 70),
    ]
}

pub(crate) fn deal(id: i64, stage_id: StageId) -> Deal {
    let stage = stages()
        .into_iter()
        .find(|stage| stage.id == stage_id)
        .expect("fixture stage");
    Deal {
        id: DealId(id),
        title: format!("Deal {id}"),
        stage_id,
        stage_name: Some(stage.name),
        pipeline_id: PIPELINE,
        value: 1000.0 * id as f64,
        currency: "USD".to_string(),
        status: DealStatus::Open,
        probability: stage.win_probability_percent,
        assigned_to_user_id: None,
        updated_at: None,
    }
}

pub(crate) fn board_with(deals: Vec<Deal>) -> PipelineBoard {
    PipelineBoard::new(Some(PIPELINE), stages(), deals)
}

/// In-memory backend whose answers are scripted per test.
pub(crate) struct ScriptedBackend {
    stages: Vec<PipelineStage>,
    deals: Mutex<HashMap<DealId, Deal>>,
    resources: Mutex<HashMap<String, Result<Value, BackendError>>>,
    fetch_calls: Mutex<Vec<ResourceKey>>,
    move_failures: Mutex<HashMap<DealId, VecDeque<BackendError>>>,
    move_gates: Mutex<HashMap<DealId, oneshot::Receiver<()>>>,
    move_calls: Mutex<Vec<(DealId, StageId)>>,
    move_started: Notify,
    refetch_gates: Mutex<HashMap<DealId, oneshot::Receiver<()>>>,
    refetch_started: Notify,
    refetch_failure: Mutex<Option<BackendError>>,
    mutations: Mutex<Vec<Mutation>>,
    mutation_failure: Mutex<Option<BackendError>>,
}

impl ScriptedBackend {
    pub(crate) fn new() -> Self {
        Self {
            stages: stages(),
            deals: Mutex::new(HashMap::new()),
            resources: Mutex::new(HashMap::new()),
            fetch_calls: Mutex::new(Vec::new()),
            move_failures: Mutex::new(HashMap::new()),
            move_gates: Mutex::new(HashMap::new()),
            move_calls: Mutex::new(Vec::new()),
            move_started: Notify::new(),
            refetch_gates: Mutex::new(HashMap::new()),
            refetch_started: Notify::new(),
            refetch_failure: Mutex::new(None),
            mutations: Mutex::new(Vec::new()),
            mutation_failure: Mutex::new(None),
        }
    }

    pub(crate) fn with_deals(self, deals: impl IntoIterator<Item = Deal>) -> Self {
        {
            let mut guard = self.deals.lock();
            for deal in deals {
                guard.insert(deal.id, deal);
            }
        }
        self
    }

    pub(crate) fn respond(&self, resource: &ResourceKey, result: Result<Value, BackendError>) {
        self.resources.lock().insert(resource.to_string(), result);
    }

    pub(crate) fn fail_next_move(&self, deal_id: DealId, err: BackendError) {
        self.move_failures
            .lock()
            .entry(deal_id)
            .or_default()
            .push_back(err);
    }

    /// Holds the next `move_stage` call for `deal_id` open until the returned
    /// sender fires (or is dropped).
    pub(crate) fn hold_next_move(&self, deal_id: DealId) -> oneshot::Sender<()> {
        let (tx, rx) = oneshot::channel();
        self.move_gates.lock().insert(deal_id, rx);
        tx
    }

    /// Same as [`Self::hold_next_move`] for the refetch that follows a move.
    pub(crate) fn hold_next_refetch(&self, deal_id: DealId) -> oneshot::Sender<()> {
        let (tx, rx) = oneshot::channel();
        self.refetch_gates.lock().insert(deal_id, rx);
        tx
    }

    pub(crate) async fn wait_for_refetch_call(&self) {
        self.refetch_started.notified().await;
    }

    pub(crate) fn fail_refetch(&self, err: BackendError) {
        *self.refetch_failure.lock() = Some(err);
    }

    pub(crate) fn fail_mutations(&self, err: BackendError) {
        *self.mutation_failure.lock() = Some(err);
    }

    pub(crate) async fn wait_for_move_call(&self) {
        self.move_started.notified().await;
    }

    pub(crate) fn fetch_count(&self, resource: &ResourceKey) -> usize {
        self.fetch_calls
            .lock()
            .iter()
            .filter(|called| *called == resource)
            .count()
    }

    pub(crate) fn move_calls(&self) -> Vec<(DealId, StageId)> {
        self.move_calls.lock().clone()
    }

    pub(crate) fn mutations(&self) -> Vec<Mutation> {
        self.mutations.lock().clone()
    }

    pub(crate) fn server_deal(&self, deal_id: DealId) -> Option<Deal> {
        self.deals.lock().get(&deal_id).cloned()
    }
}

#[async_trait]
impl CrmBackend for ScriptedBackend {
    async fn fetch(&self, resource: &ResourceKey) -> Result<Value, BackendError> {
        self.fetch_calls.lock().push(resource.clone());
        self.resources
            .lock()
            .get(&resource.to_string())
            .cloned()
            .unwrap_or_else(|| {
                Err(BackendError::NotFound {
                    detail: Some(format!("no scripted response for {resource}")),
                })
            })
    }

    async fn fetch_deal(&self, deal_id: DealId) -> Result<Deal, BackendError> {
        self.refetch_started.notify_one();
        let gate = self.refetch_gates.lock().remove(&deal_id);
        if let Some(gate) = gate {
            let _ = gate.await;
        }

        if let Some(err) = self.refetch_failure.lock().clone() {
            return Err(err);
        }
        self.deals
            .lock()
            .get(&deal_id)
            .cloned()
            .ok_or(BackendError::NotFound {
                detail: Some("Not found.".to_string()),
            })
    }

    async fn move_stage(
        &self,
        deal_id: DealId,
        stage_id: StageId,
    ) -> Result<MoveStageResponse, BackendError> {
        self.move_calls.lock().push((deal_id, stage_id));
        self.move_started.notify_one();

        let gate = self.move_gates.lock().remove(&deal_id);
        if let Some(gate) = gate {
            let _ = gate.await;
        }

        let failure = self
            .move_failures
            .lock()
            .get_mut(&deal_id)
            .and_then(VecDeque::pop_front);
        if let Some(err) = failure {
            return Err(err);
        }

        let target = self
            .stages
            .iter()
            .find(|stage| stage.id == stage_id)
            .cloned()
            .ok_or(BackendError::Validation {
                detail: Some("Invalid stage.".to_string()),
            })?;

        let mut deals = self.deals.lock();
        let deal = deals.get_mut(&deal_id).ok_or(BackendError::NotFound {
            detail: Some("Not found.".to_string()),
        })?;
        deal.stage_id = target.id;
        deal.stage_name = Some(target.name.clone());
        deal.probability = target.win_probability_percent;

        Ok(MoveStageResponse {
            detail: Some("Stage moved".to_string()),
            stage_id: target.id,
            probability: target.win_probability_percent,
        })
    }

    async fn mutate(&self, mutation: &Mutation) -> Result<Value, BackendError> {
        self.mutations.lock().push(mutation.clone());
        if let Some(err) = self.mutation_failure.lock().clone() {
            return Err(err);
        }
        Ok(serde_json::json!({ "detail": "ok" }))
    }
}
