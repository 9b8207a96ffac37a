//! Optimistic deal stage moves.
//!
//! Every move, whether it starts from a board drop or from a stage picklist,
//! goes through [`StageMutationController::begin`]. A deal with a pending move
//! ignores further moves until the backend settles. The card is re-parented
//! before the network call and either reconciled with the backend's record or
//! put back where it was.

use std::{collections::HashMap, sync::Arc};

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use shared::{
    domain::{Deal, DealId, StageId},
    protocol::MoveStageResponse,
};
use tokio::{runtime::Handle, sync::broadcast};
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::{
    backend::{BackendError, CrmBackend},
    board::{DropEvent, PipelineBoard},
    cache::CacheStore,
    resource::ResourceFamily,
};

pub const MOVE_FAILED_MESSAGE: &str = "Failed to move deal";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MoveState {
    Pending,
    Committed,
    RolledBack,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MoveOperation {
    pub op_id: Uuid,
    pub deal_id: DealId,
    pub from_stage_id: StageId,
    pub to_stage_id: StageId,
    pub started_at: DateTime<Utc>,
    pub outcome: MoveState,
}

/// Why a move request produced no state transition.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IgnoreReason {
    /// Dropped outside any stage column.
    NoDestination,
    /// Ids on the drop event did not parse.
    InvalidTarget,
    SameStage,
    UnknownDeal,
    UnknownStage,
    /// The deal already has a pending move.
    AlreadyMoving,
}

#[derive(Debug, Clone)]
pub enum MoveOutcome {
    Ignored(IgnoreReason),
    Committed(Deal),
    RolledBack {
        deal_id: DealId,
        stage_id: StageId,
        message: String,
        error: BackendError,
    },
}

impl MoveOutcome {
    pub fn is_ignored(&self) -> bool {
        matches!(self, Self::Ignored(_))
    }

    /// Banner text for a rolled back move.
    pub fn error_message(&self) -> Option<&str> {
        match self {
            Self::RolledBack { message, .. } => Some(message),
            _ => None,
        }
    }
}

#[derive(Debug, Clone)]
pub enum BoardEvent {
    MoveStarted {
        operation: MoveOperation,
    },
    MoveCommitted {
        operation: MoveOperation,
        deal: Deal,
    },
    MoveRolledBack {
        operation: MoveOperation,
        message: String,
    },
    BoardReplaced,
}

struct InFlight {
    operation: MoveOperation,
    original: Deal,
    original_index: usize,
}

struct BoardState {
    board: PipelineBoard,
    in_flight: HashMap<DealId, InFlight>,
}

impl BoardState {
    /// Removes the in-flight marker if it still belongs to `op_id`.
    fn release(&mut self, deal_id: DealId, op_id: Uuid) -> Option<InFlight> {
        match self.in_flight.get(&deal_id) {
            Some(flight) if flight.operation.op_id == op_id => self.in_flight.remove(&deal_id),
            _ => None,
        }
    }
}

#[derive(Clone)]
pub struct StageMutationController {
    backend: Arc<dyn CrmBackend>,
    cache: Arc<CacheStore>,
    state: Arc<Mutex<BoardState>>,
    events: broadcast::Sender<BoardEvent>,
}

impl StageMutationController {
    pub fn new(
        backend: Arc<dyn CrmBackend>,
        cache: Arc<CacheStore>,
        board: PipelineBoard,
    ) -> Self {
        let (events, _) = broadcast::channel(256);
        Self {
            backend,
            cache,
            state: Arc::new(Mutex::new(BoardState {
                board,
                in_flight: HashMap::new(),
            })),
            events,
        }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<BoardEvent> {
        self.events.subscribe()
    }

    /// Snapshot of the board as currently rendered, optimistic placements
    /// included.
    pub fn board(&self) -> PipelineBoard {
        self.state.lock().board.clone()
    }

    /// Installs a freshly loaded board. Cards with a pending move stay in
    /// their destination column until the move settles.
    pub fn replace_board(&self, mut board: PipelineBoard) {
        {
            let mut state = self.state.lock();
            for (deal_id, flight) in state.in_flight.iter_mut() {
                let Some((stage_id, index)) = board.locate(*deal_id) else {
                    continue;
                };
                if let Some(deal) = board.deal(*deal_id) {
                    flight.original = deal.clone();
                    flight.original_index = index;
                }
                if stage_id != flight.operation.to_stage_id {
                    board.reparent(*deal_id, flight.operation.to_stage_id, usize::MAX);
                }
            }
            state.board = board;
        }
        let _ = self.events.send(BoardEvent::BoardReplaced);
    }

    pub fn is_moving(&self, deal_id: DealId) -> bool {
        self.state.lock().in_flight.contains_key(&deal_id)
    }

    pub fn can_drag(&self, deal_id: DealId) -> bool {
        let state = self.state.lock();
        !state.in_flight.contains_key(&deal_id) && state.board.locate(deal_id).is_some()
    }

    pub fn pending_operations(&self) -> Vec<MoveOperation> {
        self.state
            .lock()
            .in_flight
            .values()
            .map(|flight| flight.operation.clone())
            .collect()
    }

    /// Column the card is drawn in right now.
    pub fn rendered_stage(&self, deal_id: DealId) -> Option<StageId> {
        self.state
            .lock()
            .board
            .locate(deal_id)
            .map(|(stage_id, _)| stage_id)
    }

    /// Stage the backend is known to hold. Differs from the rendered stage
    /// only while a move is pending.
    pub fn authoritative_stage(&self, deal_id: DealId) -> Option<StageId> {
        let state = self.state.lock();
        match state.in_flight.get(&deal_id) {
            Some(flight) => Some(flight.original.stage_id),
            None => state.board.deal(deal_id).map(|deal| deal.stage_id),
        }
    }

    /// Entry point for drag-end events.
    pub async fn handle_drop(&self, event: DropEvent) -> MoveOutcome {
        let Some(destination) = event.destination_container_id.as_deref() else {
            debug!(draggable_id = %event.draggable_id, "board: drop outside any stage");
            return MoveOutcome::Ignored(IgnoreReason::NoDestination);
        };
        if destination == event.source_container_id {
            return MoveOutcome::Ignored(IgnoreReason::SameStage);
        }
        let (Ok(deal_id), Ok(to_stage_id)) = (
            event.draggable_id.parse::<DealId>(),
            destination.parse::<StageId>(),
        ) else {
            warn!(
                draggable_id = %event.draggable_id,
                destination,
                "board: drop event with unparsable ids"
            );
            return MoveOutcome::Ignored(IgnoreReason::InvalidTarget);
        };

        self.begin(deal_id, to_stage_id, event.destination_index)
            .await
    }

    /// Picklist path: the card lands at the end of the destination column.
    pub async fn move_deal(&self, deal_id: DealId, to_stage_id: StageId) -> MoveOutcome {
        self.begin(deal_id, to_stage_id, usize::MAX).await
    }

    async fn begin(&self, deal_id: DealId, to_stage_id: StageId, index: usize) -> MoveOutcome {
        let (operation, original) = {
            let mut state = self.state.lock();
            if state.in_flight.contains_key(&deal_id) {
                debug!(deal_id = %deal_id, "board: move ignored, deal already moving");
                return MoveOutcome::Ignored(IgnoreReason::AlreadyMoving);
            }
            if !state.board.has_stage(to_stage_id) {
                return MoveOutcome::Ignored(IgnoreReason::UnknownStage);
            }
            let Some(original) = state.board.deal(deal_id).cloned() else {
                return MoveOutcome::Ignored(IgnoreReason::UnknownDeal);
            };
            if original.stage_id == to_stage_id {
                return MoveOutcome::Ignored(IgnoreReason::SameStage);
            }
            let Some((from_stage_id, original_index)) =
                state.board.reparent(deal_id, to_stage_id, index)
            else {
                return MoveOutcome::Ignored(IgnoreReason::UnknownDeal);
            };

            let operation = MoveOperation {
                op_id: Uuid::new_v4(),
                deal_id,
                from_stage_id,
                to_stage_id,
                started_at: Utc::now(),
                outcome: MoveState::Pending,
            };
            state.in_flight.insert(
                deal_id,
                InFlight {
                    operation: operation.clone(),
                    original: original.clone(),
                    original_index,
                },
            );
            (operation, original)
        };

        info!(
            op_id = %operation.op_id,
            deal_id = %deal_id,
            from_stage = %operation.from_stage_id,
            to_stage = %to_stage_id,
            "board: move started"
        );
        let _ = self.events.send(BoardEvent::MoveStarted {
            operation: operation.clone(),
        });

        let mut guard = PendingMove {
            state: Arc::clone(&self.state),
            cache: Arc::clone(&self.cache),
            events: self.events.clone(),
            deal_id,
            op_id: operation.op_id,
            acknowledged: None,
            aggregates_invalidated: false,
            settled: false,
        };

        match self.backend.move_stage(deal_id, to_stage_id).await {
            Ok(ack) => self.commit(&mut guard, operation, original, ack).await,
            Err(err) => self.rollback(&mut guard, operation, err),
        }
    }

    async fn commit(
        &self,
        guard: &mut PendingMove,
        mut operation: MoveOperation,
        original: Deal,
        ack: MoveStageResponse,
    ) -> MoveOutcome {
        guard.acknowledged = Some(ack.clone());

        // Aggregates are stale from the moment the backend acknowledges.
        invalidate_aggregates(&self.cache).await;
        guard.aggregates_invalidated = true;

        let refreshed = match self.backend.fetch_deal(operation.deal_id).await {
            Ok(deal) => Some(deal),
            Err(err) => {
                warn!(
                    op_id = %operation.op_id,
                    deal_id = %operation.deal_id,
                    error = %err,
                    "board: refetch after move failed, committing from acknowledgement"
                );
                None
            }
        };

        let deal = {
            let mut state = self.state.lock();
            let base = state
                .release(operation.deal_id, operation.op_id)
                .map(|flight| flight.original)
                .unwrap_or(original);
            let deal = refreshed.unwrap_or_else(|| patch_from_ack(&state.board, base, &ack));
            place_committed(&mut state.board, deal.clone());
            deal
        };
        guard.settled = true;

        operation.outcome = MoveState::Committed;
        info!(
            op_id = %operation.op_id,
            deal_id = %operation.deal_id,
            stage_id = %deal.stage_id,
            probability = deal.probability,
            "board: move committed"
        );
        let _ = self.events.send(BoardEvent::MoveCommitted {
            operation,
            deal: deal.clone(),
        });
        MoveOutcome::Committed(deal)
    }

    fn rollback(
        &self,
        guard: &mut PendingMove,
        mut operation: MoveOperation,
        err: BackendError,
    ) -> MoveOutcome {
        {
            let mut state = self.state.lock();
            if let Some(flight) = state.release(operation.deal_id, operation.op_id) {
                state.board.restore(flight.original, flight.original_index);
            }
        }
        guard.settled = true;

        let message = err.user_message(MOVE_FAILED_MESSAGE);
        operation.outcome = MoveState::RolledBack;
        warn!(
            op_id = %operation.op_id,
            deal_id = %operation.deal_id,
            error = %err,
            "board: move rolled back"
        );
        let _ = self.events.send(BoardEvent::MoveRolledBack {
            operation: operation.clone(),
            message: message.clone(),
        });
        MoveOutcome::RolledBack {
            deal_id: operation.deal_id,
            stage_id: operation.from_stage_id,
            message,
            error: err,
        }
    }
}

/// Releases the in-flight marker when a move future is dropped before it
/// settles. An acknowledged move is committed from the acknowledgement,
/// anything else is put back in its origin column.
struct PendingMove {
    state: Arc<Mutex<BoardState>>,
    cache: Arc<CacheStore>,
    events: broadcast::Sender<BoardEvent>,
    deal_id: DealId,
    op_id: Uuid,
    acknowledged: Option<MoveStageResponse>,
    aggregates_invalidated: bool,
    settled: bool,
}

impl Drop for PendingMove {
    fn drop(&mut self) {
        if self.settled {
            return;
        }
        let mut state = self.state.lock();
        let Some(flight) = state.release(self.deal_id, self.op_id) else {
            return;
        };
        let mut operation = flight.operation;

        match self.acknowledged.take() {
            Some(ack) => {
                let deal = patch_from_ack(&state.board, flight.original, &ack);
                place_committed(&mut state.board, deal.clone());
                if !self.aggregates_invalidated {
                    self.spawn_aggregate_invalidation();
                }
                warn!(
                    op_id = %self.op_id,
                    deal_id = %self.deal_id,
                    "board: move abandoned after acknowledgement, committing"
                );
                operation.outcome = MoveState::Committed;
                let _ = self
                    .events
                    .send(BoardEvent::MoveCommitted { operation, deal });
            }
            None => {
                state.board.restore(flight.original, flight.original_index);
                warn!(
                    op_id = %self.op_id,
                    deal_id = %self.deal_id,
                    "board: move abandoned before settlement, restoring card"
                );
                operation.outcome = MoveState::RolledBack;
                let _ = self.events.send(BoardEvent::MoveRolledBack {
                    operation,
                    message: MOVE_FAILED_MESSAGE.to_string(),
                });
            }
        }
    }
}

impl PendingMove {
    /// Drop cannot await, so the cache cleanup runs on the current runtime.
    fn spawn_aggregate_invalidation(&self) {
        let Ok(handle) = Handle::try_current() else {
            warn!(
                deal_id = %self.deal_id,
                "board: no runtime to invalidate deal aggregates after abandoned move"
            );
            return;
        };
        let cache = Arc::clone(&self.cache);
        handle.spawn(async move { invalidate_aggregates(&cache).await });
    }
}

async fn invalidate_aggregates(cache: &CacheStore) {
    for family in ResourceFamily::DEAL_AGGREGATES {
        cache.invalidate_family(family.prefix()).await;
    }
}

fn patch_from_ack(board: &PipelineBoard, mut deal: Deal, ack: &MoveStageResponse) -> Deal {
    deal.stage_id = ack.stage_id;
    deal.probability = ack.probability;
    deal.stage_name = board.stage(ack.stage_id).map(|stage| stage.name.clone());
    deal
}

fn place_committed(board: &mut PipelineBoard, deal: Deal) {
    if board.has_stage(deal.stage_id) {
        board.upsert(deal);
    } else {
        warn!(
            deal_id = %deal.id,
            stage_id = %deal.stage_id,
            "board: committed deal left this board"
        );
        board.remove(deal.id);
    }
}

#[cfg(test)]
#[path = "tests/stage_mutation_tests.rs"]
mod tests;
