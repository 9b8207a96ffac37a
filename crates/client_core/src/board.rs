//! Local view model of a pipeline board: ordered stage columns holding deal
//! cards. This is what the UI renders, including optimistic placements.

use shared::{
    domain::{Deal, DealId, PipelineId, PipelineStage, StageId},
    protocol::DealsByStageResponse,
};
use tracing::warn;

/// Drag-end notification from the UI. Container ids are stage ids and the
/// draggable id is a deal id, all rendered as strings.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DropEvent {
    pub draggable_id: String,
    pub source_container_id: String,
    pub destination_container_id: Option<String>,
    pub destination_index: usize,
}

#[derive(Debug, Clone, PartialEq)]
pub struct StageColumn {
    pub stage: PipelineStage,
    pub deals: Vec<Deal>,
}

impl StageColumn {
    pub fn total_value(&self) -> f64 {
        self.deals.iter().map(|deal| deal.value).sum()
    }
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct PipelineBoard {
    pipeline_id: Option<PipelineId>,
    columns: Vec<StageColumn>,
}

impl PipelineBoard {
    pub fn new(
        pipeline_id: Option<PipelineId>,
        mut stages: Vec<PipelineStage>,
        deals: Vec<Deal>,
    ) -> Self {
        stages.sort_by_key(|stage| (stage.order, stage.id));
        let mut board = Self {
            pipeline_id,
            columns: stages
                .into_iter()
                .map(|stage| StageColumn {
                    stage,
                    deals: Vec::new(),
                })
                .collect(),
        };

        for deal in deals {
            match board.column_mut(deal.stage_id) {
                Some(column) => column.deals.push(deal),
                None => warn!(
                    deal_id = %deal.id,
                    stage_id = %deal.stage_id,
                    "dropping deal whose stage is not on the board"
                ),
            }
        }
        board
    }

    pub fn from_by_stage(pipeline_id: Option<PipelineId>, response: DealsByStageResponse) -> Self {
        let mut stages = Vec::with_capacity(response.len());
        let mut deals = Vec::new();
        for bucket in response.into_values() {
            let stage: PipelineStage = bucket.stage.into();
            deals.extend(bucket.deals.into_iter().map(|payload| {
                let mut deal: Deal = payload.into();
                // Bucket membership is authoritative for placement.
                deal.stage_id = stage.id;
                if deal.stage_name.is_none() {
                    deal.stage_name = Some(stage.name.clone());
                }
                deal
            }));
            stages.push(stage);
        }
        Self::new(pipeline_id, stages, deals)
    }

    pub fn pipeline_id(&self) -> Option<PipelineId> {
        self.pipeline_id
    }

    pub fn columns(&self) -> &[StageColumn] {
        &self.columns
    }

    pub fn stage(&self, stage_id: StageId) -> Option<&PipelineStage> {
        self.column(stage_id).map(|column| &column.stage)
    }

    pub fn has_stage(&self, stage_id: StageId) -> bool {
        self.column(stage_id).is_some()
    }

    pub fn deals_in(&self, stage_id: StageId) -> &[Deal] {
        self.column(stage_id)
            .map(|column| column.deals.as_slice())
            .unwrap_or_default()
    }

    pub fn stage_total(&self, stage_id: StageId) -> f64 {
        self.column(stage_id)
            .map(StageColumn::total_value)
            .unwrap_or_default()
    }

    pub fn deal_count(&self) -> usize {
        self.columns.iter().map(|column| column.deals.len()).sum()
    }

    /// Column and index the deal card is currently rendered at.
    pub fn locate(&self, deal_id: DealId) -> Option<(StageId, usize)> {
        self.columns.iter().find_map(|column| {
            column
                .deals
                .iter()
                .position(|deal| deal.id == deal_id)
                .map(|index| (column.stage.id, index))
        })
    }

    pub fn deal(&self, deal_id: DealId) -> Option<&Deal> {
        self.columns
            .iter()
            .flat_map(|column| column.deals.iter())
            .find(|deal| deal.id == deal_id)
    }

    /// Moves the card into `to` at `index` (clamped to the column length),
    /// rewriting only its `stage_id`. Returns the previous position.
    pub fn reparent(
        &mut self,
        deal_id: DealId,
        to: StageId,
        index: usize,
    ) -> Option<(StageId, usize)> {
        if !self.has_stage(to) {
            return None;
        }
        let (from, from_index) = self.locate(deal_id)?;
        let mut deal = self.column_mut(from)?.deals.remove(from_index);
        deal.stage_id = to;
        let column = self.column_mut(to)?;
        let index = index.min(column.deals.len());
        column.deals.insert(index, deal);
        Some((from, from_index))
    }

    /// Puts `deal` back exactly as given at `index` in its own stage column,
    /// replacing whatever card with the same id is on the board.
    pub fn restore(&mut self, deal: Deal, index: usize) -> bool {
        self.remove(deal.id);
        match self.column_mut(deal.stage_id) {
            Some(column) => {
                let index = index.min(column.deals.len());
                column.deals.insert(index, deal);
                true
            }
            None => false,
        }
    }

    /// Replaces the card's record. The card keeps its slot when the stage is
    /// unchanged and is appended to the new column otherwise.
    pub fn upsert(&mut self, deal: Deal) -> bool {
        match self.locate(deal.id) {
            Some((stage_id, index)) if stage_id == deal.stage_id => match self.column_mut(stage_id) {
                Some(column) => {
                    column.deals[index] = deal;
                    true
                }
                None => false,
            },
            _ => self.restore(deal, usize::MAX),
        }
    }

    pub fn remove(&mut self, deal_id: DealId) -> Option<Deal> {
        let (stage_id, index) = self.locate(deal_id)?;
        self.column_mut(stage_id)
            .map(|column| column.deals.remove(index))
    }

    fn column(&self, stage_id: StageId) -> Option<&StageColumn> {
        self.columns.iter().find(|column| column.stage.id == stage_id)
    }

    fn column_mut(&mut self, stage_id: StageId) -> Option<&mut StageColumn> {
        self.columns
            .iter_mut()
            .find(|column| column.stage.id == stage_id)
    }
}
