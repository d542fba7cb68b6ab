use std::sync::Arc;

use storm_engine::{SweepState, TemplateRenderer};
use storm_store::EntityStore;

#[derive(Clone)]
pub struct AppState {
    pub entities: EntityStore,
    pub renderer: Arc<dyn TemplateRenderer>,
    pub sweep: Arc<SweepState>,
}

impl AppState {
    pub fn new(entities: EntityStore, renderer: Arc<dyn TemplateRenderer>) -> Self {
        Self { entities, renderer, sweep: Arc::new(SweepState::new()) }
    }
}
