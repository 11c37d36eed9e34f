use std::sync::Arc;

use crate::config::Config;
use crate::index::Indexer;
use crate::pipeline::EventPipeline;
use crate::report::runner::ReportRunner;
use crate::retrieve::Retriever;
use crate::scheduler::Scheduler;
use crate::storage::Pool;

#[derive(Clone)]
pub struct AppState {
    pub pool: Pool,
    pub pipeline: Arc<EventPipeline>,
    pub indexer: Arc<Indexer>,
    pub retriever: Arc<Retriever>,
    pub runner: Arc<ReportRunner>,
    pub scheduler: Scheduler,
    pub config: Arc<Config>,
}
