use std::sync::Arc;

use crate::config::Config;
use crate::monitor::MonitorHandle;
use crate::pipeline::PipelineHandle;
use crate::store::Store;

/// Process wide state handed to every session
#[derive(Clone)]
pub struct AppState {
    pub config: Arc<Config>,
    pub store: Arc<dyn Store>,
    pub pipeline: PipelineHandle,
    pub monitor: MonitorHandle,
}
