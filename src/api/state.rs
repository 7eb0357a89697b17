use std::sync::Arc;

use crate::config::EngineConfig;
use crate::detect::engine::DetectionEngine;
use crate::rca::RcaEngine;
use crate::storage::Pool;

/// Shared handler state. Cheap to clone; both engines share the pool.
#[derive(Clone)]
pub struct AppState {
    pub pool: Pool,
    pub config: Arc<EngineConfig>,
    pub detection: DetectionEngine,
    pub rca: RcaEngine,
}

impl AppState {
    pub fn new(pool: Pool, config: EngineConfig) -> Self {
        let detection = DetectionEngine::new(pool.clone(), &config);
        let rca = RcaEngine::new(pool.clone(), &config);
        Self {
            pool,
            config: Arc::new(config),
            detection,
            rca,
        }
    }
}
