use std::sync::Arc;

use common::Config;
use saga::SagaCoordinator;

/// Application state shared across handlers. The API side is read/create
/// only; saga mutation belongs to the consumer loop.
#[derive(Clone)]
pub struct AppState {
    pub coordinator: Arc<SagaCoordinator>,
    pub config: Arc<Config>,
}
