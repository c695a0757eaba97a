pub mod coordinator;
pub mod engine;
pub mod errors;
pub mod repository;
pub mod state;

pub use coordinator::{Outcome, PublishRetryPolicy, SagaCoordinator};
pub use engine::{DropReason, SagaEngine, Step, Transition};
pub use errors::SagaError;
pub use repository::{InMemorySagaStore, PostgresSagaStore, SagaStore, StoreError};
pub use state::{CheckoutState, CompensationStep, ErrorEntry, SagaContext, SagaRecord};
