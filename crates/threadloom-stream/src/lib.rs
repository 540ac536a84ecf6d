pub mod coordinator;
pub mod handlers;
pub mod registry;
pub mod session;

pub use coordinator::{StreamCoordinator, StreamEvent};
pub use handlers::{handler_for, GenerationHandler, MergeHandler, PromptHandler};
pub use registry::{FailurePolicy, NodeOutcome, NodeRegistry, PlanRun, RegistrationId};
pub use session::{aggregate_status, StreamSession};
