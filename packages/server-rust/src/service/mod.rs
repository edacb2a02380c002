//! Operation classification and execution.
//!
//! 1. **Classification** (`classify`): `JsonRpcRequest` -> `Result<Operation, ClassifyError>`,
//!    with connection ids mapped through `binding`
//! 2. **Middleware** (`middleware`): Tower layers (load shedding, timeout, metrics)
//! 3. **Broker service** (`broker`): Executes operations against the routing engine
//! 4. **Background workers** (`worker`): Pending-correlation expiry

pub mod binding;
pub mod broker;
pub mod classify;
pub mod config;
pub mod middleware;
pub mod operation;
pub mod worker;

pub use binding::{ConnectionBindings, Route};
pub use broker::BrokerService;
pub use classify::OperationClassifier;
pub use config::{ContextBinding, ServerConfig};
pub use middleware::{build_operation_pipeline, OperationPipeline};
pub use operation::{ClassifyError, Operation, OperationContext, OperationError, OperationResponse};
pub use worker::{BackgroundRunnable, BackgroundWorker, ExpirySweeper, ExpiryTask};
