//! Layers wrapped around `BrokerService`, outermost first: [`load_shed`]
//! caps concurrent calls, [`timeout`] bounds each call, and [`metrics`]
//! records it. [`pipeline`] assembles them.

pub mod load_shed;
pub mod metrics;
pub mod pipeline;
pub mod timeout;

pub use load_shed::LoadShedLayer;
pub use metrics::MetricsLayer;
pub use pipeline::{build_operation_pipeline, OperationPipeline};
pub use timeout::TimeoutLayer;
