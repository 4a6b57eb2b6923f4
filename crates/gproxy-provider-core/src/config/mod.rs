mod dispatch;
mod provider_config;

pub use dispatch::{DispatchRule, DispatchTable, OperationKind};
pub use provider_config::{AIStudioConfig, ProviderConfig, VertexConfig, VertexExpressConfig};
