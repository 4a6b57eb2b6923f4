use std::sync::Arc;

use gproxy_provider_core::ProviderRegistry;

use crate::providers::aistudio::AIStudioProvider;
use crate::providers::vertex::VertexProvider;
use crate::providers::vertexexpress::VertexExpressProvider;

pub fn register_builtin_providers(registry: &mut ProviderRegistry) {
    registry.register(Arc::new(AIStudioProvider));
    registry.register(Arc::new(VertexProvider));
    registry.register(Arc::new(VertexExpressProvider));
}
