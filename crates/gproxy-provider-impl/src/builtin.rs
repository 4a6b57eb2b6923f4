//! Default provider rows seeded into storage on first boot.

use gproxy_provider_core::ProviderConfig;
use gproxy_provider_core::config::{AIStudioConfig, VertexConfig, VertexExpressConfig};

pub struct BuiltinProviderSeed {
    pub name: &'static str,
    pub config_json: serde_json::Value,
    pub enabled: bool,
}

pub fn builtin_provider_seeds() -> Vec<BuiltinProviderSeed> {
    vec![
        BuiltinProviderSeed {
            name: "aistudio",
            config_json: serde_json::to_value(ProviderConfig::AIStudio(AIStudioConfig::default()))
                .expect("aistudio config serializes"),
            enabled: true,
        },
        BuiltinProviderSeed {
            name: "vertex",
            config_json: serde_json::to_value(ProviderConfig::Vertex(VertexConfig::default()))
                .expect("vertex config serializes"),
            enabled: false,
        },
        BuiltinProviderSeed {
            name: "vertexexpress",
            config_json: serde_json::to_value(ProviderConfig::VertexExpress(
                VertexExpressConfig::default(),
            ))
            .expect("vertexexpress config serializes"),
            enabled: false,
        },
    ]
}
