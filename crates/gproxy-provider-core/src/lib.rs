//! Core provider abstractions for gproxy.
//!
//! This crate intentionally does **not** depend on axum or any concrete HTTP client.
//! Provider implementations should construct `UpstreamHttpRequest` (and optional
//! internal requests like `upstream_usage`), while a higher layer performs IO.

pub mod config;
pub mod credential;
pub mod errors;
pub mod events;
pub mod headers;
pub mod provider;
pub mod proxy_pool;
pub mod quota;
pub mod registry;

pub use config::{DispatchRule, DispatchTable, OperationKind, ProviderConfig};
pub use credential::{
    AcquireError, Credential, CredentialId, CredentialPool, CredentialState, UnavailableReason,
};
pub use errors::{ProviderError, ProviderResult};
pub use quota::{
    CategoryQuotas, CivilClock, KeySelector, KeyUsageState, ModelCatalog, ModelCategory,
    ModelConfig, QuotaLedger, CONSECUTIVE_429_THRESHOLD, DEFAULT_CIVIL_OFFSET_HOURS,
    format_civil_date, parse_civil_date,
};
pub use events::{
    DownstreamEvent, Event, EventHub, EventSink, ModelUnavailableEndEvent,
    ModelUnavailableStartEvent, OperationalEvent, TerminalEventSink, UnavailableEndEvent,
    UnavailableStartEvent, UpstreamEvent,
};
pub use headers::{Headers, header_get, header_remove, header_set};
pub use proxy_pool::ProxyPool;
pub use provider::{
    AuthRetryAction, HttpMethod, UpstreamBody, UpstreamCtx, UpstreamHttpRequest,
    UpstreamHttpResponse, UpstreamProvider,
};
pub use registry::ProviderRegistry;

// Re-export the protocol/transform typed enums from gproxy-transform.
pub use gproxy_transform::middleware::{
    GenerateContentRequest, GenerateContentResponse, Op, Proto, Request, Response, StreamEvent,
    StreamFormat, TransformContext, TransformError, stream_format,
};

// Re-export usage helpers used by the middleware/engine layer.
pub use gproxy_transform::middleware::{
    OutputAccumulator, UsageAccumulator, UsageSummary, output_for_counting, usage_from_response,
};
