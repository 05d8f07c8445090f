//! Deployment request lifecycle engine.
//!
//! The engine owns every status field in the system: a caller action
//! (submit, approve, reject, scale, destroy, pipeline callback) is
//! validated against the current state and the caller's role, persisted
//! through the request store's conditional updates, and only then
//! followed by pipeline and audit/notification side effects.

pub mod catalog;
pub mod dispatch;
pub mod lifecycle;
pub mod pipeline;
pub mod store;
pub mod transition;

pub use catalog::{CatalogRegistry, Template, YamlCatalog};
pub use dispatch::{
    Dispatcher, NotificationEvent, NotificationKind, NotificationTransport, WebhookTransport,
};
pub use lifecycle::LifecycleEngine;
pub use pipeline::{HttpPipelineGateway, PipelineGateway, PipelineRunState};
pub use store::{MemStore, PgStore, RequestStore};
