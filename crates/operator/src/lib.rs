//! Operator for `CompositeApp`: one logical service running as several versions,
//! each with its own Deployment and autoscaler, behind a shared Service and Istio routing.
pub mod api;
pub mod children;
pub mod config;
pub mod context;
pub mod controller;
pub mod engine;
pub mod error;
pub mod events;
pub mod istio;
pub mod lifecycle;
pub mod logging;
pub mod quantity;
pub mod reconciler;
pub mod status;
pub mod store;
pub mod telemetry;
pub mod test_support;

pub use api::{CompositeApp, CompositeAppSpec, CompositeAppStatus, VersionEntry};
pub use reconciler::{PassOutcome, Reconciler};

// Re-export commonly used symbols for convenience in binaries/tests.
pub use CompositeAppSpec as Spec;
pub use CompositeAppStatus as Status;
