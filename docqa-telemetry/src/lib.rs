//! Tracing setup for docqa services.
//!
//! - [`init_telemetry`] - human-readable logs filtered by `RUST_LOG` (default `info`)
//! - [`init_json_telemetry`] - the same as one JSON object per line
//! - [`init_with_storage`] - logs plus an [`InMemorySpanLayer`] capturing
//!   closed spans by `request.id`
//!
//! # Example
//!
//! ```rust,ignore
//! let storage = docqa_telemetry::SpanStorage::new();
//! docqa_telemetry::init_with_storage("docqa", storage.clone())?;
//! // ... handle a request ...
//! for id in storage.request_ids() {
//!     println!("{id}: {} spans", storage.get(&id).unwrap_or_default().len());
//! }
//! ```

mod memory;

pub use memory::{InMemorySpanLayer, REQUEST_ID_FIELD, SpanData, SpanStorage};

use tracing::Subscriber;
use tracing_subscriber::util::TryInitError;
use tracing_subscriber::{EnvFilter, Layer, fmt, layer::SubscriberExt, util::SubscriberInitExt};

fn env_filter() -> EnvFilter {
    EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"))
}

/// Install a fmt subscriber as the global default.
///
/// # Errors
///
/// Fails if a global subscriber is already installed.
pub fn init_telemetry(service_name: &str) -> Result<(), TryInitError> {
    tracing_subscriber::registry()
        .with(fmt::layer().with_target(true))
        .with(env_filter())
        .try_init()?;
    tracing::info!(service = service_name, "telemetry initialized");
    Ok(())
}

/// Install a JSON-lines subscriber as the global default.
pub fn init_json_telemetry(service_name: &str) -> Result<(), TryInitError> {
    tracing_subscriber::registry()
        .with(fmt::layer().json().with_current_span(true))
        .with(env_filter())
        .try_init()?;
    tracing::info!(service = service_name, "telemetry initialized");
    Ok(())
}

/// Install fmt logging plus span capture into `storage` as the global default.
///
/// The log filter applies to the fmt output only; every span with a request
/// id is captured regardless of level.
pub fn init_with_storage(service_name: &str, storage: SpanStorage) -> Result<(), TryInitError> {
    tracing_subscriber::registry()
        .with(fmt::layer().with_filter(env_filter()))
        .with(InMemorySpanLayer::new(storage))
        .try_init()?;
    tracing::info!(service = service_name, "telemetry initialized");
    Ok(())
}

/// A subscriber that only captures spans into `storage`.
///
/// Meant for scoped use with `tracing::subscriber::set_default`, e.g. in tests
/// that must not depend on the global subscriber.
pub fn storage_subscriber(storage: SpanStorage) -> impl Subscriber + Send + Sync + 'static {
    tracing_subscriber::registry().with(InMemorySpanLayer::new(storage))
}

#[cfg(test)]
mod test_inmemory;
#[cfg(test)]
mod test_serialization;
