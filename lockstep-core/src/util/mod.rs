mod id;
mod introspection;

pub use id::*;
pub use introspection::*;

use chrono::Utc;
use dashmap::DashMap;
use std::sync::{Arc, OnceLock};
use tokio::runtime::{Handle, Runtime};

/// A concurrent store of shared values, keyed by id. Reduces verbosity.
pub type ArcedStore<K, V> = Arc<DashMap<K, Arc<V>>>;

static FALLBACK_RUNTIME: OnceLock<Runtime> = OnceLock::new();

/// Returns the current tokio handle, or a shared fallback runtime's handle
/// when called outside a runtime context.
pub fn get_or_create_handle() -> Handle {
    Handle::try_current().ok().unwrap_or_else(|| {
        FALLBACK_RUNTIME
            .get_or_init(|| Runtime::new().expect("fallback runtime is created"))
            .handle()
            .clone()
    })
}

/// Returns the local wall clock as unix milliseconds.
pub fn local_now_ms() -> i64 {
    Utc::now().timestamp_millis()
}
