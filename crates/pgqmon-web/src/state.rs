//! Shared application state and global allocator.

#[cfg(not(target_env = "msvc"))]
use tikv_jemallocator::Jemalloc;

#[cfg(not(target_env = "msvc"))]
#[global_allocator]
static GLOBAL: Jemalloc = Jemalloc;

use std::sync::Arc;

use pgqmon_core::QueryMonitor;

#[derive(Clone)]
pub(crate) struct AppState {
    pub(crate) monitor: Arc<QueryMonitor>,
}

impl AppState {
    pub(crate) fn new(monitor: Arc<QueryMonitor>) -> Self {
        Self { monitor }
    }
}
