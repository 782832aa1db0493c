//! Shared fixture for resource tests.

use convergence::{Engine, NoCallback, RetryConfig};
use cxapi::MemoryBackend;
use std::sync::Arc;
use std::time::Duration;

use crate::engine::Session;
use crate::resource::ApplyContext;
use crate::state::Ledger;

/// Engine with millisecond windows, so lagging reads converge quickly and
/// failures give up quickly.
pub fn fast_engine() -> Engine {
    let window = |ms| {
        RetryConfig::read_after_write()
            .with_deadline(Duration::from_millis(ms))
            .with_delays(Duration::from_millis(2), Duration::from_millis(10))
    };
    Engine::from_configs(
        window(400),
        RetryConfig::versioned_write()
            .with_deadline(Duration::from_millis(400))
            .with_delays(Duration::from_millis(1), Duration::from_millis(5))
            .with_max_attempts(Some(5)),
        window(400),
        window(200),
    )
    .with_callback(Arc::new(NoCallback))
}

pub struct Fixture {
    pub api: Arc<MemoryBackend>,
    pub session: Session,
}

impl Fixture {
    pub fn new() -> Self {
        Self::with_api(MemoryBackend::new())
    }

    pub fn with_api(api: MemoryBackend) -> Self {
        let api = Arc::new(api);
        let session = Session::new(api.clone(), fast_engine(), Ledger::in_memory());
        Self { api, session }
    }

    pub fn ctx(&self) -> ApplyContext<'_> {
        self.session.context(false, false)
    }
}
