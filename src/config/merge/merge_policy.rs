//! Merge rules: defaults, override order, conflict handling.
//!
//! Later sources override earlier ones key by key; maps such as `restraints`
//! merge per entry rather than being replaced wholesale.

use config::builder::DefaultState;
use config::Config;
use config::ConfigBuilder;
use config::ConfigError;

/// Create a Config builder with merge policy defaults applied.
pub fn builder_with_defaults() -> Result<ConfigBuilder<DefaultState>, ConfigError> {
    Config::builder()
        .set_default("storage.path", ".cadence/store")?
        .set_default("storage.temporary", false)?
        .set_default("engine.workers", 4)?
        .set_default("engine.max_redeliveries", 5)?
        .set_default("wait_notify.notify_grace_period_ms", 60_000)?
        .set_default("dispatch.workers", 2)
}
