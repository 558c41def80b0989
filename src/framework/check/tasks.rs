//! Builtin diagnostic tasks.
//!
//! Each task lives in its own module and registers itself through
//! `register_builtin`. Task names are `<area>.<check>`; the area prefix is
//! what selector patterns usually match on.

pub mod active_sessions;
pub mod clock_skew;
pub mod cluster_version;
pub mod disk_usage;

use super::registry::TaskRegistry;

pub fn register_builtin(registry: &mut TaskRegistry) {
    registry.register("cluster", cluster_version::factory);
    registry.register("cluster", active_sessions::factory);
    registry.register("cluster", disk_usage::factory);
    registry.register("cluster", clock_skew::factory);
}
