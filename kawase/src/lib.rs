//! Umbrella crate: one `use kawase::...` away from the whole engine.

pub use kawase_broker as broker;
pub use kawase_config as config;
pub use kawase_core as core;
pub use kawase_engine as engine;
pub use kawase_market as market;
pub use kawase_rules as rules;
