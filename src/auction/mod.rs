// Live auction core: session state, round engine, connection registry.

pub mod engine;
pub mod registry;
pub mod session;
