// Log Alerter Library
pub mod config;
pub mod admission;
pub mod delivery;
pub mod envelope;
pub mod pipeline;

// Modules with submodules
pub mod dedup {
    pub mod fingerprint;
    pub mod index;

    // Re-export the engine and related types
    mod engine;
    pub use engine::*;
}

pub mod sources {
    pub mod lines;
    pub mod redis_list;

    // Re-export the source trait and instance
    mod manager;
    pub use manager::*;
    pub use lines::LineSource;
    pub use redis_list::RedisListSource;
}
