pub mod cli;
pub mod clients;
pub mod config;
pub mod context;
pub mod handlers;
pub mod mapping;
pub mod models;
pub mod processing;
pub mod storage;
pub mod sync;
pub mod tracking;

// Convenient re-exports for tests and external callers
pub use clients::*;
pub use config::*;
pub use context::*;
pub use handlers::*;
pub use mapping::*;
pub use models::*;
pub use processing::*;
pub use storage::{
    create_candidate_repository, CandidateRepository, InMemoryCandidateRepository, MongoCandidateRepository,
};
pub use sync::*;
pub use tracking::{
    create_status_tracker, LocalJsonStatusTracker, MongoStatusTracker, StatusStoreKind, StatusTracker,
};
