//! session-core
//!
//! Pure session-engine logic, no I/O:
//! - identifiers and the per-connection credential
//! - the `Engine` trait and its shared base
//! - `EngineRegistry`: arena of live engines, stream table, id allocator,
//!   holder counts and reaping
//! - concrete engines: Conquest (quiz battle), Peer (presence), Exam (stub)
//! - off-worker jobs and the user-directory seam they run against

pub mod clock;
pub mod conquest;
pub mod credential;
pub mod directory;
pub mod engine;
pub mod error;
pub mod exam;
pub mod peer;
pub mod registry;
pub mod types;

pub use clock::Clock;
pub use credential::{Credential, Role};
pub use directory::{DirectoryError, EngineJob, GameRecord, JobResult, UserDirectory};
pub use engine::{Caller, Effect, Engine, EngineBase, EngineContext, Reply};
pub use error::CommandError;
pub use registry::{ConnectPolicy, EngineRegistry, Output, RegistrySettings};
pub use types::{EngineId, EngineKey, EngineKind, PlayerId, StreamId};

pub use conquest::{ConquestEngine, ConquestSettings};
pub use exam::ExamEngine;
pub use peer::PeerEngine;
