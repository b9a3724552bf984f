//! # CPE-RS: Collection Processing Engine
//!
//! Pulls entities from a source, runs each one through an ordered chain of
//! processing stages on a pool of worker threads, and reports every
//! finished entity to registered listeners.
//!
//! ## Architecture
//!
//! - **Feeder**: reads the [`EntitySource`] into a bounded input queue
//! - **Workers**: each owns one instance of every stage and runs the chain
//! - **Dispatcher**: drains the bounded output queue into listener callbacks
//! - **Policies**: per-stage sliding error window and restart budget decide
//!   whether a fault is tolerated, disables the stage, or ends the run
//! - **Checkpoints**: the source's resume position is persisted so an
//!   aborted run can pick up where it left off
//!
//! Bounded queues give backpressure: a slow dispatcher stalls the workers,
//! which stall the feeder.
//!
//! ## Example
//!
//! ```ignore
//! use cpe_rs::{config::CpeDescription, engine::stage_factory, EngineBuilder};
//!
//! let engine = EngineBuilder::new(CpeDescription::load("cpe.toml")?)
//!     .source(MySource::open("input")?)
//!     .factory("parse", stage_factory(Parser::default))
//!     .listener(Arc::new(Progress::default()))
//!     .build()?;
//!
//! engine.process()?;
//! let state = engine.wait();
//! println!("{state}: {:?}", engine.performance_report());
//! ```

pub mod checkpoint;
pub mod config;
pub mod engine;
pub mod error;
pub mod logging;
pub mod types;

// Re-export commonly used types
pub use checkpoint::{ResumePosition, SynchPoint, SynchPointRegistry};
pub use config::{CpeDescription, ErrorAction, RestartAction, StageSettings};
pub use engine::{
    CollectionProcessingEngine, EngineBuilder, EngineHandle, EngineState, EntityProcessStatus,
    EntitySource, FaultKind, PerformanceReport, ProcessingStage, StageFault,
    StatusCallbackListener,
};
pub use error::{CpeError, Result};
pub use types::{Entity, Progress};
