//! Reference adapters for the `ports` traits.
//!
//! Real backends (a database, a message bus, a secret manager, a runner
//! process) are out of scope here; `memory` gives the orchestrator
//! something to run against in tests and the demo binary.

pub mod memory;
