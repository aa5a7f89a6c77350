//! # Weft Core
//!
//! The engine crate for the weft distributed search pipeline.
//!
//! This crate provides:
//! - **Envelope**: the routed message unit exchanged between stages
//! - **Transport**: the four socket patterns (pair, broadcast, load-balanced
//!   funnel, control) over length-prefixed TCP frames
//! - **Runtime**: the event loop every stage runs
//! - **Router**: map/reduce splitting and aggregation of partial results
//! - **Stage**: the plugin trait, registry, and builtin example stages
//!
//! ## Design Principles
//!
//! 1. **One task per runtime** - no shared mutable state between stages
//!    except what flows through the transport
//! 2. **One envelope at a time** - per-runtime FIFO, no locks inside a loop
//! 3. **Fail fast at the edges** - bad envelopes are logged and dropped;
//!    only an explicit terminate stops a loop

#![deny(missing_docs)]
#![warn(clippy::all, clippy::pedantic)]
#![allow(clippy::module_name_repetitions)]

pub mod envelope;
pub mod router;
pub mod runtime;
pub mod stage;
pub mod transport;

pub use envelope::{Envelope, EnvelopeKind, Payload};
pub use runtime::{RuntimeConfig, RuntimeState, ServiceRuntime};
pub use stage::{Stage, StageOutput, StageRegistry};
