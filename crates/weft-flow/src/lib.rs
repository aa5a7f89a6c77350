//! # Weft Flow
//!
//! The facade crate for the weft pipeline: compiles a declarative service
//! graph into concrete transport bindings, deploys the compiled flow as a
//! set of service runtimes, and exposes the client-facing RPC boundary.
//!
//! A flow is built either fluently ([`FlowBuilder`]) or declaratively
//! from a TOML file ([`FlowConfig`]), compiled by
//! [`ServiceGraph::compile`] into an inspectable [`CompiledFlow`], and
//! brought up by the [`Supervisor`]. Clients talk to the deployed flow
//! through a [`FrontendClient`].

#![deny(missing_docs)]
#![warn(clippy::all, clippy::pedantic)]
#![allow(clippy::module_name_repetitions)]

pub mod builder;
pub mod client;
pub mod config;
pub mod supervisor;
pub mod topology;

mod error;

pub use builder::FlowBuilder;
pub use client::FrontendClient;
pub use config::FlowConfig;
pub use error::FlowError;
pub use supervisor::{DeployOptions, FlowHandle, Supervisor};
pub use topology::{CompiledFlow, CompileOptions, ServiceGraph, ServiceNode, TopologyError};
