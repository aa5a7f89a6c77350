//! Deploys a compiled flow as a set of service runtimes.
//!
//! The supervisor is the in-process deployment backend: every compiled
//! node instance becomes one [`ServiceRuntime`] tokio task. Other
//! backends (subprocesses, containers) live behind the same compiled
//! plan; nothing here is reachable from the data path.

use std::time::Duration;

use tracing::info;

use weft_core::router::{self, AggregationConfig};
use weft_core::runtime::{RuntimeConfig, ServiceRuntime, SocketSpec};
use weft_core::stage::{StageRegistry, StageSpec, Timed};
use weft_core::transport::{FanMode, TransportConfig, TransportPattern};

use crate::error::FlowError;
use crate::topology::{CompiledFlow, CompiledNode, EndpointPlan, NodeKind};

/// Deployment knobs shared by every runtime of a flow.
#[derive(Debug, Clone)]
pub struct DeployOptions {
    /// Wrap every stage in the latency-logging middleware.
    pub profiling: bool,
    /// Auto-persistence interval; `None` disables flushing.
    pub flush_interval: Option<Duration>,
    /// Sweep (eviction) tick interval.
    pub sweep_interval: Duration,
    /// Aggregation defaults for reduce routers.
    pub aggregation: AggregationConfig,
    /// Transport tuning.
    pub transport: TransportConfig,
}

impl Default for DeployOptions {
    fn default() -> Self {
        Self {
            profiling: false,
            flush_interval: None,
            sweep_interval: Duration::from_millis(500),
            aggregation: AggregationConfig::default(),
            transport: TransportConfig::default(),
        }
    }
}

/// A registry pre-loaded with the builtin stages and the router kind.
#[must_use]
pub fn default_registry(aggregation: &AggregationConfig) -> StageRegistry {
    let mut registry = StageRegistry::with_builtins();
    router::register(&mut registry, aggregation);
    registry
}

/// Instantiates and supervises the runtimes of one compiled flow.
pub struct Supervisor<'r> {
    registry: &'r StageRegistry,
    options: DeployOptions,
}

impl<'r> Supervisor<'r> {
    /// Creates a supervisor over an explicit stage registry.
    #[must_use]
    pub fn new(registry: &'r StageRegistry, options: DeployOptions) -> Self {
        Self { registry, options }
    }

    /// Starts one runtime per compiled node instance and returns the
    /// handle owning them all.
    ///
    /// Bind endpoints come up in plan order; connect sides retry, so the
    /// relative start order of the instances does not matter. The first
    /// failure tears down every runtime already started.
    ///
    /// # Errors
    ///
    /// Returns the first stage-construction or runtime-start error.
    pub async fn deploy(&self, flow: &CompiledFlow) -> Result<FlowHandle, FlowError> {
        let mut runtimes: Vec<ServiceRuntime> = Vec::new();
        for node in &flow.nodes {
            if node.kind == NodeKind::Frontend {
                continue; // driven by the FrontendClient, not a runtime
            }
            for instance in 0..node.replicas {
                match self.start_instance(flow, node, instance).await {
                    Ok(runtime) => runtimes.push(runtime),
                    Err(err) => {
                        for runtime in runtimes.into_iter().rev() {
                            let _ = runtime.close().await;
                        }
                        return Err(err);
                    }
                }
            }
        }
        info!(flow = %flow.name, runtimes = runtimes.len(), "flow deployed");
        Ok(FlowHandle { runtimes })
    }

    async fn start_instance(
        &self,
        flow: &CompiledFlow,
        node: &CompiledNode,
        instance: u32,
    ) -> Result<ServiceRuntime, FlowError> {
        let name = if node.replicas > 1 {
            format!("{}/{instance}", node.name)
        } else {
            node.name.clone()
        };

        let spec = node
            .stage
            .clone()
            .unwrap_or_else(|| StageSpec::new("passthrough"));
        let mut stage = self.registry.build(&spec)?;
        if self.options.profiling {
            stage = Timed::wrap(name.clone(), stage);
        }

        let control_port = *node
            .control_ports
            .get(instance as usize)
            .ok_or(crate::topology::TopologyError::Internal(
                "compiled node missing a control port for an instance",
            ))
            .map_err(FlowError::Topology)?;
        let config = RuntimeConfig {
            name,
            data_in: node
                .data_in
                .as_ref()
                .map(|plan| socket_spec(flow, plan))
                .transpose()?,
            data_out: node
                .data_out
                .as_ref()
                .map(|plan| socket_spec(flow, plan))
                .transpose()?,
            control_addr: host_addr(flow, control_port)?,
            branch: node.branch.map(|b| b.level_for(instance)),
            flush_interval: self.options.flush_interval,
            sweep_interval: self.options.sweep_interval,
            transport: self.options.transport.clone(),
        };
        Ok(ServiceRuntime::start(config, stage).await?)
    }
}

/// The deployed runtimes of one flow, managed as a unit.
pub struct FlowHandle {
    runtimes: Vec<ServiceRuntime>,
}

impl FlowHandle {
    /// Names of the running instances, in start order.
    pub fn runtime_names(&self) -> impl Iterator<Item = &str> {
        self.runtimes.iter().map(ServiceRuntime::name)
    }

    /// Number of running instances.
    #[must_use]
    pub fn len(&self) -> usize {
        self.runtimes.len()
    }

    /// Whether the flow has no runtimes.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.runtimes.is_empty()
    }

    /// Terminates every runtime over its control channel, in reverse
    /// start order, and waits for each to close.
    ///
    /// # Errors
    ///
    /// Returns the first close failure; remaining runtimes are still
    /// terminated on a best-effort basis.
    pub async fn shutdown(mut self) -> Result<(), FlowError> {
        let mut first_err = None;
        for runtime in self.runtimes.drain(..).rev() {
            if let Err(err) = runtime.close().await {
                if first_err.is_none() {
                    first_err = Some(err);
                }
            }
        }
        match first_err {
            None => Ok(()),
            Some(err) => Err(err.into()),
        }
    }
}

impl Drop for FlowHandle {
    fn drop(&mut self) {
        // A handle dropped without shutdown() leaves no orphan loops.
        for runtime in &self.runtimes {
            runtime.abort();
        }
    }
}

fn host_addr(flow: &CompiledFlow, port: u16) -> Result<std::net::SocketAddr, FlowError> {
    flow.host_addr(port).map_err(|source| FlowError::BadHost {
        host: flow.host.clone(),
        source,
    })
}

fn socket_spec(flow: &CompiledFlow, plan: &EndpointPlan) -> Result<SocketSpec, FlowError> {
    match plan {
        EndpointPlan::Bind {
            pattern,
            port,
            expected_peers,
        } => Ok(SocketSpec::Bind {
            addr: host_addr(flow, *port)?,
            mode: match pattern {
                TransportPattern::Exclusive => FanMode::Single,
                TransportPattern::Broadcast => FanMode::Broadcast,
                TransportPattern::LoadBalanced => FanMode::RoundRobin,
            },
            expected_peers: *expected_peers,
        }),
        EndpointPlan::Connect { peers, .. } => {
            let peers = peers
                .iter()
                .map(|&port| host_addr(flow, port))
                .collect::<Result<Vec<_>, _>>()?;
            Ok(SocketSpec::Connect { peers })
        }
    }
}
