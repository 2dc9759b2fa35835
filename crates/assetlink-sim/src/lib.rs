//! # assetlink-sim
//!
//! Drives an [`OpcUaAssetConnection`] against an in-process
//! [`EmbeddedServer`] so the whole stack can be watched without hardware.
//!
//! A [`Simulation`] hosts the example namespace, keeps
//! `HelloWorld/Dynamic/Double` moving, opens the connection described by a
//! [`SimConfig`], reads every value provider once, logs every subscription
//! sample, and runs the configured operation invocations.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{anyhow, Context};
use assetlink_core::{
    ArgumentDescriptor, AssetConnection, CoreConfig, Datatype, ElementValue, OperationVariable,
    Reference, StaticServiceContext, TypeInfo, TypedValue,
};
use assetlink_opcua::{EmbeddedServer, OpcUaAssetConnection, OpcUaAssetConnectionConfig};
use serde::{Deserialize, Serialize};
use tokio::task::JoinHandle;
use tracing::{info, warn};

fn default_update_period_ms() -> u64 {
    1_000
}

// ── Configuration ─────────────────────────────────────────────────────────────

/// One declared output variable of an operation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OutputSpec {
    pub id_short: String,
    pub type_info: TypeInfo,
}

/// One argument of an invocation, given as text in `datatype`'s text form.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ArgumentSpec {
    pub id_short: String,
    pub datatype: Datatype,
    pub value: String,
}

impl ArgumentSpec {
    fn to_variable(&self) -> anyhow::Result<OperationVariable> {
        let value = TypedValue::from_text(self.datatype, &self.value)
            .with_context(|| format!("argument '{}'", self.id_short))?;
        Ok(OperationVariable::new(self.id_short.clone(), value))
    }
}

/// An operation call made once the connection is up.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InvocationSpec {
    pub operation: Reference,
    #[serde(default)]
    pub input: Vec<ArgumentSpec>,
    #[serde(default)]
    pub inoutput: Vec<ArgumentSpec>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SimulationSettings {
    /// How often `HelloWorld/Dynamic/Double` advances.
    #[serde(default = "default_update_period_ms")]
    pub update_period_ms: u64,
}

impl Default for SimulationSettings {
    fn default() -> Self {
        Self {
            update_period_ms: default_update_period_ms(),
        }
    }
}

/// The simulator's TOML file.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SimConfig {
    #[serde(default)]
    pub core: CoreConfig,
    #[serde(default)]
    pub simulation: SimulationSettings,
    pub connection: OpcUaAssetConnectionConfig,
    /// Type info the runtime would report, per reference.
    #[serde(default)]
    pub types: HashMap<Reference, TypeInfo>,
    /// Output variables the runtime would report, per operation.
    #[serde(default)]
    pub outputs: HashMap<Reference, Vec<OutputSpec>>,
    #[serde(default)]
    pub invocations: Vec<InvocationSpec>,
}

impl SimConfig {
    pub fn from_toml_str(text: &str) -> anyhow::Result<Self> {
        let config: Self = toml::from_str(text).context("failed to parse simulator config")?;
        config
            .connection
            .validate()
            .context("invalid connection config")?;
        Ok(config)
    }

    pub fn load(path: &std::path::Path) -> anyhow::Result<Self> {
        let text = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read {}", path.display()))?;
        Self::from_toml_str(&text)
    }

    /// The runtime lookups, served from the `[types]` and `[outputs]` tables.
    pub fn service_context(&self) -> StaticServiceContext {
        let mut context = StaticServiceContext::new();
        for (reference, type_info) in &self.types {
            context = context.with_type_info(reference.clone(), *type_info);
        }
        for (reference, outputs) in &self.outputs {
            let descriptors = outputs
                .iter()
                .map(|o| ArgumentDescriptor::new(o.id_short.clone(), o.type_info))
                .collect();
            context = context.with_outputs(reference.clone(), descriptors);
        }
        context
    }
}

// ── Simulation ────────────────────────────────────────────────────────────────

/// A running server plus the connection opened against it.
#[derive(Debug)]
pub struct Simulation {
    server: EmbeddedServer,
    connection: OpcUaAssetConnection,
    updates: JoinHandle<()>,
}

impl Simulation {
    /// Starts the server and opens the connection.  Needs a Tokio runtime.
    pub async fn start(config: &SimConfig) -> anyhow::Result<Self> {
        let server = EmbeddedServer::with_example_namespace();
        let updates =
            server.spawn_dynamic_updates(Duration::from_millis(config.simulation.update_period_ms));

        let mut connection = OpcUaAssetConnection::new(config.connection.clone())
            .context("invalid connection config")?;
        if let Err(e) = connection
            .init(&config.core, &config.service_context(), &server)
            .await
        {
            updates.abort();
            return Err(e).context("failed to open asset connection");
        }
        info!(host = %config.connection.host, "simulation started");
        Ok(Self {
            server,
            connection,
            updates,
        })
    }

    pub fn server(&self) -> &EmbeddedServer {
        &self.server
    }

    pub fn connection(&self) -> &OpcUaAssetConnection {
        &self.connection
    }

    /// Reads every value provider once, in reference order.
    pub async fn read_all(&self) -> Vec<(Reference, anyhow::Result<ElementValue>)> {
        let mut providers: Vec<_> = self.connection.value_providers().iter().collect();
        providers.sort_by_key(|(r, _)| r.to_string());

        let mut results = Vec::with_capacity(providers.len());
        for (reference, provider) in providers {
            let result = provider.get_value().await.map_err(anyhow::Error::from);
            match &result {
                Ok(value) => info!(%reference, ?value, "read"),
                Err(e) => warn!(%reference, error = %e, "read failed"),
            }
            results.push((reference.clone(), result));
        }
        results
    }

    /// Attaches a logging listener to every subscription provider.
    pub fn watch_all(&self) {
        for (reference, provider) in self.connection.subscription_providers() {
            let reference = reference.clone();
            provider.add_new_data_listener(Arc::new(move |value: &ElementValue| {
                info!(%reference, ?value, "sample");
            }));
        }
    }

    /// Runs one configured invocation and returns the output variables.
    pub async fn invoke(&self, spec: &InvocationSpec) -> anyhow::Result<Vec<OperationVariable>> {
        let provider = self
            .connection
            .operation_providers()
            .get(&spec.operation)
            .ok_or_else(|| anyhow!("no operation provider for {}", spec.operation))?;
        let input = spec
            .input
            .iter()
            .map(ArgumentSpec::to_variable)
            .collect::<anyhow::Result<Vec<_>>>()?;
        let mut inoutput = spec
            .inoutput
            .iter()
            .map(ArgumentSpec::to_variable)
            .collect::<anyhow::Result<Vec<_>>>()?;

        let output = provider
            .invoke(&input, &mut inoutput)
            .await
            .with_context(|| format!("invoking {}", spec.operation))?;
        info!(operation = %spec.operation, ?inoutput, ?output, "invoked");
        Ok(output)
    }

    /// Closes the connection and stops the value updates.
    pub async fn shutdown(self) -> anyhow::Result<()> {
        let result = self.connection.close().await;
        self.updates.abort();
        result.context("failed to close asset connection")?;
        info!("simulation stopped");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use assetlink_core::ConnectionState;
    use tokio_test::{assert_err, assert_ok};

    const SAMPLE: &str = include_str!("../sim.toml");

    #[test]
    fn test_sample_config_parses() {
        // Act
        let config = assert_ok!(SimConfig::from_toml_str(SAMPLE));

        // Assert
        assert!(!config.connection.value_providers.is_empty());
        assert!(!config.invocations.is_empty());
        for reference in config.connection.value_providers.keys() {
            assert!(config.types.contains_key(reference), "{reference} has no type");
        }
    }

    #[test]
    fn test_argument_text_is_parsed_with_its_datatype() {
        let spec = ArgumentSpec {
            id_short: "x".into(),
            datatype: Datatype::Double,
            value: "16".into(),
        };
        assert_eq!(assert_ok!(spec.to_variable()), OperationVariable::new("x", 16.0));

        let bad = ArgumentSpec {
            value: "sixteen".into(),
            ..spec
        };
        assert_err!(bad.to_variable());
    }

    #[tokio::test]
    async fn test_sample_simulation_runs_end_to_end() {
        // Arrange
        let config = SimConfig::from_toml_str(SAMPLE).unwrap();
        let simulation = assert_ok!(Simulation::start(&config).await);
        simulation.watch_all();

        // Act
        let reads = simulation.read_all().await;
        let output = assert_ok!(simulation.invoke(&config.invocations[0]).await);

        // Assert
        assert!(reads.iter().all(|(_, r)| r.is_ok()));
        assert_eq!(output, vec![OperationVariable::new("x_sqrt", 4.0)]);
        assert_eq!(simulation.connection().state(), ConnectionState::Connected);
        assert_ok!(simulation.shutdown().await);
    }

    #[tokio::test]
    async fn test_unknown_type_fails_start() {
        let mut config = SimConfig::from_toml_str(SAMPLE).unwrap();
        config.types.clear();
        assert_err!(Simulation::start(&config).await);
    }
}
