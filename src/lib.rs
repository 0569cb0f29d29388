pub mod config;
pub mod error;
pub mod federation_gateway;
pub mod introspection;
pub mod metrics;
pub mod operation;
pub mod query_executor;
pub mod query_planner;
pub mod schema;
pub mod schema_merger;
pub mod schema_registry;
pub mod transport;

pub use config::{ConfigError, GatewayConfig, Plugin, ServerOptions};
pub use error::{GatewayError, TransportError};
pub use federation_gateway::FederationGateway;
pub use query_executor::{FetchExecutor, QueryExecutor};
pub use query_planner::{FederatedQueryPlanner, QueryPlan, QueryPlanner};
pub use schema::SchemaDocument;
pub use schema_merger::{MergedSchema, merge};
pub use schema_registry::{IntrospectionSchemaRegistry, RefreshReport, SchemaRegistry, UpstreamStatus};
pub use transport::{HttpTransport, Transport};

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value, json};
use std::fmt;
use std::sync::Arc;

/// A configured upstream. `schema` carries static SDL; when absent the
/// upstream is introspected.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ServiceConfig {
    pub name: String,
    pub url: String,
    #[serde(default)]
    pub schema: Option<String>,
}

#[derive(Clone, Debug, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GraphQLRequest {
    pub query: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub variables: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub operation_name: Option<String>,
}

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct GraphQLError {
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub path: Option<Vec<Value>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub extensions: Option<Map<String, Value>>,
}

impl GraphQLError {
    pub fn new(message: impl Into<String>) -> Self {
        GraphQLError {
            message: message.into(),
            path: None,
            extensions: None,
        }
    }

    pub fn with_path(mut self, path: Vec<Value>) -> Self {
        self.path = Some(path);
        self
    }

    pub fn with_extension(mut self, key: &str, value: Value) -> Self {
        self.extensions
            .get_or_insert_with(Map::new)
            .insert(key.to_string(), value);
        self
    }
}

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct GraphQLResponse {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub errors: Vec<GraphQLError>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub extensions: Option<Map<String, Value>>,
}

impl GraphQLResponse {
    /// Response body for a request that failed as a whole, or the partial
    /// body carried by a [`GatewayError::PartialFailure`].
    pub fn from_error(error: &GatewayError) -> Self {
        if let GatewayError::PartialFailure { response, .. } = error {
            return (**response).clone();
        }
        let data = match error {
            GatewayError::UpstreamFailed { .. } => Some(Value::Null),
            _ => None,
        };
        GraphQLResponse {
            data,
            errors: vec![
                GraphQLError::new(error.to_string()).with_extension("code", json!(error.code())),
            ],
            extensions: None,
        }
    }
}

/// An introspected upstream, immutable once built.
#[derive(Clone)]
pub struct UpstreamService {
    pub name: String,
    pub url: String,
    pub schema: Arc<SchemaDocument>,
    pub transport: Arc<dyn Transport>,
}

impl fmt::Debug for UpstreamService {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("UpstreamService")
            .field("name", &self.name)
            .field("url", &self.url)
            .finish_non_exhaustive()
    }
}
