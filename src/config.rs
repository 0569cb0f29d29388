use clap::Parser;
use serde::Deserialize;
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::time::Duration;
use std::{fs, io};
use thiserror::Error;

use crate::ServiceConfig;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read {path}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("failed to parse {path}: {source}")]
    Parse {
        path: PathBuf,
        #[source]
        source: serde_yaml::Error,
    },

    #[error("invalid upstream url `{0}`")]
    InvalidUrl(String),

    #[error("no upstreams configured")]
    NoUpstreams,
}

/// Optional behaviour switched on through `PLUGINS`.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Plugin {
    /// Prometheus exporter on the metrics port.
    Metrics,
}

fn parse_plugin(s: &str) -> Result<Plugin, String> {
    match s.trim().to_lowercase().as_str() {
        "metrics" => Ok(Plugin::Metrics),
        _ => Err(format!("Unknown plugin '{}'. Available: metrics.", s)),
    }
}

/// Endpoint federated when neither `APIS` nor a supergraph file is given.
pub const DEFAULT_APIS: &str = "https://api.context.gg/graphql";

/// Stitchway - remote schema federation gateway.
#[derive(Parser, Debug, Clone)]
#[command(name = "stitchway")]
#[command(about = "Federates remote GraphQL services behind a single endpoint")]
#[command(version)]
pub struct GatewayConfig {
    /// Upstream GraphQL endpoints, comma separated. Defaults to
    /// `DEFAULT_APIS` unless a supergraph file is given.
    #[arg(long, env = "APIS", value_delimiter = ',')]
    pub apis: Option<Vec<String>>,

    /// GraphQL server port.
    #[arg(long, env = "PORT", default_value = "8080")]
    pub port: u16,

    /// Prometheus metrics port.
    #[arg(long, env = "METRICS_PORT", default_value = "8081")]
    pub metrics_port: u16,

    /// Health check port.
    #[arg(long, env = "HEALTH_PORT", default_value = "8082")]
    pub health_port: u16,

    /// Seconds between schema refreshes; 0 disables refreshing.
    #[arg(long, env = "REFRESH_INTERVAL_SECS", default_value = "60")]
    pub refresh_interval_secs: u64,

    /// Timeout for each upstream sub-request, in milliseconds.
    #[arg(long, env = "UPSTREAM_TIMEOUT_MS", default_value = "10000")]
    pub upstream_timeout_ms: u64,

    /// Attach per-fetch timings to responses.
    #[arg(long, env = "ENGINE_TRACING")]
    pub engine_tracing: bool,

    /// Enabled plugins, comma separated.
    #[arg(long, env = "PLUGINS", value_delimiter = ',', default_value = "metrics", value_parser = parse_plugin)]
    pub plugins: Vec<Plugin>,

    /// Supergraph YAML declaring upstreams with static SDL.
    #[arg(long, env = "SUPERGRAPH_CONFIG")]
    pub supergraph_config: Option<PathBuf>,

    /// Log level (trace, debug, info, warn, error).
    #[arg(long, env = "LOG_LEVEL", default_value = "info")]
    pub log_level: String,

    /// Enable JSON log output.
    #[arg(long, env = "JSON_LOGS")]
    pub json_logs: bool,

    /// Seconds to wait for in-flight requests on shutdown.
    #[arg(long, env = "SHUTDOWN_GRACE_SECS", default_value = "10")]
    pub shutdown_grace_secs: u64,
}

impl GatewayConfig {
    pub fn upstream_timeout(&self) -> Duration {
        Duration::from_millis(self.upstream_timeout_ms)
    }

    pub fn refresh_interval(&self) -> Option<Duration> {
        (self.refresh_interval_secs > 0).then(|| Duration::from_secs(self.refresh_interval_secs))
    }

    pub fn shutdown_grace(&self) -> Duration {
        Duration::from_secs(self.shutdown_grace_secs)
    }

    /// Server options assembled from the command line and the optional
    /// supergraph file. Static upstreams come after the `APIS` list.
    pub fn server_options(&self) -> Result<ServerOptions, ConfigError> {
        let mut upstreams = match (&self.apis, &self.supergraph_config) {
            (Some(apis), _) => services_from_urls(apis)?,
            (None, Some(_)) => Vec::new(),
            (None, None) => services_from_urls(&[DEFAULT_APIS.to_string()])?,
        };
        if let Some(path) = &self.supergraph_config {
            upstreams.extend(load_supergraph(path)?);
        }
        if upstreams.is_empty() {
            return Err(ConfigError::NoUpstreams);
        }
        Ok(ServerOptions {
            upstreams,
            plugins: self.plugins.clone(),
            engine_tracing: self.engine_tracing,
            upstream_timeout: self.upstream_timeout(),
        })
    }
}

/// Explicit server configuration handed to the gateway.
#[derive(Clone, Debug)]
pub struct ServerOptions {
    pub upstreams: Vec<ServiceConfig>,
    pub plugins: Vec<Plugin>,
    pub engine_tracing: bool,
    pub upstream_timeout: Duration,
}

impl ServerOptions {
    pub fn has_plugin(&self, plugin: Plugin) -> bool {
        self.plugins.contains(&plugin)
    }
}

impl Default for ServerOptions {
    fn default() -> Self {
        ServerOptions {
            upstreams: Vec::new(),
            plugins: vec![Plugin::Metrics],
            engine_tracing: false,
            upstream_timeout: Duration::from_secs(10),
        }
    }
}

/// Names each endpoint after its host, suffixing duplicates.
pub fn services_from_urls(urls: &[String]) -> Result<Vec<ServiceConfig>, ConfigError> {
    let mut services: Vec<ServiceConfig> = Vec::new();
    for raw in urls.iter().map(|u| u.trim()).filter(|u| !u.is_empty()) {
        let url = reqwest::Url::parse(raw).map_err(|_| ConfigError::InvalidUrl(raw.to_string()))?;
        let host = url
            .host_str()
            .ok_or_else(|| ConfigError::InvalidUrl(raw.to_string()))?;
        let base = match url.port() {
            Some(port) => format!("{}:{}", host, port),
            None => host.to_string(),
        };

        let mut name = base.clone();
        let mut n = 2;
        while services.iter().any(|s| s.name == name) {
            name = format!("{}#{}", base, n);
            n += 1;
        }
        services.push(ServiceConfig {
            name,
            url: raw.to_string(),
            schema: None,
        });
    }
    Ok(services)
}

#[derive(Debug, Deserialize)]
struct SupergraphConfig {
    subgraphs: BTreeMap<String, SubgraphConfig>,
}

#[derive(Debug, Deserialize)]
struct SubgraphConfig {
    routing_url: String,
    schema: SchemaSource,
}

#[derive(Debug, Deserialize)]
struct SchemaSource {
    file: String,
}

/// Reads a supergraph file; schema paths are relative to its directory.
pub fn load_supergraph(path: &Path) -> Result<Vec<ServiceConfig>, ConfigError> {
    let contents = fs::read_to_string(path).map_err(|source| ConfigError::Read {
        path: path.to_path_buf(),
        source,
    })?;
    let config: SupergraphConfig =
        serde_yaml::from_str(&contents).map_err(|source| ConfigError::Parse {
            path: path.to_path_buf(),
            source,
        })?;

    let base_dir = path.parent().unwrap_or_else(|| Path::new(""));
    config
        .subgraphs
        .into_iter()
        .map(|(name, subgraph)| {
            let schema_path = base_dir.join(&subgraph.schema.file);
            let schema = fs::read_to_string(&schema_path).map_err(|source| ConfigError::Read {
                path: schema_path,
                source,
            })?;
            Ok(ServiceConfig {
                name,
                url: subgraph.routing_url,
                schema: Some(schema),
            })
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn defaults_match_the_documented_ports() {
        let config = GatewayConfig::parse_from(["stitchway"]);
        assert_eq!(config.port, 8080);
        assert_eq!(config.metrics_port, 8081);
        assert_eq!(config.health_port, 8082);
        assert_eq!(config.plugins, vec![Plugin::Metrics]);
        assert_eq!(config.refresh_interval(), Some(Duration::from_secs(60)));

        let options = config.server_options().unwrap();
        assert_eq!(options.upstreams.len(), 1);
        assert_eq!(options.upstreams[0].url, DEFAULT_APIS);
        assert_eq!(options.upstreams[0].name, "api.context.gg");
    }

    #[test]
    fn apis_are_split_on_commas() {
        let config = GatewayConfig::parse_from([
            "stitchway",
            "--apis",
            "http://users:4001/graphql,http://orders:4002/graphql",
            "--refresh-interval-secs",
            "0",
        ]);
        let options = config.server_options().unwrap();
        let names: Vec<&str> = options.upstreams.iter().map(|s| s.name.as_str()).collect();
        assert_eq!(names, vec!["users:4001", "orders:4002"]);
        assert_eq!(config.refresh_interval(), None);
    }

    #[test]
    fn duplicate_hosts_get_distinct_names() {
        let services = services_from_urls(&[
            "http://api.test/a".to_string(),
            "http://api.test/b".to_string(),
        ])
        .unwrap();
        assert_eq!(services[0].name, "api.test");
        assert_eq!(services[1].name, "api.test#2");
    }

    #[test]
    fn rejects_unknown_plugins() {
        assert!(parse_plugin("tracing").is_err());
        assert_eq!(parse_plugin(" Metrics ").unwrap(), Plugin::Metrics);
    }

    #[test]
    fn rejects_relative_urls() {
        let err = services_from_urls(&["users/graphql".to_string()]).unwrap_err();
        assert!(matches!(err, ConfigError::InvalidUrl(_)));
    }

    fn write_supergraph(tag: &str) -> PathBuf {
        let dir = std::env::temp_dir().join(format!("stitchway-{}-{}", tag, std::process::id()));
        fs::create_dir_all(&dir).unwrap();
        fs::write(dir.join("users.graphql"), "type Query { me: String }").unwrap();
        fs::write(
            dir.join("supergraph.yaml"),
            "subgraphs:\n  users:\n    routing_url: http://users:4001/graphql\n    schema:\n      file: ./users.graphql\n",
        )
        .unwrap();
        dir
    }

    #[test]
    fn loads_static_subgraphs() {
        let dir = write_supergraph("static");

        let services = load_supergraph(&dir.join("supergraph.yaml")).unwrap();
        assert_eq!(services.len(), 1);
        assert_eq!(services[0].name, "users");
        assert_eq!(services[0].schema.as_deref(), Some("type Query { me: String }"));

        fs::remove_dir_all(&dir).unwrap();
    }

    #[test]
    fn supergraph_alone_skips_the_default_endpoint() {
        let dir = write_supergraph("only");
        let file = dir.join("supergraph.yaml");

        let config = GatewayConfig::parse_from([
            "stitchway",
            "--supergraph-config",
            file.to_str().unwrap(),
        ]);
        let options = config.server_options().unwrap();
        let names: Vec<&str> = options.upstreams.iter().map(|s| s.name.as_str()).collect();
        assert_eq!(names, vec!["users"]);

        let config = GatewayConfig::parse_from([
            "stitchway",
            "--apis",
            "http://orders:4002/graphql",
            "--supergraph-config",
            file.to_str().unwrap(),
        ]);
        let options = config.server_options().unwrap();
        let names: Vec<&str> = options.upstreams.iter().map(|s| s.name.as_str()).collect();
        assert_eq!(names, vec!["orders:4002", "users"]);

        fs::remove_dir_all(&dir).unwrap();
    }
}
