use async_trait::async_trait;
use futures::future::join_all;
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;
use tokio::sync::{Mutex, RwLock};
use tracing::{info, instrument, warn};

use crate::error::GatewayError;
use crate::introspection::{INTROSPECTION_QUERY, parse_introspection_response};
use crate::metrics;
use crate::schema::SchemaDocument;
use crate::schema_merger::{MergedSchema, merge};
use crate::transport::Transport;
use crate::{GraphQLRequest, ServiceConfig, UpstreamService};

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum UpstreamStatus {
    /// Not fetched yet.
    Pending,
    Healthy,
    /// Excluded from the merged schema.
    Degraded(String),
}

impl fmt::Display for UpstreamStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            UpstreamStatus::Pending => write!(f, "pending"),
            UpstreamStatus::Healthy => write!(f, "healthy"),
            UpstreamStatus::Degraded(reason) => write!(f, "degraded: {}", reason),
        }
    }
}

/// Outcome of a refresh that produced a new snapshot.
#[derive(Clone, Debug, PartialEq)]
pub struct RefreshReport {
    pub healthy: Vec<String>,
    pub degraded: Vec<String>,
    pub field_count: usize,
}

#[async_trait]
pub trait SchemaRegistry {
    /// Fetch and cache one upstream's schema.
    async fn fetch_schema(&self, service: &ServiceConfig) -> Result<Arc<SchemaDocument>, GatewayError>;

    /// Re-fetch every upstream and swap in a freshly merged schema.
    async fn refresh(&self) -> Result<RefreshReport, GatewayError>;

    async fn get_schema(&self) -> Option<Arc<MergedSchema>>;

    async fn statuses(&self) -> Vec<(String, UpstreamStatus)>;
}

/// Builds the merged schema from introspection (or static SDL) of a fixed
/// list of upstreams.
pub struct IntrospectionSchemaRegistry {
    services: Vec<ServiceConfig>,
    transport: Arc<dyn Transport>,
    /// Last good document per endpoint URL. Refreshes always refetch; this
    /// is only read back through `cached`.
    cache: RwLock<HashMap<String, Arc<SchemaDocument>>>,
    statuses: RwLock<HashMap<String, UpstreamStatus>>,
    current: RwLock<Option<Arc<MergedSchema>>>,
    refreshing: Mutex<()>,
}

impl IntrospectionSchemaRegistry {
    pub fn new(services: Vec<ServiceConfig>, transport: Arc<dyn Transport>) -> Self {
        let statuses = services
            .iter()
            .map(|s| (s.name.clone(), UpstreamStatus::Pending))
            .collect();
        IntrospectionSchemaRegistry {
            services,
            transport,
            cache: RwLock::new(HashMap::new()),
            statuses: RwLock::new(statuses),
            current: RwLock::new(None),
            refreshing: Mutex::new(()),
        }
    }

    /// Inspection hook: the last document successfully fetched from `url`,
    /// kept even after that upstream degrades. It never feeds a merge.
    pub async fn cached(&self, url: &str) -> Option<Arc<SchemaDocument>> {
        self.cache.read().await.get(url).cloned()
    }

    async fn load_document(&self, service: &ServiceConfig) -> Result<SchemaDocument, GatewayError> {
        if let Some(sdl) = &service.schema {
            return SchemaDocument::from_sdl(sdl).map_err(|reason| GatewayError::InvalidSchema {
                service: service.name.clone(),
                reason,
            });
        }

        let request = GraphQLRequest {
            query: INTROSPECTION_QUERY.to_string(),
            ..Default::default()
        };
        let body = self
            .transport
            .send(&service.url, &request)
            .await
            .map_err(|e| GatewayError::Unreachable {
                service: service.name.clone(),
                reason: e.to_string(),
            })?;

        parse_introspection_response(&body).map_err(|reason| GatewayError::InvalidSchema {
            service: service.name.clone(),
            reason,
        })
    }
}

#[async_trait]
impl SchemaRegistry for IntrospectionSchemaRegistry {
    #[instrument(skip_all, fields(service = %service.name, url = %service.url))]
    async fn fetch_schema(&self, service: &ServiceConfig) -> Result<Arc<SchemaDocument>, GatewayError> {
        let document = Arc::new(self.load_document(service).await?);
        self.cache
            .write()
            .await
            .insert(service.url.clone(), Arc::clone(&document));
        Ok(document)
    }

    #[instrument(skip_all, fields(upstreams = self.services.len()))]
    async fn refresh(&self) -> Result<RefreshReport, GatewayError> {
        let _guard = self.refreshing.lock().await;

        let results = join_all(self.services.iter().map(|s| self.fetch_schema(s))).await;

        let mut upstreams = Vec::new();
        let mut healthy = Vec::new();
        let mut degraded = Vec::new();
        let mut statuses = HashMap::new();
        for (service, result) in self.services.iter().zip(results) {
            match result {
                Ok(schema) => {
                    upstreams.push(Arc::new(UpstreamService {
                        name: service.name.clone(),
                        url: service.url.clone(),
                        schema,
                        transport: Arc::clone(&self.transport),
                    }));
                    healthy.push(service.name.clone());
                    statuses.insert(service.name.clone(), UpstreamStatus::Healthy);
                }
                Err(error) => {
                    warn!(service = %service.name, error = %error, "Upstream degraded, excluding from schema");
                    degraded.push(service.name.clone());
                    statuses.insert(service.name.clone(), UpstreamStatus::Degraded(error.to_string()));
                }
            }
        }
        *self.statuses.write().await = statuses;

        if upstreams.is_empty() {
            warn!("No healthy upstreams, keeping previous schema");
            metrics::record_refresh(false, degraded.len());
            return Err(GatewayError::NoSchema);
        }

        let merged = match merge(upstreams) {
            Ok(merged) => merged,
            Err(error) => {
                warn!(error = %error, "Schema merge failed, keeping previous schema");
                metrics::record_refresh(false, degraded.len());
                return Err(error);
            }
        };

        let field_count = merged.field_count();
        *self.current.write().await = Some(Arc::new(merged));
        metrics::record_refresh(true, degraded.len());
        info!(healthy = healthy.len(), degraded = degraded.len(), field_count, "Schema refreshed");

        Ok(RefreshReport {
            healthy,
            degraded,
            field_count,
        })
    }

    async fn get_schema(&self) -> Option<Arc<MergedSchema>> {
        self.current.read().await.clone()
    }

    async fn statuses(&self) -> Vec<(String, UpstreamStatus)> {
        let statuses = self.statuses.read().await;
        self.services
            .iter()
            .map(|s| {
                let status = statuses
                    .get(&s.name)
                    .cloned()
                    .unwrap_or(UpstreamStatus::Pending);
                (s.name.clone(), status)
            })
            .collect()
    }
}
