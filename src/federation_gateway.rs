use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::time::Duration;

use tokio::sync::{Notify, watch};
use tokio::task::JoinHandle;
use tracing::{debug, info, instrument, warn};

use crate::error::GatewayError;
use crate::metrics;
use crate::query_executor::QueryExecutor;
use crate::query_planner::QueryPlanner;
use crate::schema_merger::MergedSchema;
use crate::schema_registry::{RefreshReport, SchemaRegistry, UpstreamStatus};
use crate::{GraphQLRequest, GraphQLResponse};

pub struct FederationGateway {
    schema_registry: Arc<dyn SchemaRegistry + Send + Sync>,
    query_planner: Arc<dyn QueryPlanner + Send + Sync>,
    query_executor: Arc<dyn QueryExecutor + Send + Sync>,
    ready: AtomicBool,
    closing: AtomicBool,
    in_flight: AtomicUsize,
    drained: Notify,
}

/// Counts a request as in flight until dropped.
struct InFlight<'a> {
    gateway: &'a FederationGateway,
}

impl<'a> InFlight<'a> {
    fn enter(gateway: &'a FederationGateway) -> Self {
        gateway.in_flight.fetch_add(1, Ordering::SeqCst);
        InFlight { gateway }
    }
}

impl Drop for InFlight<'_> {
    fn drop(&mut self) {
        if self.gateway.in_flight.fetch_sub(1, Ordering::SeqCst) == 1 {
            self.gateway.drained.notify_waiters();
        }
    }
}

impl FederationGateway {
    pub fn new(
        schema_registry: Box<dyn SchemaRegistry + Send + Sync>,
        query_planner: Box<dyn QueryPlanner + Send + Sync>,
        query_executor: Box<dyn QueryExecutor + Send + Sync>,
    ) -> Self {
        FederationGateway {
            schema_registry: Arc::from(schema_registry),
            query_planner: Arc::from(query_planner),
            query_executor: Arc::from(query_executor),
            ready: AtomicBool::new(false),
            closing: AtomicBool::new(false),
            in_flight: AtomicUsize::new(0),
            drained: Notify::new(),
        }
    }

    /// Validates, plans and executes one operation against the schema
    /// snapshot current at arrival.
    #[instrument(skip_all, fields(operation = request.operation_name.as_deref().unwrap_or("anonymous")))]
    pub async fn process_request(&self, request: GraphQLRequest) -> Result<GraphQLResponse, GatewayError> {
        let _in_flight = InFlight::enter(self);
        if self.closing.load(Ordering::SeqCst) {
            return Err(GatewayError::ShuttingDown);
        }

        let result = self.execute(&request).await;
        if let Err(error) = &result {
            debug!(error = %error, "Request did not complete cleanly");
            metrics::record_error(error.kind());
        }
        result
    }

    async fn execute(&self, request: &GraphQLRequest) -> Result<GraphQLResponse, GatewayError> {
        let schema = self
            .schema_registry
            .get_schema()
            .await
            .ok_or(GatewayError::NoSchema)?;

        let plan = match self.query_planner.plan_query(request, &schema).await {
            Ok(plan) => plan,
            Err(error) => {
                metrics::record_query("invalid");
                return Err(error);
            }
        };
        metrics::record_query(plan.operation.kind.as_str());
        debug!(fetches = plan.fetches.len(), "Query planned");

        self.query_executor.execute_plan(plan, &schema).await
    }

    /// Rebuilds the merged schema. The first success marks the gateway ready.
    pub async fn refresh(&self) -> Result<RefreshReport, GatewayError> {
        let report = self.schema_registry.refresh().await?;
        if !self.ready.swap(true, Ordering::SeqCst) {
            info!(field_count = report.field_count, "Gateway ready");
        }
        Ok(report)
    }

    pub async fn schema(&self) -> Option<Arc<MergedSchema>> {
        self.schema_registry.get_schema().await
    }

    pub async fn statuses(&self) -> Vec<(String, UpstreamStatus)> {
        self.schema_registry.statuses().await
    }

    pub fn is_ready(&self) -> bool {
        self.ready.load(Ordering::SeqCst) && !self.closing.load(Ordering::SeqCst)
    }

    pub fn is_healthy(&self) -> bool {
        !self.closing.load(Ordering::SeqCst)
    }

    pub fn in_flight(&self) -> usize {
        self.in_flight.load(Ordering::SeqCst)
    }

    /// Refreshes the schema every `interval` until `shutdown` flips to true.
    pub fn spawn_refresh_task(
        self: &Arc<Self>,
        interval: Duration,
        mut shutdown: watch::Receiver<bool>,
    ) -> JoinHandle<()> {
        let gateway = Arc::clone(self);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.tick().await;
            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        if let Err(e) = gateway.refresh().await {
                            warn!(error = %e, "Scheduled schema refresh failed");
                        }
                    }
                    changed = shutdown.changed() => {
                        if changed.is_err() || *shutdown.borrow() {
                            debug!("Refresh task stopping");
                            break;
                        }
                    }
                }
            }
        })
    }

    /// Stops admitting requests and waits up to `grace` for in-flight ones.
    /// Returns whether every request finished in time.
    pub async fn shutdown(&self, grace: Duration) -> bool {
        self.closing.store(true, Ordering::SeqCst);
        info!(in_flight = self.in_flight(), "Draining in-flight requests");

        let drain = async {
            loop {
                let notified = self.drained.notified();
                tokio::pin!(notified);
                notified.as_mut().enable();
                if self.in_flight() == 0 {
                    break;
                }
                notified.await;
            }
        };

        match tokio::time::timeout(grace, drain).await {
            Ok(()) => true,
            Err(_) => {
                warn!(in_flight = self.in_flight(), "Shutdown grace period elapsed");
                false
            }
        }
    }
}
