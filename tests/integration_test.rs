use async_trait::async_trait;
use pretty_assertions::assert_eq;
use serde_json::{Value, json};
use serial_test::serial;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use stitchway::{
    FederatedQueryPlanner, FederationGateway, FetchExecutor, GatewayError, GraphQLRequest,
    HttpTransport, IntrospectionSchemaRegistry, SchemaDocument, SchemaRegistry, ServiceConfig,
    Transport, TransportError, UpstreamStatus,
};
use tokio::sync::Notify;
use wiremock::matchers::{body_partial_json, body_string_contains, method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

const USERS_SDL: &str = r#"
type Query {
  user(id: ID!): User
  users: [User]
}

type User @key(fields: "id") {
  id: ID!
  name: String
}
"#;

const ORDERS_SDL: &str = r#"
type Query {
  order(id: ID!): Order
}

type Order {
  id: ID!
  total: Float
  buyer: User
}

type User @key(fields: "id") {
  id: ID!
}
"#;

fn service(name: &str, url: &str, sdl: Option<&str>) -> ServiceConfig {
    ServiceConfig {
        name: name.to_string(),
        url: url.to_string(),
        schema: sdl.map(str::to_string),
    }
}

fn request(query: &str) -> GraphQLRequest {
    GraphQLRequest {
        query: query.to_string(),
        ..Default::default()
    }
}

// Test fixture wiring a gateway to real HTTP upstreams
struct TestFixture {
    gateway: FederationGateway,
    users: MockServer,
    orders: MockServer,
}

impl TestFixture {
    async fn setup(upstream_timeout: Duration) -> Self {
        let users = MockServer::start().await;
        let orders = MockServer::start().await;

        let services = vec![
            service("users", &format!("{}/graphql", users.uri()), Some(USERS_SDL)),
            service("orders", &format!("{}/graphql", orders.uri()), Some(ORDERS_SDL)),
        ];
        let gateway = build_gateway(services, upstream_timeout, false);
        gateway.refresh().await.unwrap();

        TestFixture {
            gateway,
            users,
            orders,
        }
    }
}

fn build_gateway(services: Vec<ServiceConfig>, timeout: Duration, tracing: bool) -> FederationGateway {
    let transport = HttpTransport::new(Duration::from_secs(5)).unwrap();
    FederationGateway::new(
        Box::new(IntrospectionSchemaRegistry::new(services, Arc::new(transport))),
        Box::new(FederatedQueryPlanner::new()),
        Box::new(FetchExecutor::new(timeout).with_tracing(tracing)),
    )
}

async fn mount_user(server: &MockServer) {
    Mock::given(method("POST"))
        .and(path("/graphql"))
        .and(body_string_contains("user("))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "data": { "user": { "name": "Ada" } }
        })))
        .mount(server)
        .await;
}

#[tokio::test]
#[serial]
async fn test_combined_query_across_upstreams() {
    let fixture = TestFixture::setup(Duration::from_secs(2)).await;
    mount_user(&fixture.users).await;
    Mock::given(method("POST"))
        .and(path("/graphql"))
        .and(body_string_contains("order("))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "data": { "order": { "total": 12.5 } }
        })))
        .expect(1)
        .mount(&fixture.orders)
        .await;

    let response = fixture
        .gateway
        .process_request(request(r#"{ user(id: "1") { name } order(id: "9") { total } }"#))
        .await
        .unwrap();

    assert_eq!(
        response.data,
        Some(json!({ "user": { "name": "Ada" }, "order": { "total": 12.5 } }))
    );
    assert!(response.errors.is_empty());
}

#[tokio::test]
#[serial]
async fn test_entity_fields_are_resolved_by_their_owner() {
    let fixture = TestFixture::setup(Duration::from_secs(2)).await;
    Mock::given(method("POST"))
        .and(body_string_contains("order("))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "data": { "order": {
                "total": 12.5,
                "buyer": { "_gw_typename": "User", "_gw_key": "1" }
            } }
        })))
        .mount(&fixture.orders)
        .await;
    Mock::given(method("POST"))
        .and(body_string_contains("_entities"))
        .and(body_partial_json(json!({
            "variables": { "_gw_representations": [{ "__typename": "User", "id": "1" }] }
        })))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "data": { "_entities": [{ "name": "Ada" }] }
        })))
        .expect(1)
        .mount(&fixture.users)
        .await;

    let response = fixture
        .gateway
        .process_request(request(r#"{ order(id: "9") { total buyer { name } } }"#))
        .await
        .unwrap();

    assert_eq!(
        response.data,
        Some(json!({ "order": { "total": 12.5, "buyer": { "name": "Ada" } } }))
    );
}

#[tokio::test]
#[serial]
async fn test_timed_out_upstream_yields_partial_data() {
    let fixture = TestFixture::setup(Duration::from_millis(200)).await;
    mount_user(&fixture.users).await;
    Mock::given(method("POST"))
        .respond_with(
            ResponseTemplate::new(200)
                .set_body_json(json!({ "data": { "order": { "total": 1.0 } } }))
                .set_delay(Duration::from_secs(2)),
        )
        .mount(&fixture.orders)
        .await;

    let err = fixture
        .gateway
        .process_request(request(r#"{ user(id: "1") { name } order(id: "9") { total } }"#))
        .await
        .unwrap_err();

    let GatewayError::PartialFailure { response, failed } = err else {
        panic!("expected a partial failure, got {:?}", err);
    };
    assert_eq!(failed, vec!["orders".to_string()]);
    assert_eq!(
        response.data,
        Some(json!({ "user": { "name": "Ada" }, "order": null }))
    );
    assert_eq!(response.errors.len(), 1);
    assert_eq!(response.errors[0].path, Some(vec![json!("order")]));
    let extensions = response.errors[0].extensions.as_ref().unwrap();
    assert_eq!(extensions["code"], json!("UPSTREAM_FAILED"));
    assert_eq!(extensions["service"], json!("orders"));
}

#[tokio::test]
#[serial]
async fn test_all_root_fetches_failing_is_an_upstream_failure() {
    let fixture = TestFixture::setup(Duration::from_secs(2)).await;
    Mock::given(method("POST"))
        .respond_with(ResponseTemplate::new(500))
        .mount(&fixture.orders)
        .await;

    let err = fixture
        .gateway
        .process_request(request(r#"{ order(id: "9") { total } }"#))
        .await
        .unwrap_err();
    assert!(matches!(err, GatewayError::UpstreamFailed { ref service, .. } if service == "orders"));
}

#[tokio::test]
#[serial]
async fn test_upstream_errors_are_tagged_with_service() {
    let fixture = TestFixture::setup(Duration::from_secs(2)).await;
    Mock::given(method("POST"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "data": { "user": null },
            "errors": [{ "message": "user not found", "path": ["user"] }]
        })))
        .mount(&fixture.users)
        .await;

    let response = fixture
        .gateway
        .process_request(request(r#"{ user(id: "404") { name } }"#))
        .await
        .unwrap();
    assert_eq!(response.data, Some(json!({ "user": null })));
    assert_eq!(response.errors[0].message, "user not found");
    assert_eq!(
        response.errors[0].extensions.as_ref().unwrap()["service"],
        json!("users")
    );
}

#[tokio::test]
#[serial]
async fn test_validation_fails_before_dispatch() {
    let fixture = TestFixture::setup(Duration::from_secs(2)).await;
    Mock::given(method("POST"))
        .respond_with(ResponseTemplate::new(200))
        .expect(0)
        .mount(&fixture.users)
        .await;

    let err = fixture
        .gateway
        .process_request(request("{ user { name } }"))
        .await
        .unwrap_err();
    assert!(matches!(err, GatewayError::ValidationFailed(_)));
}

#[tokio::test]
#[serial]
async fn test_engine_tracing_reports_each_fetch() {
    let users = MockServer::start().await;
    mount_user(&users).await;
    let gateway = build_gateway(
        vec![service("users", &format!("{}/graphql", users.uri()), Some(USERS_SDL))],
        Duration::from_secs(2),
        true,
    );
    gateway.refresh().await.unwrap();

    let response = gateway
        .process_request(request(r#"{ user(id: "1") { name } }"#))
        .await
        .unwrap();
    let tracing = &response.extensions.unwrap()["tracing"];
    assert_eq!(tracing["fetches"][0]["service"], json!("users"));
    assert!(tracing["duration"].as_u64().is_some());
}

fn introspection_body(fields: &[&str]) -> Value {
    let fields: Vec<Value> = fields
        .iter()
        .map(|name| {
            json!({
                "name": name,
                "args": [],
                "type": { "kind": "SCALAR", "name": "String", "ofType": null }
            })
        })
        .collect();
    json!({
        "data": { "__schema": {
            "queryType": { "name": "Query" },
            "mutationType": null,
            "types": [
                { "kind": "OBJECT", "name": "Query", "fields": fields, "interfaces": [] },
                { "kind": "SCALAR", "name": "String" }
            ]
        } }
    })
}

#[tokio::test]
#[serial]
async fn test_introspects_upstreams_over_http() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(body_string_contains("__schema"))
        .respond_with(ResponseTemplate::new(200).set_body_json(introspection_body(&["ping"])))
        .mount(&server)
        .await;
    Mock::given(method("POST"))
        .and(body_string_contains("ping"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({ "data": { "ping": "pong" } })))
        .mount(&server)
        .await;

    let gateway = build_gateway(
        vec![service("pinger", &format!("{}/graphql", server.uri()), None)],
        Duration::from_secs(2),
        false,
    );
    gateway.refresh().await.unwrap();
    assert!(gateway.is_ready());

    let response = gateway.process_request(request("{ ping }")).await.unwrap();
    assert_eq!(response.data, Some(json!({ "ping": "pong" })));
    assert!(gateway.schema().await.unwrap().to_sdl().contains("ping: String"));
}

#[tokio::test]
#[serial]
async fn test_unreachable_upstream_does_not_affect_others() {
    let users = MockServer::start().await;
    mount_user(&users).await;
    let gateway = build_gateway(
        vec![
            service("users", &format!("{}/graphql", users.uri()), Some(USERS_SDL)),
            service("orders", "http://127.0.0.1:9/graphql", None),
        ],
        Duration::from_secs(2),
        false,
    );

    let report = gateway.refresh().await.unwrap();
    assert_eq!(report.degraded, vec!["orders".to_string()]);
    let statuses = gateway.statuses().await;
    assert!(matches!(statuses[1].1, UpstreamStatus::Degraded(_)));

    let response = gateway
        .process_request(request(r#"{ user(id: "1") { name } }"#))
        .await
        .unwrap();
    assert_eq!(response.data, Some(json!({ "user": { "name": "Ada" } })));
    assert!(response.errors.is_empty());
}

#[tokio::test]
async fn test_conflicting_root_fields_name_both_upstreams() {
    let gateway = build_gateway(
        vec![
            service("users", "http://users.test/graphql", Some(USERS_SDL)),
            service("accounts", "http://accounts.test/graphql", Some(USERS_SDL)),
        ],
        Duration::from_secs(2),
        false,
    );

    let err = gateway.refresh().await.unwrap_err();
    let GatewayError::Conflict { first, second, .. } = &err else {
        panic!("expected a conflict, got {:?}", err);
    };
    assert_eq!((first.as_str(), second.as_str()), ("users", "accounts"));
    assert!(!gateway.is_ready());
}

#[tokio::test]
async fn test_disjoint_schemas_keep_every_field() {
    let registry = IntrospectionSchemaRegistry::new(
        vec![
            service("a", "http://a.test/graphql", Some("type Query { alpha: String beta: Int }")),
            service("b", "http://b.test/graphql", Some("type Query { gamma: String }")),
        ],
        Arc::new(HttpTransport::new(Duration::from_secs(1)).unwrap()),
    );
    let report = registry.refresh().await.unwrap();

    let a = SchemaDocument::from_sdl("type Query { alpha: String beta: Int }").unwrap();
    let b = SchemaDocument::from_sdl("type Query { gamma: String }").unwrap();
    assert_eq!(report.field_count, a.field_count() + b.field_count());
}

// Upstream whose schema can change between refreshes and whose data
// responses can be held open.
struct SwitchableUpstream {
    fields: Mutex<Vec<&'static str>>,
    down: AtomicBool,
    hold: AtomicBool,
    entered: AtomicBool,
    release: Notify,
}

#[async_trait]
impl Transport for SwitchableUpstream {
    async fn send(&self, _url: &str, request: &GraphQLRequest) -> Result<Value, TransportError> {
        if request.query.contains("__schema") {
            if self.down.load(Ordering::SeqCst) {
                return Err(TransportError::Status(503));
            }
            let fields = self.fields.lock().unwrap().clone();
            return Ok(introspection_body(&fields));
        }
        if self.hold.load(Ordering::SeqCst) {
            self.entered.store(true, Ordering::SeqCst);
            self.release.notified().await;
        }
        let fields = self.fields.lock().unwrap().clone();
        let data: serde_json::Map<String, Value> = fields
            .iter()
            .map(|f| (f.to_string(), json!("value")))
            .chain(std::iter::once(("old".to_string(), json!("value"))))
            .collect();
        Ok(json!({ "data": data }))
    }
}

#[tokio::test]
async fn test_in_flight_request_keeps_its_snapshot() {
    let upstream = Arc::new(SwitchableUpstream {
        fields: Mutex::new(vec!["old"]),
        down: AtomicBool::new(false),
        hold: AtomicBool::new(true),
        entered: AtomicBool::new(false),
        release: Notify::new(),
    });
    let gateway = Arc::new(FederationGateway::new(
        Box::new(IntrospectionSchemaRegistry::new(
            vec![service("switch", "http://switch.test/graphql", None)],
            upstream.clone(),
        )),
        Box::new(FederatedQueryPlanner::new()),
        Box::new(FetchExecutor::new(Duration::from_secs(5))),
    ));
    gateway.refresh().await.unwrap();

    let in_flight = {
        let gateway = Arc::clone(&gateway);
        tokio::spawn(async move { gateway.process_request(request("{ old }")).await })
    };
    while !upstream.entered.load(Ordering::SeqCst) {
        tokio::task::yield_now().await;
    }

    *upstream.fields.lock().unwrap() = vec!["new"];
    upstream.hold.store(false, Ordering::SeqCst);
    gateway.refresh().await.unwrap();

    let err = gateway.process_request(request("{ old }")).await.unwrap_err();
    assert!(matches!(err, GatewayError::ValidationFailed(_)));
    let fresh = gateway.process_request(request("{ new }")).await.unwrap();
    assert_eq!(fresh.data, Some(json!({ "new": "value" })));

    upstream.release.notify_one();
    let old = in_flight.await.unwrap().unwrap();
    assert_eq!(old.data, Some(json!({ "old": "value" })));
}

#[tokio::test]
async fn test_failed_refresh_keeps_serving_previous_schema() {
    let upstream = Arc::new(SwitchableUpstream {
        fields: Mutex::new(vec!["old"]),
        down: AtomicBool::new(false),
        hold: AtomicBool::new(false),
        entered: AtomicBool::new(false),
        release: Notify::new(),
    });
    let gateway = FederationGateway::new(
        Box::new(IntrospectionSchemaRegistry::new(
            vec![service("switch", "http://switch.test/graphql", None)],
            upstream.clone(),
        )),
        Box::new(FederatedQueryPlanner::new()),
        Box::new(FetchExecutor::new(Duration::from_secs(5))),
    );
    gateway.refresh().await.unwrap();
    let before = gateway.schema().await.unwrap().to_sdl();

    upstream.down.store(true, Ordering::SeqCst);
    *upstream.fields.lock().unwrap() = vec!["new"];
    assert!(matches!(gateway.refresh().await, Err(GatewayError::NoSchema)));

    let after = gateway.schema().await.unwrap().to_sdl();
    assert_eq!(after, before);
    assert!(after.contains("old"));
    assert!(gateway.is_ready());

    let response = gateway.process_request(request("{ old }")).await.unwrap();
    assert_eq!(response.data, Some(json!({ "old": "value" })));
    let statuses = gateway.statuses().await;
    assert!(matches!(statuses[0].1, UpstreamStatus::Degraded(_)));
}

// In-memory upstreams answering fixed bodies per URL and logging each call.
// URLs without a body fail with a 500.
struct ScriptedUpstreams {
    bodies: Vec<(&'static str, Value)>,
    calls: Mutex<Vec<(String, String)>>,
}

impl ScriptedUpstreams {
    fn new(bodies: Vec<(&'static str, Value)>) -> Arc<Self> {
        Arc::new(ScriptedUpstreams {
            bodies,
            calls: Mutex::new(Vec::new()),
        })
    }

    fn calls(&self) -> Vec<(String, String)> {
        self.calls.lock().unwrap().clone()
    }
}

#[async_trait]
impl Transport for ScriptedUpstreams {
    async fn send(&self, url: &str, request: &GraphQLRequest) -> Result<Value, TransportError> {
        self.calls
            .lock()
            .unwrap()
            .push((url.to_string(), request.query.clone()));
        self.bodies
            .iter()
            .find(|(u, _)| *u == url)
            .map(|(_, body)| body.clone())
            .ok_or(TransportError::Status(500))
    }
}

async fn scripted_gateway(services: Vec<ServiceConfig>, upstreams: Arc<ScriptedUpstreams>) -> FederationGateway {
    let gateway = FederationGateway::new(
        Box::new(IntrospectionSchemaRegistry::new(services, upstreams)),
        Box::new(FederatedQueryPlanner::new()),
        Box::new(FetchExecutor::new(Duration::from_secs(2))),
    );
    gateway.refresh().await.unwrap();
    gateway
}

#[tokio::test]
async fn test_mutations_reach_upstreams_in_document_order() {
    let upstreams = ScriptedUpstreams::new(vec![
        (
            "http://accounts.test/graphql",
            json!({ "data": { "open": 1, "close": 3 } }),
        ),
        ("http://ledger.test/graphql", json!({ "data": { "post": 2 } })),
    ]);
    let gateway = scripted_gateway(
        vec![
            service(
                "accounts",
                "http://accounts.test/graphql",
                Some("type Query { me: String } type Mutation { open: Int close: Int }"),
            ),
            service(
                "ledger",
                "http://ledger.test/graphql",
                Some("type Query { balance: Int } type Mutation { post: Int }"),
            ),
        ],
        upstreams.clone(),
    )
    .await;

    let response = gateway
        .process_request(request("mutation { open post close }"))
        .await
        .unwrap();

    assert_eq!(
        response.data,
        Some(json!({ "open": 1, "post": 2, "close": 3 }))
    );
    assert_eq!(
        upstreams.calls(),
        vec![
            ("http://accounts.test/graphql".to_string(), "mutation { open }".to_string()),
            ("http://ledger.test/graphql".to_string(), "mutation { post }".to_string()),
            ("http://accounts.test/graphql".to_string(), "mutation { close }".to_string()),
        ]
    );
}

#[tokio::test]
async fn test_failed_entity_fetch_reports_each_list_item() {
    let upstreams = ScriptedUpstreams::new(vec![(
        "http://orders.test/graphql",
        json!({ "data": { "orders": [
            { "total": 1.5, "buyer": { "_gw_typename": "User", "_gw_key": "1" } },
            { "total": 2.5, "buyer": { "_gw_typename": "User", "_gw_key": "2" } }
        ] } }),
    )]);
    let gateway = scripted_gateway(
        vec![
            service("users", "http://users.test/graphql", Some(USERS_SDL)),
            service(
                "orders",
                "http://orders.test/graphql",
                Some(
                    r#"type Query { orders: [Order] }
                       type Order { id: ID! total: Float buyer: User }
                       type User @key(fields: "id") { id: ID! }"#,
                ),
            ),
        ],
        upstreams.clone(),
    )
    .await;

    let err = gateway
        .process_request(request("{ orders { total buyer { name } } }"))
        .await
        .unwrap_err();

    let GatewayError::PartialFailure { response, failed } = err else {
        panic!("expected a partial failure, got {:?}", err);
    };
    assert_eq!(failed, vec!["users".to_string()]);
    assert_eq!(
        response.data,
        Some(json!({ "orders": [
            { "total": 1.5, "buyer": { "name": null } },
            { "total": 2.5, "buyer": { "name": null } }
        ] }))
    );
    let paths: Vec<Option<Vec<Value>>> = response.errors.iter().map(|e| e.path.clone()).collect();
    assert_eq!(
        paths,
        vec![
            Some(vec![json!("orders"), json!(0), json!("buyer"), json!("name")]),
            Some(vec![json!("orders"), json!(1), json!("buyer"), json!("name")]),
        ]
    );
    for error in &response.errors {
        let extensions = error.extensions.as_ref().unwrap();
        assert_eq!(extensions["service"], json!("users"));
        assert_eq!(extensions["code"], json!("UPSTREAM_FAILED"));
    }
    assert_eq!(upstreams.calls().len(), 2);
}
