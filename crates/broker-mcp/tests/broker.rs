use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use broker_core::{BrokerError, Capability, FallbackTool, Result, ServerConfig};
use broker_mcp::transport::Transport;
use broker_mcp::types::{JsonRpcNotification, JsonRpcRequest, JsonRpcResponse};
use broker_mcp::{
    Connector, FallbackCatalog, McpBroker, McpClient, McpResource, McpTool, ProviderCapabilities,
    ProviderClient,
};
use serde_json::{json, Value};
use tokio::sync::{Notify, Semaphore};

/// In-memory provider that echoes calls back with its own id
struct FakeProvider {
    id: String,
    capabilities: ProviderCapabilities,
    tools: Mutex<Vec<McpTool>>,
    resources: Vec<McpResource>,
    fail_listing: AtomicBool,
    hang_listing: AtomicBool,
    hang_close: AtomicBool,
    fail_resources: bool,
    gate: Mutex<Option<Arc<Semaphore>>>,
    listing_started: Notify,
    list_calls: AtomicUsize,
    closed: AtomicBool,
}

impl FakeProvider {
    fn new(id: &str, tools: &[&str]) -> Self {
        Self {
            id: id.to_string(),
            capabilities: ProviderCapabilities::all(),
            tools: Mutex::new(tools.iter().map(|n| McpTool::new(*n)).collect()),
            resources: Vec::new(),
            fail_listing: AtomicBool::new(false),
            hang_listing: AtomicBool::new(false),
            hang_close: AtomicBool::new(false),
            fail_resources: false,
            gate: Mutex::new(None),
            listing_started: Notify::new(),
            list_calls: AtomicUsize::new(0),
            closed: AtomicBool::new(false),
        }
    }

    fn with_capabilities(mut self, capabilities: ProviderCapabilities) -> Self {
        self.capabilities = capabilities;
        self
    }

    fn with_resources(mut self, uris: &[&str]) -> Self {
        self.resources = uris
            .iter()
            .map(|uri| McpResource {
                uri: uri.to_string(),
                name: Some(format!("{} resource", self.id)),
                description: None,
                mime_type: Some("text/plain".into()),
            })
            .collect();
        self
    }

    fn failing_resources(mut self) -> Self {
        self.fail_resources = true;
        self
    }

    fn set_tools(&self, names: &[&str]) {
        *self.tools.lock().unwrap() = names.iter().map(|n| McpTool::new(*n)).collect();
    }

    /// Subsequent listings block until a permit is added to the returned gate
    fn gate_listing(&self) -> Arc<Semaphore> {
        let gate = Arc::new(Semaphore::new(0));
        *self.gate.lock().unwrap() = Some(gate.clone());
        gate
    }
}

#[async_trait]
impl ProviderClient for FakeProvider {
    fn capabilities(&self) -> ProviderCapabilities {
        self.capabilities
    }

    async fn list_tools(&self) -> Result<Vec<McpTool>> {
        self.list_calls.fetch_add(1, Ordering::SeqCst);

        let gate = self.gate.lock().unwrap().clone();
        if let Some(gate) = gate {
            self.listing_started.notify_one();
            let permit = gate.acquire().await.unwrap();
            permit.forget();
        }
        if self.hang_listing.load(Ordering::SeqCst) {
            futures::future::pending::<()>().await;
        }
        if self.fail_listing.load(Ordering::SeqCst) {
            return Err(BrokerError::Mcp(format!("{} listing exploded", self.id)));
        }
        Ok(self.tools.lock().unwrap().clone())
    }

    async fn call_tool(&self, name: &str, arguments: Value) -> Result<Value> {
        Ok(json!({ "server": self.id, "tool": name, "arguments": arguments }))
    }

    async fn list_resources(&self) -> Result<Vec<McpResource>> {
        if self.fail_resources {
            return Err(BrokerError::Transport(format!("{} socket closed", self.id)));
        }
        Ok(self.resources.clone())
    }

    async fn read_resource(&self, uri: &str) -> Result<Value> {
        Ok(json!({ "contents": [{ "uri": uri, "text": format!("from {}", self.id) }] }))
    }

    async fn close(&self) -> Result<()> {
        self.closed.store(true, Ordering::SeqCst);
        if self.hang_close.load(Ordering::SeqCst) {
            futures::future::pending::<()>().await;
        }
        if self.id == "flaky" {
            return Err(BrokerError::Transport("close failed".into()));
        }
        Ok(())
    }
}

#[derive(Default)]
struct FakeConnector {
    providers: HashMap<String, Arc<FakeProvider>>,
    failing: HashSet<String>,
}

impl FakeConnector {
    fn provider(mut self, provider: FakeProvider) -> Self {
        self.providers.insert(provider.id.clone(), Arc::new(provider));
        self
    }

    fn failing(mut self, id: &str) -> Self {
        self.failing.insert(id.to_string());
        self
    }

    fn get(&self, id: &str) -> Arc<FakeProvider> {
        self.providers[id].clone()
    }
}

#[async_trait]
impl Connector for FakeConnector {
    async fn connect(&self, config: &ServerConfig, _timeout_ms: u64) -> Result<Arc<dyn ProviderClient>> {
        if self.failing.contains(&config.id) {
            return Err(BrokerError::Transport(format!("{}: connection refused", config.id)));
        }
        let provider = self
            .providers
            .get(&config.id)
            .cloned()
            .ok_or_else(|| BrokerError::Transport(format!("{}: no such provider", config.id)))?;
        Ok(provider as Arc<dyn ProviderClient>)
    }
}

/// MCP server over an in-memory transport that handles the handshake and
/// `tools/list` but never answers `tools/call` or `resources/read`
#[derive(Debug, Default)]
struct StalledServer {
    replies: VecDeque<JsonRpcResponse>,
}

#[async_trait]
impl Transport for StalledServer {
    async fn send_request(&mut self, request: JsonRpcRequest) -> Result<()> {
        let result = match request.method.as_str() {
            "initialize" => json!({
                "protocolVersion": "2024-11-05",
                "capabilities": { "tools": {}, "resources": {} },
                "serverInfo": { "name": "meters", "version": "1.0.0" }
            }),
            "tools/list" => json!({ "tools": [{ "name": "list_meters" }] }),
            _ => return Ok(()),
        };
        self.replies.push_back(JsonRpcResponse {
            jsonrpc: "2.0".into(),
            id: request.id.into(),
            result: Some(result),
            error: None,
        });
        Ok(())
    }

    async fn send_notification(&mut self, _notification: JsonRpcNotification) -> Result<()> {
        Ok(())
    }

    async fn receive_response(&mut self) -> Result<Option<JsonRpcResponse>> {
        Ok(self.replies.pop_front())
    }

    async fn close(&mut self) -> Result<()> {
        Ok(())
    }
}

struct StalledConnector;

#[async_trait]
impl Connector for StalledConnector {
    async fn connect(&self, config: &ServerConfig, timeout_ms: u64) -> Result<Arc<dyn ProviderClient>> {
        let mut client = McpClient::new(config.id.clone(), Box::new(StalledServer::default()), timeout_ms);
        client.initialize().await?;
        Ok(Arc::new(client))
    }
}

async fn started(servers: Vec<ServerConfig>, connector: Arc<FakeConnector>) -> McpBroker {
    let broker = McpBroker::new(servers).with_connector(connector);
    broker.init().await;
    broker
}

fn names(tools: &[broker_core::NamespacedToolDefinition]) -> Vec<&str> {
    tools.iter().map(|t| t.name.as_str()).collect()
}

#[tokio::test]
async fn live_provider_plus_fallback_for_unreachable_one() {
    let connector = Arc::new(
        FakeConnector::default()
            .provider(FakeProvider::new("meters", &["list_meters"]))
            .failing("employee"),
    );
    let broker = started(
        vec![
            ServerConfig::stdio("meters", "meters-mcp"),
            ServerConfig::websocket("employee", "wss://tools.example.com/employee"),
        ],
        connector,
    )
    .await;

    let tools = broker.list_tools(false).await;

    let live = tools.iter().find(|t| t.name == "meters_list_meters").unwrap();
    assert!(!live.fallback);
    assert_eq!(live.server_id, "meters");

    let expected: Vec<String> = FallbackCatalog::builtin()
        .tools_for("employee")
        .iter()
        .map(|t| format!("employee_{}", t.name))
        .collect();
    for name in &expected {
        let entry = tools.iter().find(|t| &t.name == name).unwrap();
        assert!(entry.fallback);
        assert_eq!(entry.parameters, json!({ "type": "object", "properties": {} }));
    }
    assert!(expected.contains(&"employee_employee_health".to_string()));

    // meters contributed live tools, so none of its fallback entries appear
    assert!(tools.iter().filter(|t| t.server_id == "meters").all(|t| !t.fallback));

    let result = broker.call_tool("meters_list_meters", json!({ "site": "A" })).await.unwrap();
    assert_eq!(result, json!({ "server": "meters", "tool": "list_meters", "arguments": { "site": "A" } }));

    let err = broker.call_tool("employee_employee_health", json!({})).await.unwrap_err();
    assert!(matches!(err, BrokerError::ServerNotFound(ref id) if id == "employee"));
}

#[tokio::test]
async fn allow_list_keeps_only_listed_tools() {
    let connector = Arc::new(FakeConnector::default().provider(FakeProvider::new(
        "posbistro",
        &["posbistro_health", "posbistro_metrics_snapshot"],
    )));
    let broker = started(
        vec![ServerConfig::stdio("posbistro", "posbistro-mcp").with_allowed_tools(["posbistro_health"])],
        connector,
    )
    .await;

    let tools = broker.list_tools(false).await;
    assert_eq!(names(&tools), vec!["posbistro_posbistro_health"]);
}

#[tokio::test]
async fn unknown_tool_is_a_routing_error() {
    let broker = started(vec![], Arc::new(FakeConnector::default())).await;
    broker.list_tools(false).await;

    let err = broker.call_tool("unknown_tool_xyz", json!({})).await.unwrap_err();
    assert!(matches!(err, BrokerError::UnknownTool(ref name) if name == "unknown_tool_xyz"));
    assert!(err.is_routing());
}

#[tokio::test]
async fn call_before_any_listing_is_unknown_tool() {
    let connector = Arc::new(FakeConnector::default().provider(FakeProvider::new("meters", &["list_meters"])));
    let broker = started(vec![ServerConfig::stdio("meters", "meters-mcp")], connector).await;

    let err = broker.call_tool("meters_list_meters", json!({})).await.unwrap_err();
    assert!(matches!(err, BrokerError::UnknownTool(_)));
}

#[tokio::test]
async fn colliding_names_across_servers_stay_routable() {
    let connector = Arc::new(
        FakeConnector::default()
            .provider(FakeProvider::new("server.a", &["x"]))
            .provider(FakeProvider::new("server_a", &["x"])),
    );
    let broker = started(
        vec![
            ServerConfig::stdio("server.a", "a"),
            ServerConfig::stdio("server_a", "b"),
        ],
        connector,
    )
    .await;

    let tools = broker.list_tools(false).await;
    assert_eq!(names(&tools), vec!["server_a_x", "server_a_x_1"]);

    for def in tools.iter() {
        let route = broker.resolve_tool(&def.name).await.unwrap();
        assert_eq!(route.server_id, def.server_id);
        assert_eq!(route.original_name, def.original_name);

        let result = broker.call_tool(&def.name, json!({})).await.unwrap();
        assert_eq!(result["server"], def.server_id.as_str());
        assert_eq!(result["tool"], "x");
    }
}

#[tokio::test]
async fn blocked_globs_only_remove_full_matches() {
    let connector = Arc::new(
        FakeConnector::default().provider(FakeProvider::new("meters", &["foo_reset", "barfoo", "list_meters"])),
    );
    let broker = started(
        vec![ServerConfig::stdio("meters", "meters-mcp").with_blocked_tools(["foo*"])],
        connector,
    )
    .await;

    let tools = broker.list_tools(false).await;
    assert_eq!(names(&tools), vec!["meters_barfoo", "meters_list_meters"]);
}

#[tokio::test]
async fn cached_listing_is_reused_until_forced() {
    let connector = Arc::new(FakeConnector::default().provider(FakeProvider::new("meters", &["list_meters"])));
    let broker = started(vec![ServerConfig::stdio("meters", "meters-mcp")], connector.clone()).await;
    let provider = connector.get("meters");

    let first = broker.list_tools(false).await;
    let second = broker.list_tools(false).await;
    assert!(Arc::ptr_eq(&first, &second));
    assert_eq!(provider.list_calls.load(Ordering::SeqCst), 1);

    provider.set_tools(&["read_meter"]);
    let refreshed = broker.list_tools(true).await;
    assert!(!Arc::ptr_eq(&first, &refreshed));
    assert_eq!(names(&refreshed), vec!["meters_read_meter"]);

    // The name map moved with the cache
    assert!(broker.call_tool("meters_read_meter", json!({})).await.is_ok());
    let err = broker.call_tool("meters_list_meters", json!({})).await.unwrap_err();
    assert!(matches!(err, BrokerError::UnknownTool(_)));
}

#[tokio::test]
async fn listing_failure_falls_back_and_skips_taken_names() {
    let meters = FakeProvider::new("meters", &["list_meters"]);
    meters.fail_listing.store(true, Ordering::SeqCst);
    let connector = Arc::new(
        FakeConnector::default()
            .provider(FakeProvider::new("meters_list", &["meters"]))
            .provider(meters),
    );
    let broker = started(
        vec![
            ServerConfig::stdio("meters_list", "a"),
            ServerConfig::stdio("meters", "b"),
        ],
        connector,
    )
    .await;

    let tools = broker.list_tools(false).await;

    // "meters_list_meters" is already the live tool of server "meters_list"
    assert_eq!(names(&tools), vec!["meters_list_meters", "meters_meters_health"]);
    assert!(!tools[0].fallback);
    assert!(tools[1].fallback);

    let unique: HashSet<_> = tools.iter().map(|t| t.name.as_str()).collect();
    assert_eq!(unique.len(), tools.len());

    // fallback entry of a connected provider is still forwarded to it
    let result = broker.call_tool("meters_meters_health", json!({})).await.unwrap();
    assert_eq!(result["server"], "meters");
}

#[tokio::test]
async fn fully_filtered_provider_gets_configured_fallback() {
    let connector = Arc::new(FakeConnector::default().provider(FakeProvider::new("billing", &["debug_dump"])));
    let broker = started(
        vec![ServerConfig::stdio("billing", "billing-mcp")
            .with_blocked_tools(["debug_*"])
            .with_fallback_tools(vec![FallbackTool::new("billing_health", "Billing health")])],
        connector,
    )
    .await;

    let tools = broker.list_tools(false).await;
    assert_eq!(names(&tools), vec!["billing_billing_health"]);
    assert_eq!(tools[0].description.as_deref(), Some("Billing health"));
}

#[tokio::test]
async fn fallback_outside_allow_list_is_refused_on_call() {
    let posbistro = FakeProvider::new("posbistro", &[]);
    posbistro.fail_listing.store(true, Ordering::SeqCst);
    let connector = Arc::new(FakeConnector::default().provider(posbistro));
    let broker = started(
        vec![ServerConfig::stdio("posbistro", "posbistro-mcp").with_allowed_tools(["posbistro_health"])],
        connector,
    )
    .await;

    let tools = broker.list_tools(false).await;
    assert!(names(&tools).contains(&"posbistro_posbistro_daily_sales"));

    let err = broker
        .call_tool("posbistro_posbistro_daily_sales", json!({}))
        .await
        .unwrap_err();
    assert!(matches!(err, BrokerError::ToolNotAllowed { ref tool, .. } if tool == "posbistro_daily_sales"));

    assert!(broker.call_tool("posbistro_posbistro_health", json!({})).await.is_ok());
}

#[tokio::test]
async fn missing_capabilities_are_reported() {
    let connector = Arc::new(
        FakeConnector::default()
            .provider(FakeProvider::new("inventory", &["list_stock_levels"]).with_capabilities(ProviderCapabilities::default())),
    );
    let broker = started(vec![ServerConfig::stdio("inventory", "inventory-mcp")], connector.clone()).await;

    // No listing capability: treated as zero tools, fallback injected
    let tools = broker.list_tools(false).await;
    assert!(tools.iter().all(|t| t.fallback));
    assert_eq!(connector.get("inventory").list_calls.load(Ordering::SeqCst), 0);

    let err = broker.call_tool("inventory_inventory_health", json!({})).await.unwrap_err();
    assert!(matches!(err, BrokerError::Unsupported { capability: Capability::CallTool, .. }));
    assert!(err.to_string().contains("does not support tool calling"));

    let err = broker.read_resource("inventory", "inv://stock").await.unwrap_err();
    assert!(err.to_string().contains("does not expose resources API"));
}

#[tokio::test]
async fn resources_skip_failures_and_unsupported_providers() {
    let connector = Arc::new(
        FakeConnector::default()
            .provider(FakeProvider::new("docs", &[]).with_resources(&["docs://a", "docs://b"]))
            .provider(FakeProvider::new("broken", &[]).failing_resources())
            .provider(FakeProvider::new("tools", &["x"]).with_capabilities(ProviderCapabilities::tools_only())),
    );
    let broker = started(
        vec![
            ServerConfig::stdio("docs", "docs"),
            ServerConfig::stdio("broken", "broken"),
            ServerConfig::stdio("tools", "tools"),
        ],
        connector,
    )
    .await;

    let resources = broker.list_resources().await;
    let uris: Vec<_> = resources.iter().map(|r| r.uri.as_str()).collect();
    assert_eq!(uris, vec!["docs://a", "docs://b"]);
    assert!(resources.iter().all(|r| r.server_id == "docs"));
    assert_eq!(resources[0].mime_type.as_deref(), Some("text/plain"));

    let content = broker.read_resource("docs", "docs://a").await.unwrap();
    assert_eq!(content["contents"][0]["text"], "from docs");

    let err = broker.read_resource("nowhere", "docs://a").await.unwrap_err();
    assert!(matches!(err, BrokerError::ServerNotFound(_)));
}

#[tokio::test(start_paused = true)]
async fn hung_listing_times_out_into_fallback() {
    let meters = FakeProvider::new("meters", &["list_meters"]);
    meters.hang_listing.store(true, Ordering::SeqCst);
    let connector = Arc::new(FakeConnector::default().provider(meters));
    let broker = started(
        vec![ServerConfig::stdio("meters", "meters-mcp").with_timeout_ms(500)],
        connector,
    )
    .await;

    let tools = broker.list_tools(false).await;
    assert!(!tools.is_empty());
    assert!(tools.iter().all(|t| t.fallback && t.server_id == "meters"));
}

#[tokio::test]
async fn routing_uses_previous_snapshot_during_refresh() {
    let connector = Arc::new(FakeConnector::default().provider(FakeProvider::new("meters", &["list_meters"])));
    let broker = Arc::new(started(vec![ServerConfig::stdio("meters", "meters-mcp")], connector.clone()).await);
    let provider = connector.get("meters");

    broker.list_tools(false).await;
    let gate = provider.gate_listing();

    let refreshing = {
        let broker = broker.clone();
        tokio::spawn(async move { broker.list_tools(true).await })
    };
    provider.listing_started.notified().await;

    // Mid-refresh the old name map is still authoritative
    let result = broker.call_tool("meters_list_meters", json!({})).await.unwrap();
    assert_eq!(result["tool"], "list_meters");

    gate.add_permits(1);
    let refreshed = refreshing.await.unwrap();
    assert_eq!(names(&refreshed), vec!["meters_list_meters"]);
}

#[tokio::test]
async fn concurrent_refreshes_collapse_into_one_pass() {
    let connector = Arc::new(FakeConnector::default().provider(FakeProvider::new("meters", &["list_meters"])));
    let broker = Arc::new(started(vec![ServerConfig::stdio("meters", "meters-mcp")], connector.clone()).await);
    let provider = connector.get("meters");
    let gate = provider.gate_listing();

    let first = {
        let broker = broker.clone();
        tokio::spawn(async move { broker.list_tools(true).await })
    };
    provider.listing_started.notified().await;

    let second = {
        let broker = broker.clone();
        tokio::spawn(async move { broker.list_tools(true).await })
    };
    for _ in 0..5 {
        tokio::task::yield_now().await;
    }

    gate.add_permits(1);
    let first = first.await.unwrap();
    let second = second.await.unwrap();

    assert!(Arc::ptr_eq(&first, &second));
    assert_eq!(provider.list_calls.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn shutdown_closes_everything_despite_failures() {
    let connector = Arc::new(
        FakeConnector::default()
            .provider(FakeProvider::new("flaky", &["x"]))
            .provider(FakeProvider::new("meters", &["list_meters"])),
    );
    let broker = started(
        vec![
            ServerConfig::stdio("flaky", "flaky"),
            ServerConfig::stdio("meters", "meters-mcp"),
        ],
        connector.clone(),
    )
    .await;
    broker.list_tools(false).await;

    broker.shutdown().await;

    assert!(connector.get("flaky").closed.load(Ordering::SeqCst));
    assert!(connector.get("meters").closed.load(Ordering::SeqCst));
    assert!(broker.connected_servers().await.is_empty());

    let err = broker.call_tool("meters_list_meters", json!({})).await.unwrap_err();
    assert!(matches!(err, BrokerError::ServerNotFound(_)));
}

#[tokio::test(start_paused = true)]
async fn unanswered_call_is_a_typed_timeout() {
    let broker = McpBroker::new(vec![ServerConfig::stdio("meters", "meters-mcp").with_timeout_ms(500)])
        .with_connector(Arc::new(StalledConnector));
    broker.init().await;

    let tools = broker.list_tools(false).await;
    assert_eq!(names(&tools), vec!["meters_list_meters"]);

    let err = broker.call_tool("meters_list_meters", json!({})).await.unwrap_err();
    assert!(matches!(
        err,
        BrokerError::Timeout { ref server, operation: "tools/call", timeout_ms: 500 } if server == "meters"
    ));

    broker.shutdown().await;
}

#[tokio::test(start_paused = true)]
async fn unanswered_read_is_a_typed_timeout() {
    let broker = McpBroker::new(vec![ServerConfig::stdio("meters", "meters-mcp")])
        .with_connector(Arc::new(StalledConnector))
        .with_default_timeout_ms(750);
    broker.init().await;

    let err = broker.read_resource("meters", "meters://site/A").await.unwrap_err();
    assert!(matches!(
        err,
        BrokerError::Timeout { operation: "resources/read", timeout_ms: 750, .. }
    ));

    broker.shutdown().await;
}

#[tokio::test(start_paused = true)]
async fn hung_close_does_not_block_shutdown() {
    let stuck = FakeProvider::new("stuck", &["x"]);
    stuck.hang_close.store(true, Ordering::SeqCst);
    let connector = Arc::new(
        FakeConnector::default()
            .provider(stuck)
            .provider(FakeProvider::new("meters", &["list_meters"])),
    );
    let broker = started(
        vec![
            ServerConfig::stdio("stuck", "stuck").with_timeout_ms(300),
            ServerConfig::stdio("meters", "meters-mcp"),
        ],
        connector.clone(),
    )
    .await;
    assert_eq!(broker.connected_servers().await.len(), 2);

    broker.shutdown().await;

    assert!(connector.get("stuck").closed.load(Ordering::SeqCst));
    assert!(connector.get("meters").closed.load(Ordering::SeqCst));
    assert!(broker.connected_servers().await.is_empty());
}

#[tokio::test]
async fn custom_fallback_catalog_replaces_builtin_entries() {
    let mut fallback = FallbackCatalog::default();
    fallback.insert("employee", vec![FallbackTool::new("whoami", "Current employee")]);

    let broker = McpBroker::new(vec![ServerConfig::websocket("employee", "ws://127.0.0.1:1/mcp")])
        .with_connector(Arc::new(FakeConnector::default().failing("employee")))
        .with_fallback_catalog(fallback);
    broker.init().await;

    let tools = broker.list_tools(false).await;
    assert_eq!(names(&tools), vec!["employee_whoami"]);
    assert!(tools[0].fallback);
}
