//! Static fallback catalog
//!
//! Minimal tool descriptors exposed for a provider that is unreachable or
//! lists nothing usable, so the tool menu keeps the provider's surface.

use broker_core::{FallbackTool, ServerConfig};
use std::collections::HashMap;

const BUILTIN: &[(&str, &[(&str, &str)])] = &[
    (
        "meters",
        &[
            ("list_meters", "List energy meters registered for the current site"),
            ("meters_health", "Check whether the meters service is reachable"),
        ],
    ),
    (
        "employee",
        &[
            ("employee_health", "Check whether the employee service is reachable"),
            ("list_employees", "List employees with their roles and status"),
            ("get_employee", "Fetch a single employee record by id"),
        ],
    ),
    (
        "posbistro",
        &[
            ("posbistro_health", "Check whether the POS Bistro integration is reachable"),
            ("posbistro_daily_sales", "Summarise POS Bistro sales for a given day"),
        ],
    ),
    (
        "inventory",
        &[
            ("inventory_health", "Check whether the inventory service is reachable"),
            ("list_stock_levels", "List current stock levels per product"),
        ],
    ),
];

#[derive(Debug, Clone, Default)]
pub struct FallbackCatalog {
    entries: HashMap<String, Vec<FallbackTool>>,
}

impl FallbackCatalog {
    pub fn builtin() -> Self {
        let entries = BUILTIN
            .iter()
            .map(|(server, tools)| {
                let tools = tools
                    .iter()
                    .map(|(name, description)| FallbackTool::new(*name, *description))
                    .collect();
                (server.to_string(), tools)
            })
            .collect();
        Self { entries }
    }

    /// Built-in table, with `fallbackTools` from configuration replacing the
    /// entries of the same server id.
    pub fn for_servers(servers: &[ServerConfig]) -> Self {
        let mut catalog = Self::builtin();
        for server in servers {
            if let Some(tools) = &server.fallback_tools {
                catalog.insert(server.id.clone(), tools.clone());
            }
        }
        catalog
    }

    pub fn insert(&mut self, server_id: impl Into<String>, tools: Vec<FallbackTool>) {
        self.entries.insert(server_id.into(), tools);
    }

    pub fn tools_for(&self, server_id: &str) -> &[FallbackTool] {
        self.entries
            .get(server_id)
            .map(Vec::as_slice)
            .unwrap_or_default()
    }
}
