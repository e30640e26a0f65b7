//! Loading the initial routing table from a JSON file.

use ears_core::RoutingTableEntry;
use std::path::Path;
use tracing::info;

/// Reads a JSON array of routing entries.
///
/// Computed fields (`src_hash`, `dst_hash`, `hash`, `ts`) may be omitted;
/// the routing table fills them in when the entries are applied.
pub async fn load_routes(path: &Path) -> Result<Vec<RoutingTableEntry>, Box<dyn std::error::Error>> {
    let content = tokio::fs::read_to_string(path).await?;
    let entries: Vec<RoutingTableEntry> = serde_json::from_str(&content)
        .map_err(|e| format!("Invalid routes file {}: {e}", path.display()))?;
    info!("📜 Read {} routes from {}", entries.len(), path.display());
    Ok(entries)
}
