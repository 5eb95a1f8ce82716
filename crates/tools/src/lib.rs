//! Leaf tool implementations for the builtin toolmux peers.
//!
//! Each builtin peer hosts one [`ToolSet`]:
//! - `math`: `calculate`
//! - `weather`: `get_weather` (mock data)
//! - `search`: `search_web`, `search_news` (Tavily-style HTTP API)

pub mod calculator;
pub mod search;
pub mod weather;

use std::sync::Arc;
use std::time::Duration;
use toolmux_core::tool::ToolSet;

pub use calculator::CalculatorTool;
pub use search::{SearchClient, SearchTool};
pub use weather::WeatherTool;

/// Tools hosted by the math peer.
pub fn math_tools() -> ToolSet {
    ToolSet::new().with(Arc::new(CalculatorTool))
}

/// Tools hosted by the weather peer.
pub fn weather_tools(delay: Duration) -> ToolSet {
    ToolSet::new().with(Arc::new(WeatherTool::new(delay)))
}

/// Tools hosted by the search peer.
pub fn search_tools(client: SearchClient) -> ToolSet {
    let client = Arc::new(client);
    ToolSet::new()
        .with(Arc::new(SearchTool::web(Arc::clone(&client))))
        .with(Arc::new(SearchTool::news(client)))
}
