//! Weather tool: mock lookup with a fixed data contract.
//!
//! Returns the same record shape a real provider would, after a simulated
//! network delay, so sessions can be exercised end-to-end offline.

use async_trait::async_trait;
use serde::Serialize;
use std::time::Duration;
use toolmux_core::error::ToolError;
use toolmux_core::tool::{Tool, ToolResult};

pub const DEFAULT_DELAY: Duration = Duration::from_secs(1);

pub struct WeatherTool {
    delay: Duration,
}

impl WeatherTool {
    pub fn new(delay: Duration) -> Self {
        Self { delay }
    }
}

impl Default for WeatherTool {
    fn default() -> Self {
        Self::new(DEFAULT_DELAY)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Units {
    Metric,
    Imperial,
}

impl Units {
    fn parse(raw: Option<&str>) -> Result<Self, ToolError> {
        match raw.unwrap_or("metric") {
            "metric" => Ok(Units::Metric),
            "imperial" => Ok(Units::Imperial),
            other => Err(ToolError::InvalidArguments(format!(
                "Unknown units '{other}', expected 'metric' or 'imperial'"
            ))),
        }
    }
}

#[derive(Debug, Serialize)]
struct WeatherData {
    temperature: f64,
    description: String,
    humidity: f64,
    wind_speed: f64,
    location: String,
}

#[async_trait]
impl Tool for WeatherTool {
    fn name(&self) -> &str {
        "get_weather"
    }

    fn description(&self) -> &str {
        "Get the current weather for a location. Returns temperature, description, humidity, and wind speed."
    }

    fn parameters_schema(&self) -> serde_json::Value {
        serde_json::json!({
            "type": "object",
            "properties": {
                "location": {
                    "type": "string",
                    "description": "The city name or location to look up weather for"
                },
                "units": {
                    "type": "string",
                    "enum": ["metric", "imperial"],
                    "description": "Temperature units (default: metric)",
                    "default": "metric"
                }
            },
            "required": ["location"]
        })
    }

    fn output_schema(&self) -> Option<serde_json::Value> {
        Some(serde_json::json!({
            "type": "object",
            "properties": {
                "temperature": { "type": "number" },
                "description": { "type": "string" },
                "humidity": { "type": "number" },
                "wind_speed": { "type": "number" },
                "location": { "type": "string" }
            },
            "required": ["temperature", "description", "humidity", "wind_speed", "location"]
        }))
    }

    async fn execute(&self, arguments: serde_json::Value) -> Result<ToolResult, ToolError> {
        let location = arguments["location"]
            .as_str()
            .map(str::trim)
            .filter(|l| !l.is_empty())
            .ok_or_else(|| ToolError::InvalidArguments("Missing 'location' argument".into()))?;
        let units = Units::parse(arguments["units"].as_str())?;

        tokio::time::sleep(self.delay).await;

        let weather = WeatherData {
            temperature: match units {
                Units::Metric => 22.5,
                Units::Imperial => 72.5,
            },
            description: "Partly cloudy with a chance of rain".into(),
            humidity: 65.0,
            wind_speed: 10.0,
            location: location.to_string(),
        };

        let symbol = match units {
            Units::Metric => "°C",
            Units::Imperial => "°F",
        };
        let output = format!(
            "{}: {}{}, {}, humidity {}%, wind {}",
            weather.location, weather.temperature, symbol, weather.description, weather.humidity, weather.wind_speed
        );
        let data = serde_json::to_value(&weather)
            .map_err(|e| ToolError::ExecutionFailed {
                tool_name: self.name().into(),
                reason: e.to_string(),
            })?;

        Ok(ToolResult::ok(output, data))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test(start_paused = true)]
    async fn metric_record_has_fixed_shape() {
        let tool = WeatherTool::default();
        let result = tool
            .execute(serde_json::json!({"location": "Lisbon", "units": "metric"}))
            .await
            .unwrap();

        assert!(result.success);
        let data = result.data.unwrap();
        assert_eq!(data["temperature"], 22.5);
        assert!(!data["description"].as_str().unwrap().is_empty());
        assert_eq!(data["humidity"], 65.0);
        assert_eq!(data["wind_speed"], 10.0);
        assert_eq!(data["location"], "Lisbon");
    }

    #[tokio::test(start_paused = true)]
    async fn imperial_uses_fahrenheit() {
        let result = WeatherTool::default()
            .execute(serde_json::json!({"location": "Boston", "units": "imperial"}))
            .await
            .unwrap();
        assert_eq!(result.data.unwrap()["temperature"], 72.5);
        assert!(result.output.contains("°F"));
    }

    #[tokio::test(start_paused = true)]
    async fn units_default_to_metric() {
        let result = WeatherTool::default()
            .execute(serde_json::json!({"location": "Oslo"}))
            .await
            .unwrap();
        assert_eq!(result.data.unwrap()["temperature"], 22.5);
    }

    #[tokio::test(start_paused = true)]
    async fn lookup_waits_for_the_simulated_delay() {
        let start = tokio::time::Instant::now();
        WeatherTool::new(Duration::from_millis(750))
            .execute(serde_json::json!({"location": "Lima"}))
            .await
            .unwrap();
        assert!(start.elapsed() >= Duration::from_millis(750));
    }

    #[tokio::test]
    async fn blank_location_rejected_without_waiting() {
        let tool = WeatherTool::new(Duration::from_secs(3600));
        let err = tool
            .execute(serde_json::json!({"location": "  "}))
            .await
            .unwrap_err();
        assert!(matches!(err, ToolError::InvalidArguments(_)));
    }

    #[tokio::test]
    async fn unknown_units_rejected() {
        let err = WeatherTool::new(Duration::ZERO)
            .execute(serde_json::json!({"location": "Rome", "units": "kelvin"}))
            .await
            .unwrap_err();
        assert!(err.to_string().contains("kelvin"));
    }
}
