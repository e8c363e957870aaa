//! Entity-state bus access for Eos
//!
//! This module provides the boundary to the host platform's entity-state
//! bus: reading named entity values and issuing switch/service commands.
//! The `EntityBus` trait keeps the engine testable without a live platform;
//! `HttpEntityBus` talks to a Home Assistant style REST API.

use crate::error::{EosError, Result};
use crate::logging::{StructuredLogger, get_logger};
use async_trait::async_trait;
use serde::Deserialize;
use std::time::Duration;

/// A raw entity state as reported by the bus
#[derive(Debug, Clone)]
pub struct StateValue {
    /// State string, e.g. "1234.5", "on", "unknown"
    pub state: String,

    /// Unit of measurement attribute, if any
    pub unit: Option<String>,
}

impl StateValue {
    /// Construct a value from a plain state string
    pub fn new<S: Into<String>>(state: S) -> Self {
        Self {
            state: state.into(),
            unit: None,
        }
    }

    /// Construct an unknown/unavailable value
    pub fn unknown() -> Self {
        Self::new("unknown")
    }

    /// Whether the platform reported no usable value
    pub fn is_unknown(&self) -> bool {
        matches!(self.state.as_str(), "" | "unknown" | "unavailable" | "none")
    }

    /// Parse the state as a plain number
    pub fn as_f64(&self) -> Option<f64> {
        if self.is_unknown() {
            return None;
        }
        self.state.trim().parse::<f64>().ok().filter(|v| v.is_finite())
    }

    /// Parse the state as power in watts, honoring the unit attribute
    pub fn as_watts(&self) -> Option<f64> {
        let value = self.as_f64()?;
        match self.unit.as_deref() {
            Some("kW") => Some(value * 1000.0),
            _ => Some(value),
        }
    }

    /// Whether the state is a boolean "on"
    pub fn is_on(&self) -> bool {
        self.state == "on"
    }
}

/// Abstract entity-state bus
#[async_trait]
pub trait EntityBus: Send + Sync {
    /// Read the current state of an entity
    async fn get_state(&self, entity_id: &str) -> Result<StateValue>;

    /// Turn a switch-like entity on
    async fn turn_on(&self, entity_id: &str) -> Result<()>;

    /// Turn a switch-like entity off
    async fn turn_off(&self, entity_id: &str) -> Result<()>;

    /// Select an option on a select entity
    async fn select_option(&self, entity_id: &str, option: &str) -> Result<()>;

    /// Invoke an arbitrary service with a JSON payload
    async fn call_service(
        &self,
        domain: &str,
        service: &str,
        entity_id: &str,
        data: serde_json::Value,
    ) -> Result<()>;
}

/// Read an entity as watts, coercing unknown/unreadable values to zero.
/// Loss of one signal degrades allocation, it never halts it.
pub fn watts_or_zero(
    entity_id: &str,
    result: Result<StateValue>,
    logger: &StructuredLogger,
) -> f64 {
    match result {
        Ok(value) => match value.as_watts() {
            Some(watts) => watts,
            None => {
                logger.warn(&format!(
                    "Non-numeric state '{}' for {}, using 0",
                    value.state, entity_id
                ));
                0.0
            }
        },
        Err(e) => {
            logger.warn(&format!("Failed to read {}: {}, using 0", entity_id, e));
            0.0
        }
    }
}

/// Read an entity as a plain number, coercing unknown/unreadable values to zero
pub fn number_or_zero(
    entity_id: &str,
    result: Result<StateValue>,
    logger: &StructuredLogger,
) -> f64 {
    match result {
        Ok(value) => match value.as_f64() {
            Some(number) => number,
            None => {
                logger.warn(&format!(
                    "Non-numeric state '{}' for {}, using 0",
                    value.state, entity_id
                ));
                0.0
            }
        },
        Err(e) => {
            logger.warn(&format!("Failed to read {}: {}, using 0", entity_id, e));
            0.0
        }
    }
}

#[derive(Debug, Deserialize)]
struct RawAttributes {
    #[serde(default)]
    unit_of_measurement: Option<String>,
}

#[derive(Debug, Deserialize)]
struct RawState {
    state: String,
    #[serde(default)]
    attributes: Option<RawAttributes>,
}

/// Entity bus backed by the platform's REST API
pub struct HttpEntityBus {
    client: reqwest::Client,
    base_url: String,
    token: String,
    logger: StructuredLogger,
}

impl HttpEntityBus {
    /// Create a new REST bus client
    pub fn new(base_url: &str, token: &str, timeout: Duration) -> Result<Self> {
        let client = reqwest::Client::builder().timeout(timeout).build()?;
        let logger = get_logger("bus");
        Ok(Self {
            client,
            base_url: base_url.trim_end_matches('/').to_string(),
            token: token.to_string(),
            logger,
        })
    }

    fn api_url(&self, path: &str) -> String {
        format!("{}/api/{}", self.base_url, path)
    }

    async fn post_service(&self, domain: &str, service: &str, body: serde_json::Value) -> Result<()> {
        let url = self.api_url(&format!("services/{}/{}", domain, service));
        self.logger
            .debug(&format!("Calling service {}/{}", domain, service));
        let response = self
            .client
            .post(url)
            .bearer_auth(&self.token)
            .json(&body)
            .send()
            .await?;
        if !response.status().is_success() {
            return Err(EosError::actuator(format!(
                "Service {}/{} failed with status {}",
                domain,
                service,
                response.status()
            )));
        }
        Ok(())
    }
}

#[async_trait]
impl EntityBus for HttpEntityBus {
    async fn get_state(&self, entity_id: &str) -> Result<StateValue> {
        let url = self.api_url(&format!("states/{}", entity_id));
        let response = self.client.get(url).bearer_auth(&self.token).send().await?;

        // A missing entity is reported as unknown, not as a fault
        if response.status() == reqwest::StatusCode::NOT_FOUND {
            self.logger
                .debug(&format!("Entity {} not found on bus", entity_id));
            return Ok(StateValue::unknown());
        }
        if !response.status().is_success() {
            return Err(EosError::bus(format!(
                "State read for {} failed with status {}",
                entity_id,
                response.status()
            )));
        }

        let raw: RawState = response.json().await?;
        Ok(StateValue {
            state: raw.state,
            unit: raw.attributes.and_then(|a| a.unit_of_measurement),
        })
    }

    async fn turn_on(&self, entity_id: &str) -> Result<()> {
        self.post_service(
            "homeassistant",
            "turn_on",
            serde_json::json!({ "entity_id": entity_id }),
        )
        .await
    }

    async fn turn_off(&self, entity_id: &str) -> Result<()> {
        self.post_service(
            "homeassistant",
            "turn_off",
            serde_json::json!({ "entity_id": entity_id }),
        )
        .await
    }

    async fn select_option(&self, entity_id: &str, option: &str) -> Result<()> {
        self.post_service(
            "select",
            "select_option",
            serde_json::json!({ "entity_id": entity_id, "option": option }),
        )
        .await
    }

    async fn call_service(
        &self,
        domain: &str,
        service: &str,
        entity_id: &str,
        data: serde_json::Value,
    ) -> Result<()> {
        let mut body = match data {
            serde_json::Value::Object(map) => map,
            serde_json::Value::Null => serde_json::Map::new(),
            other => {
                return Err(EosError::actuator(format!(
                    "Service payload must be an object, got {}",
                    other
                )));
            }
        };
        body.insert(
            "entity_id".to_string(),
            serde_json::Value::String(entity_id.to_string()),
        );
        self.post_service(domain, service, serde_json::Value::Object(body))
            .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_unknown_states() {
        assert!(StateValue::new("unknown").is_unknown());
        assert!(StateValue::new("unavailable").is_unknown());
        assert!(StateValue::new("").is_unknown());
        assert!(!StateValue::new("0.0").is_unknown());
    }

    #[test]
    fn test_as_f64() {
        assert_eq!(StateValue::new("1234.5").as_f64(), Some(1234.5));
        assert_eq!(StateValue::new(" 12 ").as_f64(), Some(12.0));
        assert_eq!(StateValue::new("unknown").as_f64(), None);
        assert_eq!(StateValue::new("not a number").as_f64(), None);
        assert_eq!(StateValue::new("NaN").as_f64(), None);
    }

    #[test]
    fn test_as_watts_unit_conversion() {
        let kw = StateValue {
            state: "1.5".to_string(),
            unit: Some("kW".to_string()),
        };
        assert_eq!(kw.as_watts(), Some(1500.0));

        let w = StateValue {
            state: "750".to_string(),
            unit: Some("W".to_string()),
        };
        assert_eq!(w.as_watts(), Some(750.0));

        let bare = StateValue::new("750");
        assert_eq!(bare.as_watts(), Some(750.0));
    }

    #[test]
    fn test_watts_or_zero_coercion() {
        let logger = get_logger("test");
        assert_eq!(
            watts_or_zero("sensor.x", Ok(StateValue::new("100")), &logger),
            100.0
        );
        assert_eq!(
            watts_or_zero("sensor.x", Ok(StateValue::unknown()), &logger),
            0.0
        );
        assert_eq!(
            watts_or_zero("sensor.x", Err(EosError::bus("down")), &logger),
            0.0
        );
    }
}
