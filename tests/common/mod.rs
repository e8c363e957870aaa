#![allow(dead_code)]

use async_trait::async_trait;
use eos::bus::{EntityBus, StateValue};
use eos::error::Result;
use std::collections::HashMap;
use std::sync::Mutex;

/// In-memory entity bus double. Reads come from a state map, commands are
/// recorded but deliberately not applied so tests control the "actual"
/// state the enforcement manager sees.
pub struct FakeBus {
    states: Mutex<HashMap<String, StateValue>>,
    calls: Mutex<Vec<String>>,
}

impl FakeBus {
    pub fn new() -> Self {
        Self {
            states: Mutex::new(HashMap::new()),
            calls: Mutex::new(Vec::new()),
        }
    }

    pub fn set_state(&self, entity_id: &str, state: &str) {
        self.states
            .lock()
            .unwrap()
            .insert(entity_id.to_string(), StateValue::new(state));
    }

    pub fn set_state_with_unit(&self, entity_id: &str, state: &str, unit: &str) {
        self.states.lock().unwrap().insert(
            entity_id.to_string(),
            StateValue {
                state: state.to_string(),
                unit: Some(unit.to_string()),
            },
        );
    }

    pub fn calls(&self) -> Vec<String> {
        self.calls.lock().unwrap().clone()
    }

    pub fn call_count(&self, prefix: &str) -> usize {
        self.calls
            .lock()
            .unwrap()
            .iter()
            .filter(|c| c.starts_with(prefix))
            .count()
    }

    fn record(&self, call: String) {
        self.calls.lock().unwrap().push(call);
    }
}

#[async_trait]
impl EntityBus for FakeBus {
    async fn get_state(&self, entity_id: &str) -> Result<StateValue> {
        Ok(self
            .states
            .lock()
            .unwrap()
            .get(entity_id)
            .cloned()
            .unwrap_or_else(StateValue::unknown))
    }

    async fn turn_on(&self, entity_id: &str) -> Result<()> {
        self.record(format!("turn_on {}", entity_id));
        Ok(())
    }

    async fn turn_off(&self, entity_id: &str) -> Result<()> {
        self.record(format!("turn_off {}", entity_id));
        Ok(())
    }

    async fn select_option(&self, entity_id: &str, option: &str) -> Result<()> {
        self.record(format!("select {} {}", entity_id, option));
        Ok(())
    }

    async fn call_service(
        &self,
        domain: &str,
        service: &str,
        entity_id: &str,
        data: serde_json::Value,
    ) -> Result<()> {
        self.record(format!("{}/{} {} {}", domain, service, entity_id, data));
        Ok(())
    }
}
