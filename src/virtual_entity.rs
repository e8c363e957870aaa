//! Virtual entities with feedback control for Eos
//!
//! A virtual entity is a software-only switch whose actuation is a
//! continuously adjustable external setpoint rather than a relay. Each
//! entity declares the event handlers it supports (import update, export
//! update, switched); only declared handlers fire, and import/export
//! events reach only entities that are currently switched on.
//!
//! Handlers are pure: they map (context, value) to an absolute actuator
//! command. The engine dispatches commands asynchronously so allocation
//! never blocks on an actuator call. Every handler branch produces a
//! command - a skipped update would leave a stale setpoint in place
//! indefinitely.

use crate::bus::{EntityBus, watts_or_zero};
use crate::config::{SetpointServiceConfig, VirtualEntityConfig};
use crate::logging::get_logger;
use std::collections::HashMap;
use std::sync::Arc;

/// Absolute setpoint command for an external actuator API
#[derive(Debug, Clone, PartialEq)]
pub struct ActuatorCommand {
    /// Service domain, e.g. "number"
    pub domain: String,

    /// Service name, e.g. "set_value"
    pub service: String,

    /// Target entity id
    pub entity_id: String,

    /// Name of the numeric argument
    pub field: String,

    /// Setpoint value (W); positive = allowed grid draw from the
    /// actuator's perspective
    pub value_w: f64,
}

impl ActuatorCommand {
    /// Service payload carrying the setpoint under the configured field name
    pub fn payload(&self) -> serde_json::Value {
        let mut map = serde_json::Map::new();
        map.insert(self.field.clone(), serde_json::json!(self.value_w));
        serde_json::Value::Object(map)
    }
}

/// Inputs available to capability handlers
#[derive(Debug, Clone, Copy)]
pub struct FeedbackContext {
    /// Maximum power the entity may be granted (W)
    pub usage_ceiling_w: f64,

    /// The entity's own currently-measured draw (W), zero when unknown
    pub own_draw_w: f64,
}

/// Handler fired when grid import power is reported
pub trait ImportUpdate: Send + Sync {
    fn on_import(&self, ctx: &FeedbackContext, import_w: f64) -> Option<ActuatorCommand>;
}

/// Handler fired when grid export power is reported
pub trait ExportUpdate: Send + Sync {
    fn on_export(&self, ctx: &FeedbackContext, export_w: f64) -> Option<ActuatorCommand>;
}

/// Handler fired when the entity's logical switch state toggles
pub trait Switched: Send + Sync {
    fn on_switched(&self, ctx: &FeedbackContext, on: bool) -> Option<ActuatorCommand>;
}

/// Charger-style setpoint feedback.
///
/// Import: the deficit is pushed through unchanged so the actuator reduces
/// its own draw. Export: the surplus is clamped to the ceiling, the
/// entity's own draw is subtracted (it is already part of the measurement,
/// counting it again would feed back on itself), and the residual is
/// negated per the actuator's sign convention. Switched: the setpoint
/// jumps to the release sentinel when disabled and the block sentinel when
/// enabled, pending the next surplus update.
pub struct SetpointFeedback {
    service: SetpointServiceConfig,
    release_setpoint_w: f64,
    block_setpoint_w: f64,
}

impl SetpointFeedback {
    pub fn new(service: SetpointServiceConfig, release_setpoint_w: f64, block_setpoint_w: f64) -> Self {
        Self {
            service,
            release_setpoint_w,
            block_setpoint_w,
        }
    }

    fn command(&self, value_w: f64) -> ActuatorCommand {
        ActuatorCommand {
            domain: self.service.domain.clone(),
            service: self.service.service.clone(),
            entity_id: self.service.entity_id.clone(),
            field: self.service.field.clone(),
            value_w,
        }
    }
}

impl ImportUpdate for SetpointFeedback {
    fn on_import(&self, _ctx: &FeedbackContext, import_w: f64) -> Option<ActuatorCommand> {
        Some(self.command(import_w))
    }
}

impl ExportUpdate for SetpointFeedback {
    fn on_export(&self, ctx: &FeedbackContext, export_w: f64) -> Option<ActuatorCommand> {
        let granted = export_w.min(ctx.usage_ceiling_w);
        let residual = granted - ctx.own_draw_w;
        Some(self.command(-residual))
    }
}

impl Switched for SetpointFeedback {
    fn on_switched(&self, _ctx: &FeedbackContext, on: bool) -> Option<ActuatorCommand> {
        let value = if on {
            self.block_setpoint_w
        } else {
            self.release_setpoint_w
        };
        Some(self.command(value))
    }
}

/// A registered virtual entity with its capability set
pub struct VirtualEntity {
    pub id: String,
    on: bool,
    usage_ceiling_w: f64,
    tracker: Option<String>,
    import: Option<Arc<dyn ImportUpdate>>,
    export: Option<Arc<dyn ExportUpdate>>,
    switched: Option<Arc<dyn Switched>>,
}

/// Registry of virtual entities keyed by id
pub struct VirtualEntityController {
    entities: HashMap<String, VirtualEntity>,
    bus: Arc<dyn EntityBus>,
    logger: crate::logging::StructuredLogger,
}

impl VirtualEntityController {
    /// Build the registry from configuration. Capability handlers are
    /// resolved here once; there is no dynamic dispatch by name afterwards.
    pub fn from_config(configs: &[VirtualEntityConfig], bus: Arc<dyn EntityBus>) -> Self {
        let logger = get_logger("virtual");
        let mut entities = HashMap::new();
        for cfg in configs {
            let feedback = Arc::new(SetpointFeedback::new(
                cfg.setpoint.clone(),
                cfg.release_setpoint_w,
                cfg.block_setpoint_w,
            ));
            let declared = |event: &str| cfg.events.iter().any(|e| e.as_str() == event);
            let entity = VirtualEntity {
                id: cfg.id.clone(),
                on: false,
                usage_ceiling_w: cfg.usage_ceiling_w,
                tracker: cfg.tracker.clone(),
                import: declared("import_update")
                    .then(|| feedback.clone() as Arc<dyn ImportUpdate>),
                export: declared("export_update")
                    .then(|| feedback.clone() as Arc<dyn ExportUpdate>),
                switched: declared("switched").then(|| feedback.clone() as Arc<dyn Switched>),
            };
            entities.insert(cfg.id.clone(), entity);
        }
        Self {
            entities,
            bus,
            logger,
        }
    }

    /// Whether an entity with this id is registered
    pub fn contains(&self, id: &str) -> bool {
        self.entities.contains_key(id)
    }

    /// Logical switch state of an entity
    pub fn is_on(&self, id: &str) -> Option<bool> {
        self.entities.get(id).map(|e| e.on)
    }

    /// Ids of all registered entities
    pub fn ids(&self) -> Vec<String> {
        self.entities.keys().cloned().collect()
    }

    async fn context_for(&self, entity: &VirtualEntity) -> FeedbackContext {
        let own_draw_w = match &entity.tracker {
            Some(tracker) => {
                watts_or_zero(tracker, self.bus.get_state(tracker).await, &self.logger)
            }
            None => 0.0,
        };
        FeedbackContext {
            usage_ceiling_w: entity.usage_ceiling_w,
            own_draw_w,
        }
    }

    /// Fire import-update handlers on all active entities
    pub async fn on_import_update(&self, import_w: f64) -> Vec<ActuatorCommand> {
        let mut commands = Vec::new();
        for entity in self.entities.values() {
            if !entity.on {
                continue;
            }
            if let Some(handler) = &entity.import {
                let ctx = self.context_for(entity).await;
                if let Some(cmd) = handler.on_import(&ctx, import_w) {
                    self.logger.debug(&format!(
                        "{}: import {:.0}W -> setpoint {:.0}W",
                        entity.id, import_w, cmd.value_w
                    ));
                    commands.push(cmd);
                }
            }
        }
        commands
    }

    /// Fire export-update handlers on all active entities
    pub async fn on_export_update(&self, export_w: f64) -> Vec<ActuatorCommand> {
        let mut commands = Vec::new();
        for entity in self.entities.values() {
            if !entity.on {
                continue;
            }
            if let Some(handler) = &entity.export {
                let ctx = self.context_for(entity).await;
                if let Some(cmd) = handler.on_export(&ctx, export_w) {
                    self.logger.debug(&format!(
                        "{}: export {:.0}W (draw {:.0}W) -> setpoint {:.0}W",
                        entity.id, export_w, ctx.own_draw_w, cmd.value_w
                    ));
                    commands.push(cmd);
                }
            }
        }
        commands
    }

    /// Toggle an entity's logical state, firing its switched handler
    pub async fn set_switched(&mut self, id: &str, on: bool) -> Vec<ActuatorCommand> {
        let Some(entity) = self.entities.get_mut(id) else {
            self.logger
                .warn(&format!("Virtual entity {} not registered", id));
            return Vec::new();
        };
        entity.on = on;
        self.logger
            .info(&format!("Virtual entity {} switched {}", id, if on { "on" } else { "off" }));

        let Some(handler) = self.entities.get(id).and_then(|e| e.switched.clone()) else {
            return Vec::new();
        };
        let entity = &self.entities[id];
        let ctx = self.context_for(entity).await;
        handler.on_switched(&ctx, on).into_iter().collect()
    }
}
