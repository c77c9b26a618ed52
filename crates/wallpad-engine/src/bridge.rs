/*!
 * Home Assistant side of the gateway.
 *
 * Devices appear to Home Assistant as `<prefix>/<Device><n>/<field>/...`
 * topics. Commands arrive on `.../command` and become field values for the
 * scheduler; decoded state packets go out on `.../state`; discovery configs
 * announce every device instance found on the bus.
 */
use serde_json::{json, Value};
use tracing::debug;

use wallpad_core::config::{ClimateConfig, GatewayConfig};
use wallpad_protocol::structure::DEVICE_ID_FIELD;
use wallpad_protocol::{
    DeviceKind, DeviceStructure, DecodedPacket, FieldValue, FieldValues, FoundDevices, PacketType, Registry,
};

use crate::error::{Error, Result};
use crate::transport::Message;

const POWER: &str = "power";
const COMMAND_TYPE: &str = "commandType";
const VALUE: &str = "value";
const FAN_SPEEDS: [&str; 3] = ["low", "medium", "high"];

/// A command published by Home Assistant
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HaCommand {
    /// Device name, e.g. `Light`
    pub device: String,
    /// Device number from the topic
    pub index: u8,
    /// Field segment of the topic, e.g. `power` or `setTemp`
    pub field: String,
    /// Payload text
    pub payload: String,
}

/// Topic layout and payload mapping for Home Assistant
#[derive(Debug, Clone)]
pub struct HaBridge {
    prefix: String,
    discovery_prefix: String,
    climate: ClimateConfig,
}

impl HaBridge {
    /// Create a bridge for a topic prefix
    pub fn new<P: Into<String>, D: Into<String>>(prefix: P, discovery_prefix: D, climate: ClimateConfig) -> Self {
        Self {
            prefix: prefix.into(),
            discovery_prefix: discovery_prefix.into(),
            climate,
        }
    }

    /// Create a bridge from the gateway configuration
    pub fn from_config(config: &GatewayConfig) -> Self {
        Self::new(
            config.mqtt.topic_prefix.clone(),
            config.mqtt.discovery_prefix.clone(),
            config.climate.clone(),
        )
    }

    /// Filter matching every command topic
    pub fn command_filter(&self) -> String {
        format!("{}/+/+/command", self.prefix)
    }

    /// State topic of one field of a device instance
    pub fn state_topic(&self, object: &str, field: &str) -> String {
        format!("{}/{}/{}/state", self.prefix, object, field)
    }

    /// Command topic of one field of a device instance
    pub fn command_topic(&self, object: &str, field: &str) -> String {
        format!("{}/{}/{}/command", self.prefix, object, field)
    }

    /// Recognise a command topic; anything else gives `None`
    pub fn parse_command(&self, topic: &str, payload: &str) -> Option<HaCommand> {
        let rest = topic.strip_prefix(&self.prefix)?.strip_prefix('/')?;
        let mut parts = rest.split('/');
        let object = parts.next()?;
        let field = parts.next()?;
        if parts.next()? != "command" || parts.next().is_some() {
            return None;
        }

        let split = object.find(|c: char| c.is_ascii_digit())?;
        let (device, index) = object.split_at(split);
        if device.is_empty() {
            return None;
        }
        Some(HaCommand {
            device: device.to_string(),
            index: index.parse().ok()?,
            field: field.to_string(),
            payload: payload.trim().to_string(),
        })
    }

    /// Field values of the command packet for a Home Assistant command
    pub fn command_values(&self, registry: &Registry, command: &HaCommand) -> Result<FieldValues> {
        let device = registry.device(&command.device)?;
        let spec = device.packet(PacketType::Command).ok_or_else(|| {
            Error::bridge(format!("{} has no command packet", command.device))
        })?;

        let mut values = FieldValues::new();
        if spec.device_id_position().is_some() {
            values.insert(DEVICE_ID_FIELD.to_string(), FieldValue::Number(i64::from(command.index)));
        }
        let typed = spec.field(COMMAND_TYPE).is_some();
        let payload = command.payload.as_str();

        match (device.kind, command.field.as_str()) {
            (DeviceKind::Climate, POWER) => {
                let value = if payload == "heat" { "on" } else { "off" };
                values.insert(COMMAND_TYPE.to_string(), FieldValue::symbol(POWER));
                values.insert(VALUE.to_string(), FieldValue::symbol(value));
            }
            (DeviceKind::Climate, "setTemp") => {
                let temp = payload
                    .parse::<f64>()
                    .map_err(|_| Error::bridge(format!("Invalid temperature: {}", payload)))?;
                values.insert(COMMAND_TYPE.to_string(), FieldValue::symbol("change"));
                values.insert(VALUE.to_string(), FieldValue::Number(temp.trunc() as i64));
            }
            (DeviceKind::Fan, "speed") => {
                if !FAN_SPEEDS.contains(&payload) {
                    return Err(Error::bridge(format!("Invalid fan speed: {}", payload)));
                }
                values.insert(COMMAND_TYPE.to_string(), FieldValue::symbol("setSpeed"));
                values.insert(VALUE.to_string(), FieldValue::symbol(payload));
            }
            (DeviceKind::Button, _) => {
                // A press sends the first meaning of the first command field
                let (name, symbol) = spec
                    .fields
                    .values()
                    .filter(|field| !field.is_structural() && field.name != DEVICE_ID_FIELD)
                    .find_map(|field| field.values.first().map(|(symbol, _)| (field.name.clone(), symbol.clone())))
                    .ok_or_else(|| Error::bridge(format!("{} has nothing to press", command.device)))?;
                values.insert(name, FieldValue::Symbol(symbol));
            }
            (_, POWER) if typed => {
                values.insert(COMMAND_TYPE.to_string(), FieldValue::symbol(POWER));
                values.insert(VALUE.to_string(), FieldValue::symbol(on_off_symbol(payload)));
            }
            (_, field) if spec.field(field).is_some() => {
                let value = match payload.parse::<i64>() {
                    Ok(number) => FieldValue::Number(number),
                    Err(_) => FieldValue::symbol(on_off_symbol(payload)),
                };
                values.insert(field.to_string(), value);
            }
            (_, field) => {
                return Err(Error::bridge(format!(
                    "{} has no command field for {}",
                    command.device, field
                )))
            }
        }

        debug!(device = %command.device, index = command.index, field = %command.field, "Mapped command");
        Ok(values)
    }

    /// State topic messages for a decoded state packet
    pub fn state_messages(&self, decoded: &DecodedPacket) -> Vec<Message> {
        if decoded.packet_type != PacketType::State {
            return Vec::new();
        }
        let id = match decoded.device_id {
            Some(id) => id,
            None => return Vec::new(),
        };
        let object = format!("{}{}", decoded.device, id);
        let symbol = |name: &str| decoded.field(name).map(ToString::to_string).unwrap_or_default();
        let number = |name: &str| decoded.field(name).and_then(FieldValue::as_number);
        let power = symbol(POWER);

        let mut fields: Vec<(&str, String)> = Vec::new();
        match decoded.kind {
            DeviceKind::Climate => {
                if let Some(current) = number("currentTemp") {
                    fields.push(("curTemp", format!("{:02}", current)));
                }
                if let Some(target) = number("targetTemp") {
                    fields.push(("setTemp", format!("{:02}", target)));
                }
                let mode = if power == "off" { "off" } else { "heat" };
                let action = if power == "heating" { "heating" } else { "idle" };
                fields.push((POWER, mode.to_string()));
                fields.push(("action", action.to_string()));
            }
            DeviceKind::Fan => {
                if power == "off" {
                    fields.push((POWER, "OFF".to_string()));
                } else {
                    let speed = decoded
                        .field("speed")
                        .and_then(FieldValue::as_symbol)
                        .unwrap_or("low");
                    fields.push(("speed", speed.to_string()));
                    fields.push((POWER, "ON".to_string()));
                }
            }
            _ if decoded.field("watt").is_some() => {
                if power == "on" {
                    fields.push((POWER, "ON".to_string()));
                    let watt = number("watt").unwrap_or(0) as f64 / 10.0;
                    fields.push(("watt", format!("{:.1}", watt)));
                } else {
                    fields.push((POWER, "OFF".to_string()));
                }
            }
            _ if decoded.field("floor").is_some() => {
                if power == "on" {
                    let floor = decoded
                        .field("floor")
                        .and_then(FieldValue::as_symbol)
                        .unwrap_or("B");
                    fields.push((POWER, "ON".to_string()));
                    fields.push(("floor", floor.to_string()));
                }
            }
            _ => {
                if decoded.field(POWER).is_some() {
                    fields.push((POWER, on_off_payload(&power)));
                }
            }
        }

        fields
            .into_iter()
            .map(|(field, payload)| Message::new(self.state_topic(&object, field), payload))
            .collect()
    }

    /// Discovery configs for every found device instance
    pub fn discovery_messages(&self, registry: &Registry, found: &FoundDevices) -> Vec<Message> {
        let mut messages = Vec::new();
        for (name, entry) in found.iter() {
            let structure = registry.device(name).ok();
            for index in 1..=entry.count {
                messages.extend(self.discovery_for(name, entry.kind, structure, index));
            }
        }
        messages
    }

    fn discovery_for(
        &self,
        name: &str,
        kind: DeviceKind,
        structure: Option<&DeviceStructure>,
        index: u8,
    ) -> Vec<Message> {
        let object = format!("{}{}", name, index);
        let device_info = json!({
            "identifiers": ["commax_wallpad"],
            "name": "commax_wallpad",
            "model": "commax_wallpad",
            "manufacturer": "commax_wallpad",
        });
        let mut base = json!({
            "name": format!("{} {}", name, index),
            "unique_id": format!("commax_{}", object),
            "device": device_info,
        });
        let on_off = json!({
            "state_topic": self.state_topic(&object, POWER),
            "command_topic": self.command_topic(&object, POWER),
            "payload_on": "ON",
            "payload_off": "OFF",
        });

        let has_watt = structure
            .and_then(|s| s.packet(PacketType::State))
            .map_or(false, |state| state.field("watt").is_some());

        let mut configs = Vec::new();
        match kind {
            DeviceKind::Light => {
                merge(&mut base, on_off);
                configs.push(("light", object.clone(), base));
            }
            DeviceKind::Switch if has_watt => {
                let mut switch = base.clone();
                merge(&mut switch, on_off);
                merge(&mut switch, json!({ "device_class": "outlet" }));
                configs.push(("switch", object.clone(), switch));

                let mut sensor = base;
                merge(
                    &mut sensor,
                    json!({
                        "name": format!("{} {} Power", name, index),
                        "unique_id": format!("commax_{}_watt", object),
                        "state_topic": self.state_topic(&object, "watt"),
                        "unit_of_measurement": "W",
                        "device_class": "power",
                        "state_class": "measurement",
                    }),
                );
                configs.push(("sensor", format!("{}_watt", object), sensor));
            }
            DeviceKind::Switch => {
                merge(&mut base, on_off);
                configs.push(("switch", object.clone(), base));
            }
            DeviceKind::Fan => {
                merge(&mut base, on_off);
                merge(
                    &mut base,
                    json!({
                        "speed_state_topic": self.state_topic(&object, "speed"),
                        "speed_command_topic": self.command_topic(&object, "speed"),
                        "speeds": FAN_SPEEDS,
                    }),
                );
                configs.push(("fan", object.clone(), base));
            }
            DeviceKind::Climate => {
                merge(
                    &mut base,
                    json!({
                        "current_temperature_topic": self.state_topic(&object, "curTemp"),
                        "temperature_command_topic": self.command_topic(&object, "setTemp"),
                        "temperature_state_topic": self.state_topic(&object, "setTemp"),
                        "mode_command_topic": self.command_topic(&object, POWER),
                        "mode_state_topic": self.state_topic(&object, POWER),
                        "action_state_topic": self.state_topic(&object, "action"),
                        "modes": ["off", "heat"],
                        "temperature_unit": "C",
                        "min_temp": self.climate.min_temp,
                        "max_temp": self.climate.max_temp,
                        "temp_step": 1,
                    }),
                );
                configs.push(("climate", object.clone(), base));
            }
            DeviceKind::Button => {
                merge(
                    &mut base,
                    json!({
                        "state_topic": self.state_topic(&object, POWER),
                        "command_topic": self.command_topic(&object, POWER),
                    }),
                );
                configs.push(("button", object.clone(), base));
            }
            DeviceKind::Sensor => {
                merge(&mut base, json!({ "state_topic": self.state_topic(&object, POWER) }));
                configs.push(("sensor", object.clone(), base));
            }
        }

        configs
            .into_iter()
            .map(|(component, id, payload)| {
                let topic = format!("{}/{}/{}/config", self.discovery_prefix, component, id);
                Message::new(topic, payload.to_string()).retained()
            })
            .collect()
    }
}

fn merge(target: &mut Value, extra: Value) {
    if let (Value::Object(target), Value::Object(extra)) = (target, extra) {
        target.extend(extra);
    }
}

fn on_off_symbol(payload: &str) -> String {
    match payload {
        "ON" => "on".to_string(),
        "OFF" => "off".to_string(),
        other => other.to_string(),
    }
}

fn on_off_payload(symbol: &str) -> String {
    match symbol {
        "on" => "ON".to_string(),
        "off" => "OFF".to_string(),
        other => other.to_string(),
    }
}
