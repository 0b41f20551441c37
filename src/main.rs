use std::collections::BTreeSet;
use std::fmt;
use std::sync::Arc;

use async_trait::async_trait;
use clap::{Parser, Subcommand};
use schemars::{JsonSchema, SchemaGenerator};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value, json};
use thiserror::Error;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};
use url::Url;

// Our own schema_for_type using schemars 0.9 with JSON Schema draft 2020-12 settings
fn schema_for_type<T: JsonSchema>() -> Map<String, Value> {
    let schema = SchemaGenerator::default().into_root_schema_for::<T>();
    let object = serde_json::to_value(schema).expect("failed to serialize schema");
    match object {
        Value::Object(object) => object,
        _ => panic!("unexpected schema value"),
    }
}

// =============================================================================
// Core Configuration
// =============================================================================

pub struct HubConfig {
    pub url: String,
    pub token: String,
}

impl HubConfig {
    pub fn new(url: String, token: String) -> Self {
        Self { url, token }
    }

    /// Resolve an API endpoint (e.g. `api/states/light.x`) against the hub URL.
    pub fn api_url(&self, endpoint: &str) -> Result<Url, BridgeError> {
        let base = Url::parse(&self.url)
            .map_err(|e| BridgeError::Hub(format!("Invalid hub URL '{}': {}", self.url, e)))?;
        base.join(endpoint)
            .map_err(|e| BridgeError::Hub(format!("Invalid endpoint '{}': {}", endpoint, e)))
    }
}

pub struct ModelConfig {
    pub api_base: String,
    pub api_key: String,
    pub model: String,
}

impl ModelConfig {
    pub fn chat_completions_url(&self) -> String {
        format!("{}/chat/completions", self.api_base.trim_end_matches('/'))
    }
}

/// Tunables for the device filter. The excluded domain prefixes are
/// configuration values rather than hard-coded literals because they are
/// heuristics tuned to Home Assistant's entity naming conventions.
#[derive(Debug, Clone)]
pub struct FilterRules {
    /// Only expose devices with at least one available controllable entity.
    pub only_available: bool,
    /// Domain whose single-entity devices are dropped (firmware updaters).
    pub update_domain: String,
    /// Domain that is observable but never controllable.
    pub sensor_domain: String,
}

impl Default for FilterRules {
    fn default() -> Self {
        Self {
            only_available: true,
            update_domain: "update".into(),
            sensor_domain: "sensor".into(),
        }
    }
}

// =============================================================================
// Errors & Entity Identifiers
// =============================================================================

#[derive(Debug, Error)]
pub enum BridgeError {
    #[error("device inventory response was not decodable: {0}")]
    InventoryDecode(String),

    #[error("hub request failed: {0}")]
    Hub(String),

    #[error("invalid entity id '{0}': expected <domain>.<object_id>")]
    InvalidEntityId(String),

    #[error("service {service} does not exist in domain {domain}")]
    ServiceNotFound { service: String, domain: String },

    #[error("service invocation failed: {0}")]
    ControlInvocation(String),

    #[error("tool call arguments could not be parsed: {0}")]
    MalformedToolArguments(String),

    #[error("model API error: {0}")]
    ModelApi(String),
}

/// A `<domain>.<object_id>` entity identifier, parsed once at the boundary.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EntityId {
    raw: String,
    dot: usize,
}

impl EntityId {
    pub fn parse(raw: &str) -> Result<Self, BridgeError> {
        let dot = raw
            .find('.')
            .ok_or_else(|| BridgeError::InvalidEntityId(raw.to_string()))?;
        if dot == 0 || dot + 1 == raw.len() {
            return Err(BridgeError::InvalidEntityId(raw.to_string()));
        }
        Ok(Self {
            raw: raw.to_string(),
            dot,
        })
    }

    pub fn domain(&self) -> &str {
        &self.raw[..self.dot]
    }

    pub fn object_id(&self) -> &str {
        &self.raw[self.dot + 1..]
    }

    pub fn as_str(&self) -> &str {
        &self.raw
    }
}

impl fmt::Display for EntityId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.raw)
    }
}

// =============================================================================
// Device Inventory Data Model
// =============================================================================

/// Hub-reported metadata for one device, as produced by the inventory
/// template. Every field except `entities` may be absent or null.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct DeviceRecord {
    #[serde(default)]
    pub device_id: String,
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub name_by_user: Option<String>,
    #[serde(default)]
    pub model: Option<String>,
    #[serde(default)]
    pub manufacturer: Option<String>,
    #[serde(default)]
    pub hw_version: Option<String>,
    #[serde(default)]
    pub sw_version: Option<String>,
    #[serde(default)]
    pub configuration_url: Option<String>,
    #[serde(default)]
    pub entry_type: Option<String>,
    #[serde(default)]
    pub disabled_by: Option<String>,
    #[serde(default)]
    pub area_id: Option<String>,
    #[serde(default)]
    pub suggested_area: Option<String>,
    #[serde(default)]
    pub via_device_id: Option<String>,
    #[serde(default)]
    pub identifiers: Vec<Value>,
    #[serde(default)]
    pub connections: Vec<Value>,
    #[serde(default)]
    pub entities: Vec<String>,
}

impl DeviceRecord {
    /// The user-assigned name wins over the integration-provided one.
    pub fn display_name(&self) -> &str {
        self.name_by_user
            .as_deref()
            .filter(|s| !s.is_empty())
            .or(self.name.as_deref())
            .unwrap_or(&self.device_id)
    }
}

pub const UNAVAILABLE_STATE: &str = "unavailable";

/// Live state + attributes of one entity, as returned by `api/states/<id>`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EntitySnapshot {
    pub entity_id: String,
    pub state: String,
    #[serde(default)]
    pub attributes: Map<String, Value>,
}

impl EntitySnapshot {
    pub fn is_unavailable(&self) -> bool {
        self.state == UNAVAILABLE_STATE
    }
}

/// A device that survived filtering, with its entity ids replaced by
/// resolved snapshots. This is the only view the prompt builder consumes.
#[derive(Debug, Clone)]
pub struct CuratedDevice {
    pub record: DeviceRecord,
    pub entities: Vec<EntitySnapshot>,
}

// =============================================================================
// Home Assistant API Client Abstraction
// =============================================================================

/// The narrow hub surface the bridge depends on. Production uses
/// [`HomeAssistantClient`]; tests substitute an in-memory hub.
#[async_trait]
pub trait HubApi: Send + Sync {
    /// The complete, fully materialized device inventory.
    async fn fetch_all_device_records(&self) -> Result<Vec<DeviceRecord>, BridgeError>;

    async fn fetch_entity_state(
        &self,
        entity_id: &EntityId,
    ) -> Result<EntitySnapshot, BridgeError>;

    /// The names of the services a domain exposes.
    async fn get_domain_services(&self, domain: &str) -> Result<BTreeSet<String>, BridgeError>;

    async fn invoke_service(
        &self,
        domain: &str,
        service: &str,
        entity_id: &EntityId,
        data: &Map<String, Value>,
    ) -> Result<Value, BridgeError>;
}

/// Server-side template that collects every device with its metadata and
/// owned entity ids in one round trip.
const DEVICE_INVENTORY_TEMPLATE: &str = r#"
{% set devices = states | map(attribute="entity_id") | map("device_id") | unique | reject("eq",None) | list %}
{%- set ns = namespace(devices = []) %}
{%- for device in devices %}
{%- set entities = device_entities(device) | list %}
{%- if entities %}
{%- set ns.devices = ns.devices + [ {
    device: {
        "name": device_attr(device, "name"),
        "name_by_user": device_attr(device, "name_by_user"),
        "model": device_attr(device, "model"),
        "manufacturer": device_attr(device, "manufacturer"),
        "hw_version": device_attr(device, "hw_version"),
        "sw_version": device_attr(device, "sw_version"),
        "configuration_url": device_attr(device, "configuration_url"),
        "entry_type": device_attr(device, "entry_type"),
        "disabled_by": device_attr(device, "disabled_by"),
        "area_id": device_attr(device, "area_id"),
        "suggested_area": device_attr(device, "suggested_area"),
        "via_device_id": device_attr(device, "via_device_id"),
        "identifiers": device_attr(device, "identifiers") | list,
        "connections": device_attr(device, "connections") | list,
        "entities": entities
    }
} ] %}
{%- endif %}
{%- endfor %}
{{ ns.devices | tojson }}
"#;

pub struct HomeAssistantClient {
    config: HubConfig,
    http_client: reqwest::Client,
}

impl HomeAssistantClient {
    pub fn new(config: HubConfig) -> Self {
        Self {
            config,
            http_client: reqwest::Client::new(),
        }
    }

    fn request_error(&self, endpoint: &str, e: reqwest::Error) -> BridgeError {
        if e.is_connect() {
            BridgeError::Hub(format!(
                "Cannot connect to Home Assistant at '{}'. Please check the URL and ensure Home Assistant is running.",
                self.config.url
            ))
        } else if e.is_timeout() {
            BridgeError::Hub(format!(
                "Timeout connecting to Home Assistant at '{}'",
                self.config.url
            ))
        } else {
            BridgeError::Hub(format!("Network error accessing {}: {}", endpoint, e))
        }
    }

    async fn decode_response(
        &self,
        endpoint: &str,
        response: reqwest::Response,
    ) -> Result<Value, BridgeError> {
        if !response.status().is_success() {
            let status = response.status();
            let error_text = response
                .text()
                .await
                .unwrap_or_else(|_| "Unable to read error response".to_string());

            let error_msg = match status.as_u16() {
                401 => "Authentication failed. Please check your HASS_API_KEY is valid and has not expired.".to_string(),
                403 => "Access forbidden. Your HASS_API_KEY may not have sufficient permissions.".to_string(),
                404 => format!("Home Assistant API endpoint not found: {}", endpoint),
                500..=599 => format!("Home Assistant server error ({}): {}", status, error_text),
                _ => format!("HTTP error {} accessing {}: {}", status, endpoint, error_text),
            };

            return Err(BridgeError::Hub(error_msg));
        }

        response
            .json()
            .await
            .map_err(|e| BridgeError::Hub(format!("Failed to parse JSON from {}: {}", endpoint, e)))
    }

    pub async fn rest_get(&self, endpoint: &str) -> Result<Value, BridgeError> {
        let response = self
            .http_client
            .get(self.config.api_url(endpoint)?)
            .header("Authorization", format!("Bearer {}", self.config.token))
            .send()
            .await
            .map_err(|e| self.request_error(endpoint, e))?;

        self.decode_response(endpoint, response).await
    }

    pub async fn rest_post(&self, endpoint: &str, body: &Value) -> Result<Value, BridgeError> {
        let response = self
            .http_client
            .post(self.config.api_url(endpoint)?)
            .header("Authorization", format!("Bearer {}", self.config.token))
            .json(body)
            .send()
            .await
            .map_err(|e| self.request_error(endpoint, e))?;

        self.decode_response(endpoint, response).await
    }
}

#[async_trait]
impl HubApi for HomeAssistantClient {
    async fn fetch_all_device_records(&self) -> Result<Vec<DeviceRecord>, BridgeError> {
        let body = json!({ "template": DEVICE_INVENTORY_TEMPLATE.trim() });
        let rendered = self.rest_post("api/template", &body).await?;
        Ok(decode_device_inventory(rendered))
    }

    async fn fetch_entity_state(
        &self,
        entity_id: &EntityId,
    ) -> Result<EntitySnapshot, BridgeError> {
        let value = self
            .rest_get(&format!("api/states/{}", entity_id.as_str()))
            .await?;
        serde_json::from_value(value).map_err(|e| {
            BridgeError::Hub(format!("Unexpected state shape for {}: {}", entity_id, e))
        })
    }

    async fn get_domain_services(&self, domain: &str) -> Result<BTreeSet<String>, BridgeError> {
        let listing = self.rest_get("api/services").await?;

        let mut services = BTreeSet::new();
        if let Some(entries) = listing.as_array() {
            for entry in entries {
                if entry.get("domain").and_then(Value::as_str) == Some(domain) {
                    if let Some(map) = entry.get("services").and_then(Value::as_object) {
                        services.extend(map.keys().cloned());
                    }
                }
            }
        }
        Ok(services)
    }

    async fn invoke_service(
        &self,
        domain: &str,
        service: &str,
        entity_id: &EntityId,
        data: &Map<String, Value>,
    ) -> Result<Value, BridgeError> {
        let mut body = data.clone();
        body.insert(
            "entity_id".to_string(),
            Value::String(entity_id.to_string()),
        );
        self.rest_post(
            &format!("api/services/{}/{}", domain, service),
            &Value::Object(body),
        )
        .await
    }
}

/// Decode the rendered inventory template. An undecodable response degrades
/// to an empty inventory so the query continues with no devices on offer.
pub fn decode_device_inventory(rendered: Value) -> Vec<DeviceRecord> {
    match parse_device_inventory(rendered) {
        Ok(records) => records,
        Err(e) => {
            tracing::warn!(error = %e, "continuing with an empty device inventory");
            Vec::new()
        }
    }
}

fn parse_device_inventory(mut rendered: Value) -> Result<Vec<DeviceRecord>, BridgeError> {
    // The hub sometimes returns the rendered template as a JSON string
    // containing JSON rather than the array itself.
    if let Value::String(inner) = &rendered {
        rendered = serde_json::from_str(inner)
            .map_err(|e| BridgeError::InventoryDecode(format!("inner payload: {}", e)))?;
    }

    let Value::Array(items) = rendered else {
        return Err(BridgeError::InventoryDecode(
            "expected a JSON array of devices".to_string(),
        ));
    };

    let mut records = Vec::with_capacity(items.len());
    for item in items {
        let Value::Object(map) = item else {
            return Err(BridgeError::InventoryDecode(
                "expected device objects keyed by device id".to_string(),
            ));
        };
        for (device_id, fields) in map {
            let mut record: DeviceRecord = serde_json::from_value(fields).map_err(|e| {
                BridgeError::InventoryDecode(format!("device {}: {}", device_id, e))
            })?;
            record.device_id = device_id;
            records.push(record);
        }
    }
    Ok(records)
}

// =============================================================================
// Device Filter
// =============================================================================

/// Reduce the raw inventory to the devices worth offering to the model.
///
/// Per device, in order: devices with no parseable entity are dropped; a
/// device whose only entity is an update entity is dropped; a device whose
/// entities are all sensors is dropped; remaining entities are resolved to
/// live snapshots (sensors included for display, but only non-sensor entities
/// count towards availability); with `only_available` set, devices with zero
/// available controllable entities are dropped. Hub enumeration order is
/// preserved.
pub async fn curate_devices(
    hub: &dyn HubApi,
    rules: &FilterRules,
) -> Result<Vec<CuratedDevice>, BridgeError> {
    let records = hub.fetch_all_device_records().await?;

    let mut curated = Vec::new();
    for record in records {
        let entity_ids: Vec<EntityId> = record
            .entities
            .iter()
            .filter_map(|raw| match EntityId::parse(raw) {
                Ok(id) => Some(id),
                Err(e) => {
                    tracing::warn!(device_id = %record.device_id, error = %e, "skipping entity");
                    None
                }
            })
            .collect();

        if entity_ids.is_empty() {
            continue;
        }

        // Pure firmware-update devices offer nothing to control.
        if entity_ids.len() == 1 && entity_ids[0].domain() == rules.update_domain {
            continue;
        }

        // Sensors alone are not controllable.
        if entity_ids
            .iter()
            .all(|id| id.domain() == rules.sensor_domain)
        {
            continue;
        }

        let mut snapshots = Vec::with_capacity(entity_ids.len());
        let mut available = 0usize;
        for entity_id in &entity_ids {
            match hub.fetch_entity_state(entity_id).await {
                Ok(snapshot) => {
                    if entity_id.domain() != rules.sensor_domain && !snapshot.is_unavailable() {
                        available += 1;
                    }
                    snapshots.push(snapshot);
                }
                Err(e) => {
                    // A failed state fetch must not abort the inventory.
                    tracing::warn!(
                        entity_id = %entity_id,
                        error = %e,
                        "state fetch failed, treating entity as unavailable"
                    );
                }
            }
        }

        if rules.only_available && available == 0 {
            continue;
        }

        curated.push(CuratedDevice {
            record,
            entities: snapshots,
        });
    }

    Ok(curated)
}

// =============================================================================
// Prompt Builder
// =============================================================================

const SYSTEM_PROMPT_PREAMBLE: &str = "\
You are a Home Assistant control expert. Your task is to control the smart \
devices in Home Assistant according to the user's natural-language request.

For every available device you are given:
- device name (name)
- user-assigned name (name_by_user)
- model
- manufacturer
- device entities (entities)
- suggested area (suggested_area)

Every entity has a state and attributes.

Choose the appropriate device and operation based on the user's request.
";

const UNKNOWN_PLACEHOLDER: &str = "unknown";

/// Render the curated device list into the system prompt. Devices and
/// entities appear in the order received; attribute maps iterate in key
/// order, so rendering the same input twice yields the same string.
pub fn build_system_prompt(devices: &[CuratedDevice]) -> String {
    let mut blocks = Vec::with_capacity(devices.len());
    for device in devices {
        let record = &device.record;
        let mut block = format!(
            "Device: {}\nModel: {}\nManufacturer: {}\nArea: {}\nEntities:\n",
            record.display_name(),
            record.model.as_deref().unwrap_or(UNKNOWN_PLACEHOLDER),
            record.manufacturer.as_deref().unwrap_or(UNKNOWN_PLACEHOLDER),
            record.suggested_area.as_deref().unwrap_or(UNKNOWN_PLACEHOLDER),
        );
        for entity in &device.entities {
            block.push_str(&render_entity_line(entity, record.display_name()));
            block.push('\n');
        }
        blocks.push(block);
    }

    format!(
        "{}\nAvailable devices:\n{}",
        SYSTEM_PROMPT_PREAMBLE,
        blocks.join("\n")
    )
}

/// One line per entity: id, flattened attributes, humanized state.
///
/// `device_class` is surfaced as the generic `type`, and `friendly_name` as
/// `name` with the device's own name stripped so entity labels do not repeat
/// it.
fn render_entity_line(entity: &EntitySnapshot, device_name: &str) -> String {
    let mut attrs = entity.attributes.clone();

    if let Some(value) = attrs.remove("device_class") {
        attrs.insert("type".to_string(), value);
    }
    if let Some(value) = attrs.remove("friendly_name") {
        let label = match value.as_str() {
            Some(s) => s.replace(device_name, "").trim().to_string(),
            None => render_attribute_value(&value),
        };
        attrs.insert("name".to_string(), Value::String(label));
    }

    let rendered: Vec<String> = attrs
        .iter()
        .map(|(k, v)| format!("{}: {}", k, render_attribute_value(v)))
        .collect();

    if rendered.is_empty() {
        format!(
            "entity_id: {} (state: {})",
            entity.entity_id,
            humanize_state(&entity.state)
        )
    } else {
        format!(
            "entity_id: {}, {} (state: {})",
            entity.entity_id,
            rendered.join(", "),
            humanize_state(&entity.state)
        )
    }
}

fn render_attribute_value(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}

/// Boolean-like states get a human-readable label; everything else passes
/// through verbatim.
fn humanize_state(state: &str) -> &str {
    match state {
        "on" => "On",
        "off" => "Off",
        "unknown" => "Unknown",
        UNAVAILABLE_STATE => "Unavailable",
        other => other,
    }
}

// =============================================================================
// Language Model Client Abstraction
// =============================================================================

/// One tool-call request as emitted by the model. `raw_arguments` is text
/// that should decode to a JSON object but is not guaranteed well-formed.
#[derive(Debug, Clone)]
pub struct ToolCallRequest {
    pub id: String,
    pub name: String,
    pub raw_arguments: String,
}

#[derive(Debug, Clone, Default)]
pub struct ChatOutcome {
    pub content: Option<String>,
    pub tool_calls: Vec<ToolCallRequest>,
}

#[async_trait]
pub trait ChatModel: Send + Sync {
    async fn complete(
        &self,
        system_prompt: &str,
        user_message: &str,
        tools: &[Value],
    ) -> Result<ChatOutcome, BridgeError>;

    /// Coerce a malformed tool-call payload into valid JSON. Used only when
    /// the primary parse fails.
    async fn repair_json(&self, raw: &str) -> Result<Value, BridgeError>;
}

const REPAIR_SYSTEM_PROMPT: &str = "\
You repair malformed JSON. The user message is a broken JSON object. Reply \
with only the corrected JSON object: no explanation, no code fences.";

pub struct OpenAiChatClient {
    config: ModelConfig,
    http_client: reqwest::Client,
}

impl OpenAiChatClient {
    pub fn new(config: ModelConfig) -> Self {
        Self {
            config,
            http_client: reqwest::Client::new(),
        }
    }

    async fn post_chat(&self, body: Value) -> Result<Value, BridgeError> {
        let response = self
            .http_client
            .post(self.config.chat_completions_url())
            .bearer_auth(&self.config.api_key)
            .json(&body)
            .send()
            .await
            .map_err(|e| BridgeError::ModelApi(format!("request failed: {}", e)))?;

        let status = response.status();
        if !status.is_success() {
            let error_text = response
                .text()
                .await
                .unwrap_or_else(|_| "Unable to read error response".to_string());
            return Err(BridgeError::ModelApi(format!(
                "model API returned {}: {}",
                status, error_text
            )));
        }

        response
            .json()
            .await
            .map_err(|e| BridgeError::ModelApi(format!("failed to parse response: {}", e)))
    }
}

#[async_trait]
impl ChatModel for OpenAiChatClient {
    async fn complete(
        &self,
        system_prompt: &str,
        user_message: &str,
        tools: &[Value],
    ) -> Result<ChatOutcome, BridgeError> {
        let mut body = json!({
            "model": self.config.model,
            "messages": [
                { "role": "system", "content": system_prompt },
                { "role": "user", "content": user_message },
            ],
        });
        if !tools.is_empty() {
            body["tools"] = Value::Array(tools.to_vec());
        }

        let response = self.post_chat(body).await?;
        Ok(extract_chat_outcome(&response))
    }

    async fn repair_json(&self, raw: &str) -> Result<Value, BridgeError> {
        let body = json!({
            "model": self.config.model,
            "messages": [
                { "role": "system", "content": REPAIR_SYSTEM_PROMPT },
                { "role": "user", "content": raw },
            ],
            "temperature": 0,
        });

        let response = self.post_chat(body).await?;
        let content = response["choices"][0]["message"]["content"]
            .as_str()
            .unwrap_or_default();
        let candidate = strip_code_fences(content);

        serde_json::from_str(candidate).map_err(|e| {
            BridgeError::MalformedToolArguments(format!("repair output was not valid JSON: {}", e))
        })
    }
}

/// Pull content and tool-call requests out of an OpenAI-shaped chat
/// completion response.
pub fn extract_chat_outcome(response: &Value) -> ChatOutcome {
    let message = &response["choices"][0]["message"];

    let content = message["content"]
        .as_str()
        .filter(|s| !s.is_empty())
        .map(str::to_string);

    let mut tool_calls = Vec::new();
    if let Some(calls) = message["tool_calls"].as_array() {
        for (idx, call) in calls.iter().enumerate() {
            let Some(name) = call["function"]["name"].as_str() else {
                continue;
            };
            let id = call["id"]
                .as_str()
                .map(str::to_string)
                .unwrap_or_else(|| format!("tool_call_{}", idx + 1));
            let raw_arguments = call["function"]["arguments"]
                .as_str()
                .unwrap_or("{}")
                .to_string();

            tool_calls.push(ToolCallRequest {
                id,
                name: name.to_string(),
                raw_arguments,
            });
        }
    }

    ChatOutcome {
        content,
        tool_calls,
    }
}

fn strip_code_fences(text: &str) -> &str {
    let trimmed = text.trim();
    let Some(rest) = trimmed.strip_prefix("```") else {
        return trimmed;
    };
    let rest = rest.strip_prefix("json").unwrap_or(rest);
    let rest = rest.strip_suffix("```").unwrap_or(rest);
    rest.trim()
}

// =============================================================================
// Device Control Action
// =============================================================================

pub const CONTROL_TOOL_NAME: &str = "control_device";

#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
pub struct ControlArgs {
    /// The entity ID to control (e.g. light.living_room)
    pub entity_id: String,
    /// The service to call, such as turn_on, turn_off, toggle, select_option
    pub service: String,
    /// Parameters for the service call
    #[serde(default)]
    #[schemars(with = "std::collections::HashMap<String, serde_json::Value>")]
    pub data: Map<String, Value>,
}

/// The control action as advertised to the model.
pub fn control_tool_definition() -> Value {
    json!({
        "type": "function",
        "function": {
            "name": CONTROL_TOOL_NAME,
            "description": "Control a smart device in Home Assistant",
            "parameters": schema_for_type::<ControlArgs>(),
        }
    })
}

/// Invoke one service against one entity. Every failure is converted to a
/// reported outcome string; nothing escapes as an error.
pub async fn control_device(hub: &dyn HubApi, args: &ControlArgs) -> String {
    match try_control_device(hub, args).await {
        Ok(entity_id) => format!("Controlled {}", entity_id),
        Err(e) => format!("Failed to control {}: {}", args.entity_id, e),
    }
}

async fn try_control_device(hub: &dyn HubApi, args: &ControlArgs) -> Result<String, BridgeError> {
    let entity_id = EntityId::parse(&args.entity_id)?;

    let services = hub.get_domain_services(entity_id.domain()).await?;
    if !services.contains(&args.service) {
        return Err(BridgeError::ServiceNotFound {
            service: args.service.clone(),
            domain: entity_id.domain().to_string(),
        });
    }

    // Single attempt, no retries.
    let result = hub
        .invoke_service(entity_id.domain(), &args.service, &entity_id, &args.data)
        .await
        .map_err(|e| BridgeError::ControlInvocation(e.to_string()))?;
    tracing::debug!(entity_id = %entity_id, result = %result, "service invoked");

    Ok(entity_id.to_string())
}

// =============================================================================
// Query Dispatch
// =============================================================================

pub const NO_INSTRUCTION_MESSAGE: &str = "Control failed: the AI gave no concrete instruction";
pub const NO_ACTION_MESSAGE: &str = "No action was performed";

/// The natural-language-to-device-action pipeline: fetch and filter the
/// inventory, render the prompt, submit the query, and dispatch every
/// control tool call the model returns.
pub struct Bridge {
    hub: Arc<dyn HubApi>,
    model: Arc<dyn ChatModel>,
    rules: FilterRules,
}

impl Bridge {
    pub fn new(hub: Arc<dyn HubApi>, model: Arc<dyn ChatModel>, rules: FilterRules) -> Self {
        Self { hub, model, rules }
    }

    pub async fn handle_query(&self, query: &str) -> Result<String, BridgeError> {
        let devices = curate_devices(self.hub.as_ref(), &self.rules).await?;
        tracing::info!(device_count = devices.len(), "curated device inventory");

        let system_prompt = build_system_prompt(&devices);
        let tools = vec![control_tool_definition()];
        let outcome = self.model.complete(&system_prompt, query, &tools).await?;

        if let Some(content) = &outcome.content {
            tracing::debug!(content = %content, "assistant content");
        }

        if outcome.tool_calls.is_empty() {
            return Ok(NO_INSTRUCTION_MESSAGE.to_string());
        }

        let mut results = Vec::new();
        for call in &outcome.tool_calls {
            if call.name != CONTROL_TOOL_NAME {
                // Other tools the model may have been offered are not ours.
                tracing::debug!(tool = %call.name, "ignoring unrecognized tool call");
                continue;
            }

            match self.resolve_arguments(call).await {
                Ok(args) => results.push(control_device(self.hub.as_ref(), &args).await),
                Err(e) => results.push(format!("Failed to control device: {}", e)),
            }
        }

        if results.is_empty() {
            return Ok(NO_ACTION_MESSAGE.to_string());
        }
        Ok(results.join("\n"))
    }

    /// Two-stage argument parse: decode the payload directly, and on failure
    /// fall back to exactly one model-driven repair pass.
    async fn resolve_arguments(&self, call: &ToolCallRequest) -> Result<ControlArgs, BridgeError> {
        let parse_err = match serde_json::from_str::<ControlArgs>(&call.raw_arguments) {
            Ok(args) => return Ok(args),
            Err(e) => e,
        };

        tracing::debug!(
            id = %call.id,
            error = %parse_err,
            raw = %call.raw_arguments,
            "malformed tool arguments, attempting repair"
        );

        let repaired = self
            .model
            .repair_json(&call.raw_arguments)
            .await
            .map_err(|e| {
                BridgeError::MalformedToolArguments(format!("{}; repair failed: {}", parse_err, e))
            })?;

        serde_json::from_value(repaired).map_err(|e| {
            BridgeError::MalformedToolArguments(format!(
                "{}; repaired payload still invalid: {}",
                parse_err, e
            ))
        })
    }
}

// =============================================================================
// CLI
// =============================================================================

#[derive(Parser)]
#[command(name = "hass-bridge")]
#[command(about = "Natural-language device control bridge for Home Assistant")]
#[command(version = "0.1.0")]
struct Cli {
    /// Home Assistant URL (e.g., http://localhost:8123)
    #[arg(long = "url", env = "HASS_URL")]
    url: String,

    /// Home Assistant long-lived access token
    #[arg(long = "api-key", env = "HASS_API_KEY")]
    api_key: String,

    /// Base URL of the OpenAI-compatible model API
    #[arg(long = "model-api-base", env = "OPENAI_API_BASE")]
    model_api_base: String,

    /// API key for the model API
    #[arg(long = "model-api-key", env = "OPENAI_API_KEY")]
    model_api_key: String,

    /// Model identifier to use for completions
    #[arg(long = "model", env = "BRIDGE_MODEL")]
    model: String,

    /// Offer devices even when all their controllable entities are unavailable
    #[arg(long = "include-unavailable")]
    include_unavailable: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// List the curated devices that would be offered to the model
    Devices,
    /// Print the rendered system prompt
    Prompt,
    /// Run a natural-language control query end to end
    Query { text: String },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info".into()),
        )
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .init();

    let cli = Cli::parse();

    let hub: Arc<dyn HubApi> = Arc::new(HomeAssistantClient::new(HubConfig::new(
        cli.url.clone(),
        cli.api_key.clone(),
    )));
    let model: Arc<dyn ChatModel> = Arc::new(OpenAiChatClient::new(ModelConfig {
        api_base: cli.model_api_base.clone(),
        api_key: cli.model_api_key.clone(),
        model: cli.model.clone(),
    }));
    let rules = FilterRules {
        only_available: !cli.include_unavailable,
        ..FilterRules::default()
    };

    tracing::info!(url = %cli.url, model = %cli.model, "hass-bridge starting");

    match cli.command {
        Command::Devices => {
            let devices = curate_devices(hub.as_ref(), &rules).await?;
            for device in &devices {
                println!("{}", device.record.display_name());
            }
        }
        Command::Prompt => {
            let devices = curate_devices(hub.as_ref(), &rules).await?;
            println!("{}", build_system_prompt(&devices));
        }
        Command::Query { text } => {
            let bridge = Bridge::new(hub, model, rules);
            println!("{}", bridge.handle_query(&text).await?);
        }
    }

    Ok(())
}

// =============================================================================
// Tests
// =============================================================================
