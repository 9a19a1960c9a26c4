use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::ops::Range;

/// Grace window granted to a demoted slot before the sweeper may reclaim it.
pub const GRACE_WINDOW_HOURS: i64 = 48;

/// Registry schema version written into ssot.json.
pub const SSOT_SCHEMA_VERSION: u32 = 1;

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[serde(rename_all = "lowercase")]
pub enum Environment {
    Production,
    Staging,
    Preview,
}

impl Environment {
    pub const ALL: [Environment; 3] = [
        Environment::Production,
        Environment::Staging,
        Environment::Preview,
    ];

    /// Host port range assigned to this environment (closed-open).
    pub fn port_range(self) -> Range<u16> {
        match self {
            Environment::Production => 4100..4500,
            Environment::Staging => 4500..5000,
            Environment::Preview => 5000..5500,
        }
    }
}

impl std::fmt::Display for Environment {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Environment::Production => write!(f, "production"),
            Environment::Staging => write!(f, "staging"),
            Environment::Preview => write!(f, "preview"),
        }
    }
}

impl std::str::FromStr for Environment {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "production" => Ok(Environment::Production),
            "staging" => Ok(Environment::Staging),
            "preview" => Ok(Environment::Preview),
            _ => Err(format!("Invalid environment: {}", s)),
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "lowercase")]
pub enum SlotName {
    Blue,
    Green,
}

impl SlotName {
    pub fn opposite(self) -> SlotName {
        match self {
            SlotName::Blue => SlotName::Green,
            SlotName::Green => SlotName::Blue,
        }
    }

    /// Port parity this slot prefers within its environment range.
    /// Blue takes even offsets, green odd. Advisory only.
    pub fn preferred_offset_parity(self) -> u16 {
        match self {
            SlotName::Blue => 0,
            SlotName::Green => 1,
        }
    }
}

impl std::fmt::Display for SlotName {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SlotName::Blue => write!(f, "blue"),
            SlotName::Green => write!(f, "green"),
        }
    }
}

impl std::str::FromStr for SlotName {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "blue" => Ok(SlotName::Blue),
            "green" => Ok(SlotName::Green),
            _ => Err(format!("Invalid slot: {}", s)),
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "lowercase")]
pub enum SlotState {
    #[default]
    Empty,
    Deployed,
    Active,
    Grace,
}

impl std::fmt::Display for SlotState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SlotState::Empty => write!(f, "empty"),
            SlotState::Deployed => write!(f, "deployed"),
            SlotState::Active => write!(f, "active"),
            SlotState::Grace => write!(f, "grace"),
        }
    }
}

/// One of the two replicas a scope owns.
#[derive(Debug, Clone, Serialize, Deserialize, Default, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct SlotRecord {
    pub state: SlotState,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub port: Option<u16>,
    /// Container-internal port the application listens on. Needed to
    /// re-probe the replica from inside the container at promote time.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub app_port: Option<u16>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub container: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub image: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub deployed_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub grace_expires_at: Option<DateTime<Utc>>,
}

impl SlotRecord {
    pub fn is_empty(&self) -> bool {
        self.state == SlotState::Empty
    }

    /// Reset the slot back to empty, dropping all bookkeeping.
    pub fn clear(&mut self) {
        *self = SlotRecord::default();
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, Default, PartialEq)]
pub struct SlotPair {
    pub blue: SlotRecord,
    pub green: SlotRecord,
}

/// Per-scope state as persisted in `slots/{project}-{env}.json`.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ScopeState {
    pub project: String,
    pub environment: Environment,
    pub active_slot: Option<SlotName>,
    pub slots: SlotPair,
}

impl ScopeState {
    pub fn new(project: impl Into<String>, environment: Environment) -> Self {
        Self {
            project: project.into(),
            environment,
            active_slot: None,
            slots: SlotPair::default(),
        }
    }

    /// Scope key used for file names, container names and lock keys.
    pub fn key(&self) -> String {
        scope_key(&self.project, self.environment)
    }

    pub fn slot(&self, name: SlotName) -> &SlotRecord {
        match name {
            SlotName::Blue => &self.slots.blue,
            SlotName::Green => &self.slots.green,
        }
    }

    pub fn slot_mut(&mut self, name: SlotName) -> &mut SlotRecord {
        match name {
            SlotName::Blue => &mut self.slots.blue,
            SlotName::Green => &mut self.slots.green,
        }
    }

    /// Container name for one of this scope's slots.
    pub fn container_name(&self, name: SlotName) -> String {
        format!("{}-{}-{}", self.project, self.environment, name)
    }

    /// Slot that should receive the next deploy.
    pub fn deploy_target(&self) -> SlotName {
        self.active_slot.map(SlotName::opposite).unwrap_or(SlotName::Blue)
    }

    /// The single slot currently in the given state, if exactly one exists.
    pub fn single_slot_in(&self, state: SlotState) -> Option<SlotName> {
        match (self.slots.blue.state == state, self.slots.green.state == state) {
            (true, false) => Some(SlotName::Blue),
            (false, true) => Some(SlotName::Green),
            _ => None,
        }
    }

    pub fn non_empty_slots(&self) -> Vec<SlotName> {
        [SlotName::Blue, SlotName::Green]
            .into_iter()
            .filter(|n| !self.slot(*n).is_empty())
            .collect()
    }

    /// Check the scope invariants. A violation means the registry file is
    /// corrupt and the scope must not be operated on.
    pub fn validate(&self) -> Result<(), String> {
        let blue = &self.slots.blue;
        let green = &self.slots.green;

        if blue.state == SlotState::Active && green.state == SlotState::Active {
            return Err("both slots are active".into());
        }
        if blue.state == SlotState::Grace && green.state == SlotState::Grace {
            return Err("both slots are in grace".into());
        }

        match self.active_slot {
            Some(name) => {
                if self.slot(name).state != SlotState::Active {
                    return Err(format!("activeSlot points at {} but its state is {}", name, self.slot(name).state));
                }
            }
            None => {
                if blue.state == SlotState::Active || green.state == SlotState::Active {
                    return Err("a slot is active but activeSlot is unset".into());
                }
            }
        }

        for name in [SlotName::Blue, SlotName::Green] {
            let slot = self.slot(name);
            match slot.state {
                SlotState::Empty => {
                    if slot.port.is_some() || slot.container.is_some() {
                        return Err(format!("{} is empty but still holds a port or container", name));
                    }
                }
                _ => {
                    let port = slot
                        .port
                        .ok_or_else(|| format!("{} is {} but has no port", name, slot.state))?;
                    if !self.environment.port_range().contains(&port) {
                        return Err(format!(
                            "{} port {} outside the {} range",
                            name, port, self.environment
                        ));
                    }
                }
            }
            if (slot.state == SlotState::Grace) != slot.grace_expires_at.is_some() {
                return Err(format!("{} grace timestamp does not match its state", name));
            }
        }

        if let (Some(bp), Some(gp)) = (blue.port, green.port) {
            if bp == gp {
                return Err(format!("blue and green share port {}", bp));
            }
        }

        Ok(())
    }
}

pub fn scope_key(project: &str, environment: Environment) -> String {
    format!("{}-{}", project, environment)
}

/// Parse a container name of the form `{project}-{env}-{slot}`. Project
/// names may themselves contain dashes, so parsing is anchored on the
/// two known suffix segments.
pub fn parse_container_name(name: &str) -> Option<(String, Environment, SlotName)> {
    let (rest, slot) = name.rsplit_once('-')?;
    let slot: SlotName = slot.parse().ok()?;
    let (project, env) = rest.rsplit_once('-')?;
    let environment: Environment = env.parse().ok()?;
    if project.is_empty() {
        return None;
    }
    Some((project.to_string(), environment, slot))
}

/// Owner entry in the host-global port ledger.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct PortOwner {
    pub project: String,
    pub slot: SlotName,
}

/// Host-global single source of truth: environment ranges plus the port
/// ledger. Persisted as `ssot.json` next to the `slots/` directory.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Ssot {
    pub schema_version: u32,
    pub environments: BTreeMap<String, PortRangeSpec>,
    #[serde(default)]
    pub ports: BTreeMap<u16, PortOwner>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct PortRangeSpec {
    pub start: u16,
    pub end: u16,
}

impl Default for Ssot {
    fn default() -> Self {
        let environments = Environment::ALL
            .into_iter()
            .map(|env| {
                let range = env.port_range();
                (env.to_string(), PortRangeSpec { start: range.start, end: range.end })
            })
            .collect();
        Self {
            schema_version: SSOT_SCHEMA_VERSION,
            environments,
            ports: BTreeMap::new(),
        }
    }
}
