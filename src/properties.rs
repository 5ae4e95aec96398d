use std::collections::HashSet;

use crate::aggregate::AggregationMode;
use crate::error::{ReplicatorError, ReplicatorResult};

/// Rate window baked into the built-in templates when sampling a range.
pub const RANGE_RATE_WINDOW: &str = "20s";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Slot {
    Quantile,
    Window,
}

impl Slot {
    fn parse(name: &str) -> Option<Self> {
        match name {
            "quantile" => Some(Self::Quantile),
            "window" => Some(Self::Window),
            _ => None,
        }
    }

    fn name(self) -> &'static str {
        match self {
            Self::Quantile => "quantile",
            Self::Window => "window",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
enum Segment {
    Literal(String),
    Slot(Slot),
}

/// Query text with named `${quantile}` / `${window}` slots.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QueryTemplate {
    raw: String,
    segments: Vec<Segment>,
}

#[derive(Debug, Clone, Copy, Default)]
pub struct QueryParams<'a> {
    pub quantile: Option<&'a str>,
    pub window: Option<&'a str>,
}

impl QueryTemplate {
    pub fn parse(raw: &str) -> ReplicatorResult<Self> {
        let mut segments = Vec::new();
        let mut rest = raw;
        while let Some(open) = rest.find("${") {
            if open > 0 {
                segments.push(Segment::Literal(rest[..open].to_string()));
            }
            let after = &rest[open + 2..];
            let close = after.find('}').ok_or_else(|| {
                ReplicatorError::config(format!("unterminated slot in query template `{raw}`"))
            })?;
            let name = after[..close].trim();
            let slot = Slot::parse(name).ok_or_else(|| {
                ReplicatorError::config(format!(
                    "unknown slot `${{{name}}}` in query template `{raw}`"
                ))
            })?;
            segments.push(Segment::Slot(slot));
            rest = &after[close + 1..];
        }
        if !rest.is_empty() {
            segments.push(Segment::Literal(rest.to_string()));
        }
        Ok(Self {
            raw: raw.to_string(),
            segments,
        })
    }

    pub fn as_str(&self) -> &str {
        &self.raw
    }

    pub fn has_slot(&self, slot: Slot) -> bool {
        self.segments.contains(&Segment::Slot(slot))
    }

    pub fn render(&self, params: QueryParams<'_>) -> ReplicatorResult<String> {
        let mut out = String::with_capacity(self.raw.len());
        for segment in &self.segments {
            match segment {
                Segment::Literal(text) => out.push_str(text),
                Segment::Slot(slot) => {
                    let value = match slot {
                        Slot::Quantile => params.quantile,
                        Slot::Window => params.window,
                    };
                    let value = value.ok_or_else(|| {
                        ReplicatorError::config(format!(
                            "no value for slot `{}` in `{}`",
                            slot.name(),
                            self.raw
                        ))
                    })?;
                    out.push_str(value);
                }
            }
        }
        Ok(out)
    }
}

#[derive(Debug, Clone)]
pub struct PropertyDefinition {
    pub name: String,
    pub template: QueryTemplate,
    pub description: String,
    pub unit: String,
    pub requires_quantile: bool,
}

impl PropertyDefinition {
    pub fn new(
        name: &str,
        template: &str,
        description: &str,
        unit: &str,
        requires_quantile: bool,
    ) -> ReplicatorResult<Self> {
        Ok(Self {
            name: name.to_string(),
            template: QueryTemplate::parse(template)?,
            description: description.to_string(),
            unit: unit.to_string(),
            requires_quantile,
        })
    }
}

/// Ordered, validated list of properties extracted for every window.
///
/// Order is significant: records are emitted in catalog order, and within a
/// quantile property in quantile-list order.
#[derive(Debug, Clone)]
pub struct PropertyCatalog {
    properties: Vec<PropertyDefinition>,
    mode: AggregationMode,
}

impl PropertyCatalog {
    pub fn new(
        properties: Vec<PropertyDefinition>,
        mode: &AggregationMode,
    ) -> ReplicatorResult<Self> {
        let mut seen = HashSet::new();
        for prop in &properties {
            if prop.name.trim().is_empty() {
                return Err(ReplicatorError::config("property with empty name"));
            }
            if !seen.insert(prop.name.as_str()) {
                return Err(ReplicatorError::config(format!(
                    "duplicate property `{}`",
                    prop.name
                )));
            }
            let has_quantile = prop.template.has_slot(Slot::Quantile);
            if has_quantile != prop.requires_quantile {
                return Err(ReplicatorError::config(format!(
                    "property `{}`: template `{}` {} a ${{quantile}} slot but requires_quantile is {}",
                    prop.name,
                    prop.template.as_str(),
                    if has_quantile { "has" } else { "lacks" },
                    prop.requires_quantile
                )));
            }
            let has_window = prop.template.has_slot(Slot::Window);
            let wants_window = mode.uses_window_slot();
            if has_window != wants_window {
                return Err(ReplicatorError::config(format!(
                    "property `{}`: template `{}` {} a ${{window}} slot, which {} mode {}",
                    prop.name,
                    prop.template.as_str(),
                    if has_window { "has" } else { "lacks" },
                    mode,
                    if wants_window { "requires" } else { "does not fill" }
                )));
            }
        }
        Ok(Self {
            properties,
            mode: mode.clone(),
        })
    }

    /// Aggregation mode the templates were validated against.
    pub fn mode(&self) -> &AggregationMode {
        &self.mode
    }

    /// The consensus metrics extracted by default, with rate windows suited to `mode`.
    pub fn consensus(mode: &AggregationMode) -> ReplicatorResult<Self> {
        let rate_window = if mode.uses_window_slot() {
            "${window}"
        } else {
            RANGE_RATE_WINDOW
        };
        let per_node = |metric: &str| {
            format!("quantile(${{quantile}}, sum(rate({metric}[{rate_window}])) by (instance))")
        };
        let overall = |metric: &str| format!("sum(rate({metric}[{rate_window}]))");
        let phase = |bucket: &str| {
            format!("histogram_quantile(${{quantile}}, sum(rate({bucket}[{rate_window}])) by (le))")
        };

        let properties = vec![
            PropertyDefinition::new(
                "sent_traffic_per_node",
                &per_node("insolar_consensus_packets_sent_bytes"),
                "Sent consensus bytes by node per second",
                "bytes/sec",
                true,
            )?,
            PropertyDefinition::new(
                "sent_traffic",
                &overall("insolar_consensus_packets_sent_bytes"),
                "Overall network sent bytes per second",
                "bytes/sec",
                false,
            )?,
            PropertyDefinition::new(
                "recv_traffic_per_node",
                &per_node("insolar_consensus_packets_recv_bytes"),
                "Received consensus bytes by node per second",
                "bytes/sec",
                true,
            )?,
            PropertyDefinition::new(
                "recv_traffic",
                &overall("insolar_consensus_packets_recv_bytes"),
                "Overall network received bytes per second",
                "bytes/sec",
                false,
            )?,
            PropertyDefinition::new(
                "sent_consensus_packets",
                &per_node("insolar_consensus_packets_sent_count"),
                "Sent consensus packets by node per second",
                "packets/sec",
                true,
            )?,
            PropertyDefinition::new(
                "recv_consensus_packets",
                &per_node("insolar_consensus_packets_recv_count"),
                "Received consensus packets by node per second",
                "packets/sec",
                true,
            )?,
            PropertyDefinition::new(
                "phase01_duration",
                &phase("insolar_phase01_latency_bucket"),
                "Duration of consensus phase01",
                "ms",
                true,
            )?,
            PropertyDefinition::new(
                "phase2_duration",
                &phase("insolar_phase2_latency_bucket"),
                "Duration of consensus phase2",
                "ms",
                true,
            )?,
            PropertyDefinition::new(
                "phase3_duration",
                &phase("insolar_phase3_latency_bucket"),
                "Duration of consensus phase3",
                "ms",
                true,
            )?,
        ];
        Self::new(properties, mode)
    }

    pub fn iter(&self) -> impl Iterator<Item = &PropertyDefinition> {
        self.properties.iter()
    }

    pub fn len(&self) -> usize {
        self.properties.len()
    }

    pub fn is_empty(&self) -> bool {
        self.properties.is_empty()
    }

    pub fn names(&self) -> Vec<String> {
        self.properties.iter().map(|p| p.name.clone()).collect()
    }

    /// `(N - K) + K * Q` for N properties of which K take a quantile.
    pub fn expected_record_count(&self, quantile_count: usize) -> usize {
        self.properties
            .iter()
            .map(|p| if p.requires_quantile { quantile_count } else { 1 })
            .sum()
    }
}
