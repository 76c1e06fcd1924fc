//! Pulls the station's telemetry fields out of the request query string.
//!
//! Values stay strings here. A missing or empty field becomes an empty
//! reading; numeric validation happens later, per topic, in the publisher.

use std::collections::HashMap;
use tracing::warn;

use crate::models::MetricReading;

#[derive(Debug, Clone, Copy)]
pub struct FieldSpec {
    pub name: &'static str,
    pub required: bool,
}

const fn required(name: &'static str) -> FieldSpec {
    FieldSpec { name, required: true }
}

const fn optional(name: &'static str) -> FieldSpec {
    FieldSpec { name, required: false }
}

/// Every query parameter the bridge understands, in extraction order.
/// Station identity parameters (`ID`, `PASSWORD`, `dateutc`, `action`...)
/// are ignored.
pub const FIELDS: &[FieldSpec] = &[
    required("tempf"),
    required("humidity"),
    required("dewptf"),
    required("windchillf"),
    required("winddir"),
    required("windspeedmph"),
    required("windgustmph"),
    required("rainin"),
    required("dailyrainin"),
    required("weeklyrainin"),
    required("monthlyrainin"),
    required("yearlyrainin"),
    required("solarradiation"),
    required("UV"),
    required("indoortempf"),
    required("indoorhumidity"),
    required("baromin"),
    optional("lowbatt"),
    optional("softwaretype"),
];

/// Returns the value of `name`, or an empty string when it is absent or empty.
pub fn field_value(params: &HashMap<String, String>, name: &str, required: bool) -> String {
    match params.get(name) {
        Some(value) if !value.is_empty() => value.clone(),
        _ => {
            if required {
                warn!("Required field '{}' is missing from the station report.", name);
            }
            String::new()
        }
    }
}

/// All readings of one station report.
#[derive(Debug, Clone, Default)]
pub struct StationReport {
    readings: Vec<MetricReading>,
}

impl StationReport {
    pub fn extract(params: &HashMap<String, String>) -> Self {
        let readings = FIELDS
            .iter()
            .map(|field| MetricReading {
                name: field.name,
                raw_value: field_value(params, field.name, field.required),
                required: field.required,
            })
            .collect();
        Self { readings }
    }

    /// Raw value of a field; empty if the field is unknown or was missing.
    pub fn raw(&self, name: &str) -> &str {
        self.readings
            .iter()
            .find(|reading| reading.name == name)
            .map(|reading| reading.raw_value.as_str())
            .unwrap_or("")
    }

    pub fn missing_required(&self) -> impl Iterator<Item = &'static str> + '_ {
        self.readings
            .iter()
            .filter(|reading| reading.required && reading.raw_value.is_empty())
            .map(|reading| reading.name)
    }
}
