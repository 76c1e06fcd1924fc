use crate::conversion::Converter;

/// One field pulled out of the station's query string.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MetricReading {
    pub name: &'static str,
    pub raw_value: String,
    pub required: bool,
}

/// A reading after unit conversion, formatted the way it goes on the wire.
#[derive(Debug, Clone, PartialEq)]
pub struct ConvertedValue {
    pub name: String,
    pub numeric_value: f64,
    pub formatted_value: String,
}

impl ConvertedValue {
    pub fn new(name: &str, raw: f64, converter: Converter) -> Self {
        Self {
            name: name.to_string(),
            numeric_value: converter.apply(raw),
            formatted_value: converter.format(raw),
        }
    }
}

/// What happened to one topic during a publish pass.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Outcome {
    Published,
    Unchanged,
    Unparseable,
    Sentinel,
    Offline,
    PublishFailed,
}
