//! Fixed mapping from topic suffix to source field, converter and retain flag.
//!
//! Existing subscribers depend on these names. Each entry owns its own
//! last-value slot, keyed by suffix, so the alias set never shares state
//! with the primary set.

use crate::conversion::Converter;
use crate::conversion::Converter::{FahrenheitToCelsius as F2C, Identity as Id, MphToKph as M2K};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TopicSpec {
    pub suffix: &'static str,
    pub field: &'static str,
    pub converter: Converter,
    pub retain: bool,
}

const fn primary(suffix: &'static str, field: &'static str, converter: Converter) -> TopicSpec {
    TopicSpec {
        suffix,
        field,
        converter,
        retain: true,
    }
}

const fn alias(suffix: &'static str, field: &'static str, converter: Converter) -> TopicSpec {
    TopicSpec {
        suffix,
        field,
        converter,
        retain: false,
    }
}

/// Liveness marker, published as `"1"` on every request with a live broker.
pub const STATUS_SUFFIX: &str = "status";
/// JSON station info, published on every request with a live broker.
pub const INFO_SUFFIX: &str = "info";

/// Legacy layout, retained.
pub const PRIMARY_TOPICS: &[TopicSpec] = &[
    primary("out/temp", "tempf", F2C),
    primary("out/humidity", "humidity", Id),
    primary("out/dewpoint", "dewptf", F2C),
    primary("out/windchill", "windchillf", F2C),
    primary("out/winddir", "winddir", Id),
    primary("out/windspeed", "windspeedmph", M2K),
    primary("out/windgust", "windgustmph", M2K),
    primary("out/rain", "rainin", Id),
    primary("out/dailyrain", "dailyrainin", Id),
    primary("out/weeklyrain", "weeklyrainin", Id),
    primary("out/monthlyrain", "monthlyrainin", Id),
    primary("out/yearlyrain", "yearlyrainin", Id),
    primary("out/solarradiation", "solarradiation", Id),
    primary("out/uv", "UV", Id),
    primary("in/temp", "indoortempf", F2C),
    primary("in/humidity", "indoorhumidity", Id),
    primary("baro", "baromin", Id),
    primary("battery", "lowbatt", Id),
];

/// WeeWX-compatible layout for home-automation consumers, not retained.
pub const ALIAS_TOPICS: &[TopicSpec] = &[
    alias("weewx/outTemp_C", "tempf", F2C),
    alias("weewx/outHumidity", "humidity", Id),
    alias("weewx/dewpoint_C", "dewptf", F2C),
    alias("weewx/windchill_C", "windchillf", F2C),
    alias("weewx/windDir", "winddir", Id),
    alias("weewx/windSpeed_kph", "windspeedmph", M2K),
    alias("weewx/windGust_kph", "windgustmph", M2K),
    alias("weewx/rain_in", "rainin", Id),
    alias("weewx/dayRain_in", "dailyrainin", Id),
    alias("weewx/radiation_Wpm2", "solarradiation", Id),
    alias("weewx/UV", "UV", Id),
    alias("weewx/inTemp_C", "indoortempf", F2C),
    alias("weewx/inHumidity", "indoorhumidity", Id),
    alias("weewx/barometer_inHg", "baromin", Id),
    alias("weewx/outTempBatteryStatus", "lowbatt", Id),
];

/// Every metric topic in publishing order: primary set first, then aliases.
pub fn all_topics() -> impl Iterator<Item = &'static TopicSpec> {
    PRIMARY_TOPICS.iter().chain(ALIAS_TOPICS.iter())
}
