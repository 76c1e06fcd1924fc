/// Unit conversions applied to station readings before publishing.
///
/// The station reports imperial units. Temperatures go out in Celsius and
/// wind speeds in km/h; everything else is passed through.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Converter {
    Identity,
    FahrenheitToCelsius,
    MphToKph,
}

const KPH_PER_MPH: f64 = 1.60934;

impl Converter {
    pub fn apply(self, value: f64) -> f64 {
        match self {
            Converter::Identity => value,
            Converter::FahrenheitToCelsius => fahrenheit_to_celsius(value),
            Converter::MphToKph => mph_to_kph(value),
        }
    }

    /// Converts and renders with one decimal place.
    pub fn format(self, value: f64) -> String {
        format!("{:.1}", self.apply(value))
    }
}

pub fn fahrenheit_to_celsius(f: f64) -> f64 {
    (f - 32.0) * 5.0 / 9.0
}

pub fn mph_to_kph(v: f64) -> f64 {
    v * KPH_PER_MPH
}
