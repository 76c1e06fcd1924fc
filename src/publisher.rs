//! Publish-on-delta evaluation of every metric topic.
//!
//! Each topic keeps the last formatted value it evaluated. A reading is
//! published only when its formatted form differs from that value.

use std::collections::HashMap;
use tokio::sync::Mutex;
use tracing::{debug, warn};

use crate::config::Config;
use crate::conversion::Converter;
use crate::metrics::StationReport;
use crate::models::{ConvertedValue, Outcome};
use crate::mqtt_service::{BrokerSession, QoS};
use crate::topics::{all_topics, TopicSpec};

/// Readings at or below this value mean "no sensor reading".
pub const SENTINEL: f64 = -100.0;

/// Last formatted value per topic suffix.
pub type LastPublishedState = HashMap<&'static str, String>;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Evaluation {
    /// Value the caller stores as the topic's new last value.
    pub last_value: String,
    pub outcome: Outcome,
}

impl Evaluation {
    fn keep(last: &str, outcome: Outcome) -> Self {
        Self {
            last_value: last.to_string(),
            outcome,
        }
    }
}

/// Parses a raw reading; only finite numbers count.
pub fn parse_reading(raw: &str) -> Option<f64> {
    raw.trim().parse::<f64>().ok().filter(|v| v.is_finite())
}

/// Evaluates one raw reading against the last value of its topic and
/// publishes it when it changed.
pub async fn evaluate(
    session: &dyn BrokerSession,
    topic: &str,
    qos: QoS,
    retain: bool,
    raw: &str,
    last: &str,
    converter: Converter,
) -> Evaluation {
    let parsed = match parse_reading(raw) {
        Some(value) => value,
        None => {
            if raw.is_empty() {
                debug!("No value for '{}'.", topic);
            } else {
                warn!("Cannot parse '{}' for '{}'.", raw, topic);
            }
            return Evaluation::keep("", Outcome::Unparseable);
        }
    };

    if !session.is_connected() {
        return Evaluation::keep(last, Outcome::Offline);
    }

    if parsed <= SENTINEL {
        return Evaluation::keep(last, Outcome::Sentinel);
    }

    let converted = ConvertedValue::new(topic, parsed, converter);
    if converted.formatted_value == last {
        return Evaluation {
            last_value: converted.formatted_value,
            outcome: Outcome::Unchanged,
        };
    }

    let payload = converted.formatted_value.clone();
    match session.publish(topic, qos, retain, payload).await {
        Ok(()) => {
            debug!(
                "Message published to '{}': {} ({})",
                converted.name, converted.formatted_value, converted.numeric_value
            );
            Evaluation {
                last_value: converted.formatted_value,
                outcome: Outcome::Published,
            }
        }
        Err(e) => {
            warn!("{}", e);
            // keep the old value so the reading goes out on the next request
            Evaluation::keep(last, Outcome::PublishFailed)
        }
    }
}

/// Counts per outcome for one pass over the topic table.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PublishSummary {
    pub published: usize,
    pub unchanged: usize,
    pub skipped: usize,
    pub failed: usize,
}

impl PublishSummary {
    fn record(&mut self, outcome: Outcome) {
        match outcome {
            Outcome::Published => self.published += 1,
            Outcome::Unchanged => self.unchanged += 1,
            Outcome::Unparseable | Outcome::Sentinel | Outcome::Offline => self.skipped += 1,
            Outcome::PublishFailed => self.failed += 1,
        }
    }
}

/// Owns the last-value state of every topic for the lifetime of the server.
///
/// One pass holds the lock for the whole table, so overlapping requests are
/// applied one after the other.
#[derive(Debug, Default)]
pub struct ChangeTracker {
    last_values: Mutex<LastPublishedState>,
}

impl ChangeTracker {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn publish_report(
        &self,
        session: &dyn BrokerSession,
        config: &Config,
        report: &StationReport,
    ) -> PublishSummary {
        self.publish_topics(session, config, report, all_topics()).await
    }

    async fn publish_topics<'a>(
        &self,
        session: &dyn BrokerSession,
        config: &Config,
        report: &StationReport,
        topics: impl Iterator<Item = &'a TopicSpec>,
    ) -> PublishSummary {
        let mut last_values = self.last_values.lock().await;
        let mut summary = PublishSummary::default();

        for spec in topics {
            let last = last_values.get(spec.suffix).map(String::as_str).unwrap_or("");
            let evaluation = evaluate(
                session,
                &config.topic(spec.suffix),
                QoS::AtMostOnce,
                spec.retain,
                report.raw(spec.field),
                last,
                spec.converter,
            )
            .await;

            summary.record(evaluation.outcome);
            last_values.insert(spec.suffix, evaluation.last_value);
        }

        debug!(
            "Publish pass: {} published, {} unchanged, {} skipped, {} failed.",
            summary.published, summary.unchanged, summary.skipped, summary.failed
        );
        summary
    }
}

#[cfg(test)]
impl ChangeTracker {
    pub async fn last_value(&self, suffix: &str) -> Option<String> {
        self.last_values.lock().await.get(suffix).cloned()
    }
}
