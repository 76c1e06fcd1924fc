use std::sync::Arc;
use std::time::Duration;
use time::OffsetDateTime;
use tracing::{debug, error, info, warn};

use crate::config::Config;
use crate::metrics::StationReport;
use crate::mqtt_service::{BrokerManager, BrokerSession, QoS};
use crate::topics::{INFO_SUFFIX, STATUS_SUFFIX};

/// How long shutdown waits for the offline marker to reach the broker.
const SHUTDOWN_GRACE: Duration = Duration::from_secs(2);

/// Publish the liveness marker.
pub async fn publish_status(session: &dyn BrokerSession, config: &Config, alive: bool) {
    let topic = config.topic(STATUS_SUFFIX);
    let payload = if alive { "1" } else { "0" };
    if let Err(e) = session
        .publish(&topic, QoS::AtMostOnce, true, payload.to_string())
        .await
    {
        warn!("{}", e);
    }
}

pub fn station_info(report: &StationReport, received_at: OffsetDateTime) -> serde_json::Value {
    serde_json::json!({
        "softwaretype": report.raw("softwaretype"),
        "received_at": received_at.unix_timestamp(),
    })
}

/// Publish what the station told us about itself.
pub async fn publish_station_info(session: &dyn BrokerSession, config: &Config, report: &StationReport) {
    let topic = config.topic(INFO_SUFFIX);
    let payload = station_info(report, OffsetDateTime::now_utc()).to_string();
    if let Err(e) = session
        .publish(&topic, QoS::AtMostOnce, false, payload)
        .await
    {
        warn!("{}", e);
    }
}

/// Publishes the offline marker and disconnects, if a session is still up.
pub async fn go_offline(broker: &BrokerManager, config: &Config) {
    match broker.current().await {
        Some(session) => {
            publish_status(session.as_ref(), config, false).await;
            session.close(SHUTDOWN_GRACE).await;
        }
        None => debug!("No MQTT session to close."),
    }
}

/// Wait for Ctrl-C, then take the bridge offline.
pub async fn handle_shutdown(broker: Arc<BrokerManager>, config: Arc<Config>) {
    if let Err(e) = tokio::signal::ctrl_c().await {
        error!("Failed to handle termination signal: {:?}", e);
        return;
    }

    info!("Bridge is shutting down...");
    go_offline(&broker, &config).await;
}
