use lazy_static::lazy_static;
use prometheus::{
    register_int_counter, register_int_counter_vec, register_int_gauge, IntCounter,
    IntCounterVec, IntGauge,
};
use tokio::io::AsyncWriteExt;
use tokio::net::TcpListener;

lazy_static! {
    pub static ref SNAPSHOTS_INGESTED: IntCounter = register_int_counter!(
        "tripwire_snapshots_ingested_total",
        "Total number of metric snapshots handed to the engine"
    )
    .unwrap();
    pub static ref TRIGGER_EVENTS: IntCounter = register_int_counter!(
        "tripwire_trigger_events_total",
        "Total number of fired trigger events offered for dispatch"
    )
    .unwrap();
    pub static ref SCALE_DISPATCH: IntCounterVec = register_int_counter_vec!(
        "tripwire_scale_dispatch_total",
        "Scaling dispatch attempts by outcome",
        &["outcome"]
    )
    .unwrap();
    pub static ref MONITORED_APPS: IntGauge = register_int_gauge!(
        "tripwire_monitored_apps",
        "Number of applications with at least one registered trigger"
    )
    .unwrap();
}

/// Force registration so every series shows up before its first update.
pub fn init() {
    lazy_static::initialize(&SNAPSHOTS_INGESTED);
    lazy_static::initialize(&TRIGGER_EVENTS);
    lazy_static::initialize(&SCALE_DISPATCH);
    lazy_static::initialize(&MONITORED_APPS);
}

/// Start the metrics server in a background task.
pub fn start_metrics_server(port: u16) {
    init();

    tokio::spawn(async move {
        let addr = format!("0.0.0.0:{}", port);
        match TcpListener::bind(&addr).await {
            Ok(listener) => {
                tracing::info!("Metrics server starting on {}", addr);
                loop {
                    if let Ok((mut socket, _)) = listener.accept().await {
                        tokio::spawn(async move {
                            let body = metrics_handler();
                            let response = format!(
                                "HTTP/1.0 200 OK\r\nConnection: close\r\nContent-Length: {}\r\nContent-Type: text/plain; version=0.0.4\r\n\r\n{}",
                                body.len(),
                                body
                            );
                            let _ = socket.write_all(response.as_bytes()).await;
                            let _ = socket.flush().await;
                        });
                    }
                }
            }
            Err(e) => {
                tracing::error!("Failed to bind metrics server: {}", e);
            }
        }
    });
}

fn metrics_handler() -> String {
    use prometheus::Encoder;
    let encoder = prometheus::TextEncoder::new();

    let mut buffer = Vec::new();
    if let Err(e) = encoder.encode(&prometheus::gather(), &mut buffer) {
        tracing::error!("Failed to encode metrics: {}", e);
    }

    String::from_utf8(buffer).unwrap_or_else(|_| String::from("Encoding error"))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_exposition_lists_engine_series() {
        init();
        SNAPSHOTS_INGESTED.inc();
        SCALE_DISPATCH.with_label_values(&["processed"]).inc();

        let body = metrics_handler();
        assert!(body.contains("tripwire_snapshots_ingested_total"));
        assert!(body.contains("tripwire_trigger_events_total"));
        assert!(body.contains("tripwire_scale_dispatch_total{outcome=\"processed\"}"));
        assert!(body.contains("tripwire_monitored_apps"));
    }
}
