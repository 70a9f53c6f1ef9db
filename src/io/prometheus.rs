//! Prometheus metrics HTTP endpoint
//!
//! Exposes kiosk metrics in Prometheus text format at /metrics.
//! Uses hyper for the HTTP server.

use crate::infra::metrics::{Metrics, MetricsSummary, METRICS_BUCKET_BOUNDS, METRICS_NUM_BUCKETS};
use bytes::Bytes;
use http_body_util::Full;
use hyper::server::conn::http1;
use hyper::service::service_fn;
use hyper::{Method, Request, Response, StatusCode};
use hyper_util::rt::TokioIo;
use std::convert::Infallible;
use std::fmt::Write;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::TcpListener;
use tokio::sync::watch;
use tracing::{error, info};

/// Prometheus metric type
enum MetricType {
    Counter,
    Gauge,
}

impl MetricType {
    fn as_str(&self) -> &'static str {
        match self {
            MetricType::Counter => "counter",
            MetricType::Gauge => "gauge",
        }
    }
}

/// Write a simple metric (counter or gauge) with site label
fn write_metric(
    output: &mut String,
    name: &str,
    help: &str,
    typ: MetricType,
    site: &str,
    val: u64,
) {
    let _ = writeln!(output, "# HELP {name} {help}");
    let _ = writeln!(output, "# TYPE {name} {}", typ.as_str());
    let _ = writeln!(output, "{name}{{site=\"{site}\"}} {val}");
}

/// Write a histogram metric with buckets, sum, and count
fn write_histogram(
    output: &mut String,
    name: &str,
    help: &str,
    site: &str,
    buckets: &[u64; METRICS_NUM_BUCKETS],
    avg: u64,
) {
    let _ = writeln!(output, "# HELP {name} {help}");
    let _ = writeln!(output, "# TYPE {name} histogram");

    let mut cumulative = 0u64;
    for (i, &bound) in METRICS_BUCKET_BOUNDS.iter().enumerate() {
        cumulative += buckets[i];
        let _ = writeln!(output, "{name}_bucket{{site=\"{site}\",le=\"{bound}\"}} {cumulative}");
    }
    cumulative += buckets[METRICS_NUM_BUCKETS - 1];
    let _ = writeln!(output, "{name}_bucket{{site=\"{site}\",le=\"+Inf\"}} {cumulative}");

    let count: u64 = buckets.iter().sum();
    let sum = avg * count;
    let _ = writeln!(output, "{name}_sum{{site=\"{site}\"}} {sum}");
    let _ = writeln!(output, "{name}_count{{site=\"{site}\"}} {count}");
}

/// Format metrics in Prometheus text exposition format
fn format_prometheus_metrics(metrics: &Metrics, site_id: &str) -> String {
    let summary = metrics.report();
    let mut output = String::with_capacity(8192);

    write_cash_metrics(&mut output, site_id, &summary);
    write_session_metrics(&mut output, site_id, &summary);
    write_device_metrics(&mut output, site_id, &summary);
    write_dispense_metrics(&mut output, site_id, &summary);

    output
}

fn write_cash_metrics(output: &mut String, site: &str, summary: &MetricsSummary) {
    write_metric(
        output,
        "kiosk_coins_total",
        "Coins accepted",
        MetricType::Counter,
        site,
        summary.coins_accepted,
    );
    write_metric(
        output,
        "kiosk_coin_pesos_total",
        "Peso value of accepted coins",
        MetricType::Counter,
        site,
        summary.coin_value_sum,
    );
    write_metric(
        output,
        "kiosk_pulses_rejected_total",
        "Coin pulses rejected as noise or duplicates",
        MetricType::Counter,
        site,
        summary.pulses_rejected,
    );
    write_metric(
        output,
        "kiosk_bills_total",
        "Bills accepted",
        MetricType::Counter,
        site,
        summary.bills_accepted,
    );
    write_metric(
        output,
        "kiosk_bill_pesos_total",
        "Peso value of accepted bills",
        MetricType::Counter,
        site,
        summary.bill_value_sum,
    );
    write_metric(
        output,
        "kiosk_balance_polls_total",
        "GET_BALANCE polls issued",
        MetricType::Counter,
        site,
        summary.balance_polls,
    );
}

fn write_session_metrics(output: &mut String, site: &str, summary: &MetricsSummary) {
    write_metric(
        output,
        "kiosk_sessions_started_total",
        "Payment sessions started",
        MetricType::Counter,
        site,
        summary.sessions_started,
    );
    write_metric(
        output,
        "kiosk_sessions_completed_total",
        "Payment sessions completed",
        MetricType::Counter,
        site,
        summary.sessions_completed,
    );
    write_metric(
        output,
        "kiosk_sessions_cancelled_total",
        "Payment sessions cancelled",
        MetricType::Counter,
        site,
        summary.sessions_cancelled,
    );
    write_metric(
        output,
        "kiosk_change_requested_pesos_total",
        "Change pesos requested from the hopper",
        MetricType::Counter,
        site,
        summary.change_requested,
    );
    write_metric(
        output,
        "kiosk_change_dispensed_pesos_total",
        "Change pesos actually delivered",
        MetricType::Counter,
        site,
        summary.change_dispensed,
    );
}

fn write_device_metrics(output: &mut String, site: &str, summary: &MetricsSummary) {
    write_metric(
        output,
        "kiosk_device_commands_total",
        "Device commands sent",
        MetricType::Counter,
        site,
        summary.device_commands_total,
    );

    let _ = writeln!(output, "# HELP kiosk_device_cmds_per_sec Device commands per second");
    let _ = writeln!(output, "# TYPE kiosk_device_cmds_per_sec gauge");
    let _ = writeln!(
        output,
        "kiosk_device_cmds_per_sec{{site=\"{site}\"}} {:.2}",
        summary.device_cmds_per_sec
    );

    write_histogram(
        output,
        "kiosk_device_latency_us",
        "Device command round-trip latency in microseconds",
        site,
        &summary.dev_lat_buckets,
        summary.dev_lat_avg_us,
    );
    write_metric(
        output,
        "kiosk_device_latency_p50_us",
        "50th percentile device latency",
        MetricType::Gauge,
        site,
        summary.dev_lat_p50_us,
    );
    write_metric(
        output,
        "kiosk_device_latency_p95_us",
        "95th percentile device latency",
        MetricType::Gauge,
        site,
        summary.dev_lat_p95_us,
    );
    write_metric(
        output,
        "kiosk_device_latency_p99_us",
        "99th percentile device latency",
        MetricType::Gauge,
        site,
        summary.dev_lat_p99_us,
    );
    write_metric(
        output,
        "kiosk_device_retries_total",
        "Device command retry attempts",
        MetricType::Counter,
        site,
        summary.device_retries,
    );
    write_metric(
        output,
        "kiosk_device_timeouts_total",
        "Device commands that exhausted retries on timeout",
        MetricType::Counter,
        site,
        summary.device_timeouts,
    );
    write_metric(
        output,
        "kiosk_link_errors_total",
        "Transport open or connect failures",
        MetricType::Counter,
        site,
        summary.link_errors,
    );
}

fn write_dispense_metrics(output: &mut String, site: &str, summary: &MetricsSummary) {
    write_metric(
        output,
        "kiosk_slot_pulses_total",
        "Slot pulse commands issued",
        MetricType::Counter,
        site,
        summary.slot_pulses,
    );
    write_metric(
        output,
        "kiosk_dispenses_confirmed_total",
        "Dispenses confirmed by the infra-red sensors",
        MetricType::Counter,
        site,
        summary.dispenses_confirmed,
    );
    write_metric(
        output,
        "kiosk_dispense_timeouts_total",
        "Dispense confirmation timeouts",
        MetricType::Counter,
        site,
        summary.dispense_timeouts,
    );

    // Per-slot timeout counters pinpoint a jammed mechanism
    let _ = writeln!(output, "# HELP kiosk_slot_timeouts_total Confirmation timeouts per slot");
    let _ = writeln!(output, "# TYPE kiosk_slot_timeouts_total counter");
    for (slot, count) in &summary.timeouts_by_slot {
        let _ = writeln!(
            output,
            "kiosk_slot_timeouts_total{{site=\"{site}\",slot=\"{slot}\"}} {count}"
        );
    }

    write_metric(
        output,
        "kiosk_pending_dispenses",
        "Current pending-dispense table size",
        MetricType::Gauge,
        site,
        summary.pending_dispenses,
    );
    write_metric(
        output,
        "kiosk_ui_messages_dropped_total",
        "UI messages dropped due to channel full",
        MetricType::Counter,
        site,
        summary.ui_messages_dropped,
    );
}

/// Handle HTTP requests
async fn handle_request(
    req: Request<hyper::body::Incoming>,
    metrics: Arc<Metrics>,
    site_id: Arc<String>,
) -> Result<Response<Full<Bytes>>, Infallible> {
    match (req.method(), req.uri().path()) {
        (&Method::GET, "/metrics") => {
            let body = format_prometheus_metrics(&metrics, &site_id);
            Ok(Response::builder()
                .status(StatusCode::OK)
                .header("Content-Type", "text/plain; version=0.0.4; charset=utf-8")
                .body(Full::new(Bytes::from(body)))
                .expect("static response should not fail"))
        }
        (&Method::GET, "/health") => Ok(Response::builder()
            .status(StatusCode::OK)
            .body(Full::new(Bytes::from("ok")))
            .expect("static response should not fail")),
        _ => Ok(Response::builder()
            .status(StatusCode::NOT_FOUND)
            .body(Full::new(Bytes::from("Not Found")))
            .expect("static response should not fail")),
    }
}

/// Start the Prometheus metrics HTTP server
pub async fn start_metrics_server(
    port: u16,
    metrics: Arc<Metrics>,
    site_id: String,
    mut shutdown: watch::Receiver<bool>,
) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
    let addr = SocketAddr::from(([0, 0, 0, 0], port));
    let listener = TcpListener::bind(addr).await?;
    let site_id = Arc::new(site_id);

    info!(port = %port, site = %site_id, "prometheus_metrics_server_started");

    loop {
        tokio::select! {
            result = listener.accept() => {
                match result {
                    Ok((stream, _addr)) => {
                        let io = TokioIo::new(stream);
                        let metrics = metrics.clone();
                        let site_id = site_id.clone();

                        tokio::spawn(async move {
                            let service = service_fn(move |req| {
                                let metrics = metrics.clone();
                                let site_id = site_id.clone();
                                async move { handle_request(req, metrics, site_id).await }
                            });

                            if let Err(e) = http1::Builder::new()
                                .serve_connection(io, service)
                                .await
                            {
                                error!(error = %e, "prometheus_http_error");
                            }
                        });
                    }
                    Err(e) => {
                        error!(error = %e, "prometheus_accept_error");
                    }
                }
            }
            _ = shutdown.changed() => {
                if *shutdown.borrow() {
                    info!("prometheus_metrics_server_shutdown");
                    return Ok(());
                }
            }
        }
    }
}
