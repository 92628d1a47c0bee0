//! Prometheus metrics for monitoring scid-agent ingestion.
//!
//! All metrics use the default Prometheus registry and follow naming conventions:
//! - Histograms: *_seconds (for latency)
//! - Counters: *_total (for counts)

use http_body_util::Full;
use hyper::body::Bytes;
use hyper::server::conn::http1;
use hyper::service::service_fn;
use hyper::{Request, Response, StatusCode};
use hyper_util::rt::TokioIo;
use lazy_static::lazy_static;
use prometheus::{
    register_histogram, register_histogram_vec, register_int_counter, register_int_counter_vec,
    register_int_gauge, register_int_gauge_vec, Encoder, Histogram, HistogramVec, IntCounter,
    IntCounterVec, IntGauge, IntGaugeVec, TextEncoder,
};
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

lazy_static! {
    // ==================== LATENCY METRICS ====================

    pub static ref COMMIT_DURATION: HistogramVec = register_histogram_vec!(
        "scid_agent_commit_duration_seconds",
        "Time spent committing a batch to the sink",
        &["status"],
        vec![0.001, 0.005, 0.01, 0.05, 0.1, 0.5, 1.0, 5.0, 10.0, 30.0]
    )
    .unwrap();
    pub static ref CHECKPOINT_DURATION: HistogramVec = register_histogram_vec!(
        "scid_agent_checkpoint_duration_seconds",
        "Time spent reading and writing checkpoints",
        &["operation"],
        vec![0.0001, 0.0005, 0.001, 0.005, 0.01, 0.05, 0.1, 0.5, 1.0]
    )
    .unwrap();
    pub static ref FILE_READ_DURATION: Histogram = register_histogram!(
        "scid_agent_file_read_duration_seconds",
        "Time spent reading appended bytes from source files",
        vec![0.0001, 0.001, 0.005, 0.01, 0.05, 0.1, 0.5, 1.0]
    )
    .unwrap();

    // ==================== THROUGHPUT METRICS ====================
    pub static ref RECORDS_DECODED_TOTAL: IntCounterVec = register_int_counter_vec!(
        "scid_agent_records_decoded_total",
        "Records decoded from source files",
        &["symbol", "symbol_period"]
    )
    .unwrap();
    pub static ref RECORDS_UPSERTED_TOTAL: IntCounterVec = register_int_counter_vec!(
        "scid_agent_records_upserted_total",
        "Records confirmed committed by the sink",
        &["symbol", "symbol_period"]
    )
    .unwrap();
    pub static ref BATCHES_TOTAL: IntCounterVec = register_int_counter_vec!(
        "scid_agent_batches_total",
        "Batch commit attempts by outcome",
        &["status"]
    )
    .unwrap();

    // ==================== ERROR / ANOMALY COUNTERS ====================
    pub static ref LOOP_ERRORS_TOTAL: IntCounterVec = register_int_counter_vec!(
        "scid_agent_loop_errors_total",
        "Errors seen by ingestion loops by kind",
        &["kind"]
    )
    .unwrap();
    pub static ref BACKOFF_EVENTS_TOTAL: IntCounter = register_int_counter!(
        "scid_agent_backoff_events_total",
        "Transient failures that put a loop into backoff"
    )
    .unwrap();
    pub static ref FATAL_LOOPS_TOTAL: IntCounterVec = register_int_counter_vec!(
        "scid_agent_fatal_loops_total",
        "Ingestion loops halted by a fatal error",
        &["kind"]
    )
    .unwrap();
    pub static ref TRUNCATION_RESETS_TOTAL: IntCounter = register_int_counter!(
        "scid_agent_truncation_resets_total",
        "Checkpoints reset because a source file shrank"
    )
    .unwrap();
    pub static ref INCONSISTENT_PRICE_RECORDS_TOTAL: IntCounter = register_int_counter!(
        "scid_agent_inconsistent_price_records_total",
        "Records whose high/low do not bound open/close"
    )
    .unwrap();

    // ==================== GAUGE METRICS ====================
    pub static ref CHECKPOINT_OFFSET: IntGaugeVec = register_int_gauge_vec!(
        "scid_agent_checkpoint_offset_bytes",
        "Last committed byte offset per source",
        &["source"]
    )
    .unwrap();
    pub static ref ACTIVE_LOOPS: IntGauge = register_int_gauge!(
        "scid_agent_active_loops",
        "Ingestion loops currently running"
    )
    .unwrap();
}

fn render(path: &str) -> Response<Full<Bytes>> {
    if path != "/metrics" {
        let mut response = Response::new(Full::new(Bytes::from_static(b"Not Found")));
        *response.status_mut() = StatusCode::NOT_FOUND;
        return response;
    }

    let encoder = TextEncoder::new();
    let mut buffer = Vec::new();
    if let Err(err) = encoder.encode(&prometheus::gather(), &mut buffer) {
        warn!(error = %err, "failed to encode metrics");
        let mut response = Response::new(Full::new(Bytes::from_static(b"encoding error")));
        *response.status_mut() = StatusCode::INTERNAL_SERVER_ERROR;
        return response;
    }
    let mut response = Response::new(Full::new(Bytes::from(buffer)));
    if let Ok(value) = encoder.format_type().parse() {
        response
            .headers_mut()
            .insert(hyper::header::CONTENT_TYPE, value);
    }
    response
}

/// Serve `GET /metrics` from the default registry until `cancel_token` fires.
pub async fn serve(listener: TcpListener, cancel_token: CancellationToken) {
    if let Ok(addr) = listener.local_addr() {
        info!(%addr, "prometheus metrics listening on /metrics");
    }

    loop {
        tokio::select! {
            biased;
            _ = cancel_token.cancelled() => {
                debug!("metrics server shutting down");
                break;
            }
            accept_result = listener.accept() => {
                let (stream, _) = match accept_result {
                    Ok(conn) => conn,
                    Err(err) => {
                        warn!(error = %err, "failed to accept metrics connection");
                        continue;
                    }
                };

                tokio::spawn(async move {
                    let service = service_fn(|req: Request<hyper::body::Incoming>| async move {
                        Ok::<_, hyper::Error>(render(req.uri().path()))
                    });
                    if let Err(err) = http1::Builder::new()
                        .serve_connection(TokioIo::new(stream), service)
                        .await
                    {
                        debug!(error = %err, "error serving metrics connection");
                    }
                });
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn serves_registered_metrics() {
        TRUNCATION_RESETS_TOTAL.inc_by(0);
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let cancel = CancellationToken::new();
        let server = tokio::spawn(serve(listener, cancel.clone()));

        let body = reqwest::get(format!("http://{addr}/metrics"))
            .await
            .unwrap()
            .text()
            .await
            .unwrap();
        assert!(body.contains("scid_agent_truncation_resets_total"));

        let missing = reqwest::get(format!("http://{addr}/other")).await.unwrap();
        assert_eq!(missing.status().as_u16(), 404);

        cancel.cancel();
        server.await.unwrap();
    }
}
