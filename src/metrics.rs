// metrics.rs - Prometheus counters for the queue layer
use prometheus::{IntCounter, IntCounterVec, IntGauge, Registry};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum MetricsError {
    #[error("prometheus error: {0}")]
    Prometheus(#[from] prometheus::Error),
}

#[derive(Debug, Clone)]
pub struct Metrics {
    registry: Registry,
    pub frames_tx: IntCounter,
    pub frames_rx: IntCounter,
    pub rx_drops: IntCounterVec,
    pub bytes_pushed: IntCounter,
    pub bytes_popped: IntCounter,
    pub would_block_total: IntCounter,
    pub protocol_errors: IntCounter,
    pub requests_parked: IntCounter,
    pub requests_cancelled: IntCounter,
    pub open_queues: IntGauge,
    pub work_queue_depth: IntGauge,
}

impl Metrics {
    pub fn new() -> Result<Self, MetricsError> {
        let registry = Registry::new_custom(Some("qport".into()), None)?;

        macro_rules! register_counter {
            ($name:expr, $help:expr) => {{
                let counter = IntCounter::new($name, $help)?;
                registry.register(Box::new(counter.clone()))?;
                counter
            }};
        }

        macro_rules! register_counter_vec {
            ($name:expr, $help:expr, $labels:expr) => {{
                let counter = IntCounterVec::new(prometheus::Opts::new($name, $help), $labels)?;
                registry.register(Box::new(counter.clone()))?;
                counter
            }};
        }

        macro_rules! register_gauge {
            ($name:expr, $help:expr) => {{
                let gauge = IntGauge::new($name, $help)?;
                registry.register(Box::new(gauge.clone()))?;
                gauge
            }};
        }

        let frames_tx = register_counter!("frames_tx_total", "Frames fully transmitted");
        let frames_rx = register_counter!("frames_rx_total", "Frames fully received");
        let rx_drops = register_counter_vec!(
            "rx_drops_total",
            "Received frames silently dropped, by reason",
            &["reason"]
        );
        let bytes_pushed = register_counter!("bytes_pushed_total", "Payload bytes pushed");
        let bytes_popped = register_counter!("bytes_popped_total", "Payload bytes popped");
        let would_block_total = register_counter!(
            "would_block_total",
            "Operations deferred because the transport would block"
        );
        let protocol_errors =
            register_counter!("protocol_errors_total", "Requests failed by malformed frames");
        let requests_parked =
            register_counter!("requests_parked_total", "Requests parked after a first attempt");
        let requests_cancelled =
            register_counter!("requests_cancelled_total", "Requests cancelled by close");
        let open_queues = register_gauge!("open_queues", "Live queue descriptors");
        let work_queue_depth =
            register_gauge!("work_queue_depth", "Parked tokens across all queues");

        Ok(Self {
            registry,
            frames_tx,
            frames_rx,
            rx_drops,
            bytes_pushed,
            bytes_popped,
            would_block_total,
            protocol_errors,
            requests_parked,
            requests_cancelled,
            open_queues,
            work_queue_depth,
        })
    }

    pub fn registry(&self) -> &Registry {
        &self.registry
    }

    pub fn gather(&self) -> Vec<prometheus::proto::MetricFamily> {
        self.registry.gather()
    }
}
