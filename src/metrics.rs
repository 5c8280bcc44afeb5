use lazy_static::lazy_static;
use prometheus::{Encoder, IntCounterVec, Opts, Registry, TextEncoder};

lazy_static! {
    static ref REGISTRY: Registry = Registry::new();

    /// `result`: created | duplicate | filtered.
    pub static ref CALLBACK_INGEST_TOTAL: IntCounterVec = {
        let c = IntCounterVec::new(
            Opts::new("callback_ingest_total", "Payment events processed by the ingestor"),
            &["result"],
        )
        .expect("metric");
        REGISTRY.register(Box::new(c.clone())).expect("register callback_ingest_total");
        c
    };

    /// `result`: published | publish_failed | publish_abandoned.
    pub static ref CALLBACK_PRODUCER_TOTAL: IntCounterVec = {
        let c = IntCounterVec::new(
            Opts::new("callback_producer_total", "Outbox producer publish outcomes"),
            &["result"],
        )
        .expect("metric");
        REGISTRY.register(Box::new(c.clone())).expect("register callback_producer_total");
        c
    };

    /// `result`: delivered | rescheduled | abandoned | send_error.
    pub static ref CALLBACK_PROCESSOR_TOTAL: IntCounterVec = {
        let c = IntCounterVec::new(
            Opts::new("callback_processor_total", "Delivery processor send outcomes"),
            &["result"],
        )
        .expect("metric");
        REGISTRY.register(Box::new(c.clone())).expect("register callback_processor_total");
        c
    };
}

/// Forces registration of all counters; call once at startup so `/metrics`
/// is non-empty even before the first event is processed.
pub fn init() {
    lazy_static::initialize(&CALLBACK_INGEST_TOTAL);
    lazy_static::initialize(&CALLBACK_PRODUCER_TOTAL);
    lazy_static::initialize(&CALLBACK_PROCESSOR_TOTAL);
}

/// Renders the registry in Prometheus text exposition format for `/metrics`.
pub fn render() -> Result<String, String> {
    let encoder = TextEncoder::new();
    let families = REGISTRY.gather();
    let mut buf = Vec::new();
    encoder.encode(&families, &mut buf).map_err(|e| e.to_string())?;
    String::from_utf8(buf).map_err(|e| e.to_string())
}
