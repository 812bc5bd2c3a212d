use lazy_static::lazy_static;
use prometheus::{
    register_int_counter, register_int_counter_vec, register_int_gauge, IntCounter, IntCounterVec,
    IntGauge,
};

lazy_static! {
    pub static ref STUDIO_ACTIVE_SESSIONS: IntGauge =
        register_int_gauge!("studio_active_sessions", "Number of currently active stream sessions").unwrap();
    pub static ref STUDIO_CHUNKS_EMITTED_TOTAL: IntCounterVec = register_int_counter_vec!(
        "studio_chunks_emitted_total",
        "Total number of media chunks relayed over the signaling channel",
        &["source"] // "camera" or "screen"
    )
    .unwrap();
    pub static ref STUDIO_CHUNKS_DISCARDED_TOTAL: IntCounterVec = register_int_counter_vec!(
        "studio_chunks_discarded_total",
        "Total number of media chunks dropped before emission",
        &["reason"] // "inactive_source", "oversized", "channel_closed"
    )
    .unwrap();
    pub static ref STUDIO_SIGNALS_TOTAL: IntCounterVec = register_int_counter_vec!(
        "studio_signals_total",
        "Total number of signaling envelopes processed",
        &["direction"] // "sent" or "received"
    )
    .unwrap();
    pub static ref STUDIO_NEGOTIATION_FAILURES_TOTAL: IntCounter = register_int_counter!(
        "studio_negotiation_failures_total",
        "Total number of peer negotiation failures"
    )
    .unwrap();
    pub static ref STUDIO_CHAT_MESSAGES_TOTAL: IntCounterVec = register_int_counter_vec!(
        "studio_chat_messages_total",
        "Total number of chat messages",
        &["direction"] // "sent" or "received"
    )
    .unwrap();
}

pub fn register_metrics() {
    // Force initialization of lazy_statics
    let _ = STUDIO_ACTIVE_SESSIONS.get();
    let _ = STUDIO_CHUNKS_EMITTED_TOTAL.with_label_values(&["camera"]).get();
    let _ = STUDIO_CHUNKS_DISCARDED_TOTAL.with_label_values(&["none"]).get();
    let _ = STUDIO_SIGNALS_TOTAL.with_label_values(&["sent"]).get();
    let _ = STUDIO_NEGOTIATION_FAILURES_TOTAL.get();
    let _ = STUDIO_CHAT_MESSAGES_TOTAL.with_label_values(&["sent"]).get();
}
