use lazy_static::lazy_static;
use prometheus::{
    Counter, CounterVec, Gauge, register_counter, register_counter_vec, register_gauge,
};

lazy_static! {
    pub static ref REQUEST_TOTAL: Counter =
        register_counter!("agent_requests_total", "Total number of client actions").unwrap();
    pub static ref RATE_LIMITED_TOTAL: Counter =
        register_counter!("agent_rate_limited_total", "Client actions rejected by the rate limiter").unwrap();
    pub static ref RATE_LIMIT_DEGRADED_TOTAL: Counter = register_counter!(
        "agent_rate_limit_degraded_total",
        "Limiter checks that failed open because the store was unavailable"
    )
    .unwrap();
    pub static ref HEARTBEATS_TOTAL: Counter =
        register_counter!("agent_heartbeats_total", "Heartbeats recorded").unwrap();
    pub static ref DECISIONS_TOTAL: CounterVec = register_counter_vec!(
        "agent_lifecycle_decisions_total",
        "Decision loop evaluations by resulting status",
        &["status"]
    )
    .unwrap();
    pub static ref CONTROL_PLANE_CALLS_TOTAL: CounterVec = register_counter_vec!(
        "agent_control_plane_calls_total",
        "Calls issued to the compute control plane",
        &["operation", "result"]
    )
    .unwrap();
    pub static ref IDLE_MINUTES: Gauge =
        register_gauge!("agent_idle_minutes", "Minutes since the most recent client activity").unwrap();
}
