use actix_web::{dev::Server, get, App, HttpResponse, HttpServer, Responder};
use paste::paste;
use prometheus::{register_gauge, register_int_gauge, Gauge, IntGauge, TextEncoder};
use std::sync::OnceLock;
use tracing::info;
use tracing_actix_web::TracingLogger;

macro_rules! static_prom {
    ($name:ident, $kind: ty, $create:expr) => {
        paste! {
            pub fn $name() -> &'static $kind {
                static [<$name:upper>]: OnceLock<$kind> = OnceLock::new();
                [<$name:upper>].get_or_init(|| { $create })
            }
        }
    };
}

// Global prometheus state variables
static_prom!(
    clients_connected,
    IntGauge,
    register_int_gauge!("clients_connected", "Number of connected sessions").unwrap()
);
static_prom!(
    active_subscriptions,
    IntGauge,
    register_int_gauge!(
        "active_subscriptions",
        "Total number of client-to-channel subscriptions currently held"
    )
    .unwrap()
);
static_prom!(
    dispatch_queue_depth,
    IntGauge,
    register_int_gauge!(
        "dispatch_queue_depth",
        "Number of work items waiting in the controller's dispatch queue"
    )
    .unwrap()
);
static_prom!(
    pid_round_duration,
    Gauge,
    register_gauge!(
        "pid_round_duration_seconds",
        "Wall-clock duration of the most recently completed PID sweep"
    )
    .unwrap()
);

#[get("/metrics")]
async fn metrics() -> impl Responder {
    let encoder = TextEncoder::new();
    let metric_families = prometheus::gather();
    HttpResponse::Ok().body(encoder.encode_to_string(&metric_families).unwrap())
}

pub fn start_web_server(metrics_port: u16) -> eyre::Result<Server> {
    info!("Starting metrics webserver");
    let server = HttpServer::new(move || App::new().wrap(TracingLogger::default()).service(metrics))
        .bind(("0.0.0.0", metrics_port))?
        .workers(1)
        .run();
    Ok(server)
}
