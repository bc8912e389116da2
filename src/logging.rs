use axum::{
    body::Body,
    http::{Request, Response},
    middleware::Next,
};
use std::panic;
use tracing::{error, info_span, Instrument};
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::prelude::*;
use uuid::Uuid;

pub const REQUEST_ID_HEADER: &str = "x-retrace-request-id";

/// Installs the global subscriber: env filter, stdout, a daily rolling JSON file and
/// span traces for errors. The returned guard must live as long as the process.
pub fn init_tracing(log_dir: &str) -> WorkerGuard {
    let filter = match tracing_subscriber::EnvFilter::try_from_default_env() {
        Ok(f) => f,
        Err(_) => "retrace=info,tower_http=warn".into(),
    };

    let _ = std::fs::create_dir_all(log_dir);
    let file_appender = tracing_appender::rolling::daily(log_dir, "retrace.log");
    let (non_blocking, guard) = tracing_appender::non_blocking(file_appender);

    tracing_subscriber::registry()
        .with(filter)
        .with(tracing_subscriber::fmt::layer().with_target(true))
        .with(
            tracing_subscriber::fmt::layer()
                .json()
                .with_writer(non_blocking)
                .with_ansi(false),
        )
        .with(tracing_error::ErrorLayer::default())
        .init();

    guard
}

/// Sets up a global panic hook that logs panics using tracing.
pub fn setup_panic_hook() {
    let original_hook = panic::take_hook();
    panic::set_hook(Box::new(move |panic_info| {
        let backtrace = std::backtrace::Backtrace::capture();

        let payload = panic_info.payload();
        let message = if let Some(s) = payload.downcast_ref::<&str>() {
            *s
        } else if let Some(s) = payload.downcast_ref::<String>() {
            s.as_str()
        } else {
            "Unknown panic payload"
        };

        let location = panic_info
            .location()
            .map(|l| format!("{}:{}:{}", l.file(), l.line(), l.column()))
            .unwrap_or_else(|| "unknown location".to_string());

        error!(
            target: "panic",
            message = %message,
            location = %location,
            backtrace = %backtrace,
            "FATAL: Application panicked"
        );

        original_hook(panic_info);
    }));
}

pub async fn request_id_middleware(mut req: Request<Body>, next: Next) -> Response<Body> {
    let request_id = Uuid::new_v4().to_string();
    if let Ok(val) = request_id.parse() {
        req.headers_mut().insert(REQUEST_ID_HEADER, val);
    }

    let span = info_span!(
        "request",
        request_id = %crate::str_utils::prefix_chars(&request_id, 8),
        method = %req.method(),
        path = %req.uri().path()
    );
    let mut response = next.run(req).instrument(span).await;
    if let Ok(val) = request_id.parse() {
        response.headers_mut().insert(REQUEST_ID_HEADER, val);
    }
    response
}
