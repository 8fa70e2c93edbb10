/// Call recording boundary
///
/// The SIP client and the UDP relay both report observed calls through
/// this trait; the actual store (Postgres behind a NOTIFY fan-out in
/// production) lives outside this crate. Implementations are
/// fire-and-forget: they spawn their own work and swallow their own
/// errors, so callers never block on recording.

use tracing::info;

pub trait CallSink: Send + Sync {
    fn record_call(&self, number: &str, brand: Option<&str>);
}

/// Canonical form a number is stored under: spaces stripped, uppercased.
pub fn normalize_number(number: &str) -> String {
    number.replace(' ', "").to_uppercase()
}

/// Sink that only logs the observation. Used by the relay (which is a
/// diagnostic tool) and as the stand-in when no store is wired up.
#[derive(Debug, Default)]
pub struct LogSink;

impl CallSink for LogSink {
    fn record_call(&self, number: &str, brand: Option<&str>) {
        let number = normalize_number(number);
        match brand {
            Some(brand) => info!("recorded call from {} ({})", number, brand),
            None => info!("recorded call from {}", number),
        }
    }
}
