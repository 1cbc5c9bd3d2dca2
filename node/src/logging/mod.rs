use lazy_static::lazy_static;
use serde::Serialize;

pub const DEFAULT_DIRECTIVES: &str = "info";

lazy_static! {
    pub static ref RUST_LOG_JSON: bool = std::env::var("RUST_LOG_JSON").is_ok();
}

/// Initializes logging from `RUST_LOG`, falling back to [DEFAULT_DIRECTIVES].
pub fn init() {
    let directives =
        std::env::var("RUST_LOG").unwrap_or_else(|_| DEFAULT_DIRECTIVES.to_string());
    init_with_directives(&directives);
}

pub fn init_with_directives(directives: &str) {
    println!("Logging enabled with directives: {directives}",);
    pretty_env_logger::formatted_timed_builder()
        .parse_filters(directives)
        .format_timestamp_millis()
        .init();
}

/// Renders `value` as pretty JSON when `RUST_LOG_JSON` is set, as `Debug` otherwise.
pub fn pretty_json<T: Serialize + std::fmt::Debug>(value: &T) -> String {
    if !*RUST_LOG_JSON {
        return format!("{value:?}");
    }
    serde_json::to_string_pretty(value).unwrap_or_else(|_| format!("{value:?}"))
}
