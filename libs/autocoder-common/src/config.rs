// Connection settings shared by the worker and the CLI

pub const DEFAULT_REDIS_URL: &str = "redis://127.0.0.1:6379";

/// Redis URL from `REDIS_URL`, falling back to a local instance
pub fn redis_url() -> String {
    std::env::var("REDIS_URL").unwrap_or_else(|_| DEFAULT_REDIS_URL.to_string())
}
