use once_cell::sync::Lazy;
use std::env;

pub static ASSET_STORAGE_URL: Lazy<String> =
    Lazy::new(|| service_url("ASSET_STORAGE_URL", "http://localhost:4000"));

pub static ENHANCE_URL: Lazy<String> =
    Lazy::new(|| service_url("ENHANCE_URL", "http://localhost:4000"));

pub static LISTINGS_URL: Lazy<String> =
    Lazy::new(|| service_url("LISTINGS_URL", "http://localhost:4000"));

pub static AUTH_TOKEN_URL: Lazy<Option<String>> = Lazy::new(|| {
    env::var("AUTH_TOKEN_URL")
        .ok()
        .map(|value| value.trim().to_string())
        .filter(|value| !value.is_empty())
});

pub static AUTH_CLIENT_ID: Lazy<String> =
    Lazy::new(|| env::var("AUTH_CLIENT_ID").unwrap_or_default());

pub static AUTH_CLIENT_SECRET: Lazy<String> =
    Lazy::new(|| env::var("AUTH_CLIENT_SECRET").unwrap_or_default());

fn service_url(key: &str, default: &str) -> String {
    env::var(key)
        .ok()
        .map(|value| value.trim().trim_end_matches('/').to_string())
        .filter(|value| !value.is_empty())
        .unwrap_or_else(|| default.to_string())
}

pub fn env_usize(key: &str, default: usize) -> usize {
    env::var(key)
        .ok()
        .and_then(|value| value.trim().parse::<usize>().ok())
        .filter(|value| *value > 0)
        .unwrap_or(default)
}

pub fn env_u64(key: &str, default: u64) -> u64 {
    env::var(key)
        .ok()
        .and_then(|value| value.trim().parse::<u64>().ok())
        .unwrap_or(default)
}
