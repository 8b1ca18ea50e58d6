//! Environment-driven knobs. Every setting has a default; unparsable values
//! fall back to it.

use std::str::FromStr;

pub fn env_or<T: FromStr>(name: &str, default: T) -> T {
    std::env::var(name)
        .ok()
        .and_then(|s| s.trim().parse::<T>().ok())
        .unwrap_or(default)
}
