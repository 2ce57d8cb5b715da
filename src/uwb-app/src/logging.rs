// SPDX-FileCopyrightText: 2025 Stanislaw Grams <stanislawgrams@gmail.com>
//
// SPDX-License-Identifier: BSD-2-Clause

use tracing::Level;
use tracing_subscriber::FmtSubscriber;

/// Parse a configured level name. Accepts `warning` for `warn`.
pub fn parse_level(name: &str) -> Option<Level> {
    match name.trim().to_ascii_lowercase().as_str() {
        "warning" => Some(Level::WARN),
        other => other.parse::<Level>().ok(),
    }
}

/// Install the global fmt subscriber and return the effective level.
/// Falls back to INFO if level is None or invalid.
pub fn init_logging(log_level: Option<&str>) -> Level {
    let level = log_level.and_then(parse_level).unwrap_or(Level::INFO);

    FmtSubscriber::builder()
        .with_target(false)
        .with_max_level(level)
        .init();
    level
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_level() {
        assert_eq!(parse_level("debug"), Some(Level::DEBUG));
        assert_eq!(parse_level(" WARNING "), Some(Level::WARN));
        assert_eq!(parse_level("loud"), None);
    }
}
