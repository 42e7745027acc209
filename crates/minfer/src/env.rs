use std::env;
use std::sync::OnceLock;

static MINFER_OPT_STATS: OnceLock<bool> = OnceLock::new();

fn parse_bool(value: &str) -> bool {
    let normalized = value.trim().to_ascii_lowercase();
    matches!(normalized.as_str(), "1" | "true" | "yes" | "on")
}

pub(crate) fn opt_stats_enabled() -> bool {
    *MINFER_OPT_STATS.get_or_init(|| match env::var("MINFER_OPT_STATS") {
        Ok(value) if !value.trim().is_empty() => parse_bool(&value),
        _ => false,
    })
}
