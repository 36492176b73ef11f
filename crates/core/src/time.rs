//! Time and timezone helpers.
//!
//! All instants exchanged over the wire or persisted are absolute
//! (`DateTime<Utc>`); a timezone enters the picture only when rendering the
//! `*_local` presentation fields.

use chrono::{DateTime, Utc};
use chrono_tz::Tz;
use tracing::warn;

/// Format used for every human-facing local timestamp.
const LOCAL_FORMAT: &str = "%Y-%m-%d %H:%M:%S";

/// Current absolute instant.
pub fn now() -> DateTime<Utc> {
    Utc::now()
}

/// Resolve a timezone by IANA name.
///
/// Resolution order: the given name, then the host's zone, then UTC.
/// An unparseable name is logged and treated as absent.
pub fn resolve_zone(name: Option<&str>) -> Tz {
    if let Some(name) = name {
        match name.parse::<Tz>() {
            Ok(tz) => return tz,
            Err(_) => {
                warn!(zone = %name, "unknown timezone, falling back to host zone");
            }
        }
    }
    host_zone().unwrap_or(Tz::UTC)
}

/// The host's IANA zone, if it can be determined.
fn host_zone() -> Option<Tz> {
    iana_time_zone::get_timezone().ok()?.parse().ok()
}

/// Render an instant as `YYYY-MM-DD HH:MM:SS` in the given zone.
pub fn format_local(instant: DateTime<Utc>, tz: Tz) -> String {
    instant.with_timezone(&tz).format(LOCAL_FORMAT).to_string()
}

// ── Tests ────────────────────────────────────────────────────────────
