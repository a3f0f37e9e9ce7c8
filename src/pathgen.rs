//! Destination-key minting.
//!
//! Keys look like `optimized/2024-05-01-17-32-09-123_+02_3f1a….jpeg`: local
//! wall-clock timestamp, UTC offset, then a v4 UUID so two mints can never
//! collide.

use chrono::{Local, Offset};
use uuid::Uuid;

/// Mint a fresh, collision-free destination key for the given extension.
pub fn mint(extension: &str) -> String {
    let now = Local::now();
    let stamp = now.format("%Y-%m-%d-%H-%M-%S-%3f");
    let offset = format_utc_offset(now.offset().fix().local_minus_utc());
    format!("optimized/{stamp}_{offset}_{}.{extension}", Uuid::new_v4())
}

/// UTC offset in hours(-minutes) form; minutes are omitted for whole-hour
/// offsets.
fn format_utc_offset(seconds: i32) -> String {
    let sign = if seconds < 0 { '-' } else { '+' };
    let total_minutes = seconds.unsigned_abs() / 60;
    let (hours, minutes) = (total_minutes / 60, total_minutes % 60);
    if minutes == 0 {
        format!("{sign}{hours:02}")
    } else {
        format!("{sign}{hours:02}:{minutes:02}")
    }
}
