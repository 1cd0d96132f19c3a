//! Train name normalization.
//!
//! Maps an arbitrary uploaded filename onto a name that is safe both as a
//! path component and as a container registry repository.

use regex::Regex;
use std::sync::LazyLock;

/// Namespace every train name carries.
pub const TRAIN_PREFIX: &str = "train_";

/// Archive suffix stripped from uploaded filenames.
const ARCHIVE_SUFFIX: &str = ".tar";

// Anything outside the allow-list, plus runs of underscores, collapses to one `_`
static DISALLOWED: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"(?:[^a-z0-9_-]|_)+").unwrap());

/// Normalize an uploaded filename into a canonical train name.
///
/// Total and idempotent: `normalize(&normalize(x)) == normalize(x)` holds
/// for every input, and the result is never empty.
///
/// ```
/// use trainbuilder_core::normalize;
///
/// assert_eq!(normalize("My Train!!.tar"), "train_my_train");
/// assert_eq!(normalize("train_foo.tar"), "train_foo");
/// ```
pub fn normalize(raw: &str) -> String {
    let lowered = raw.to_lowercase();
    let stem = lowered.strip_suffix(ARCHIVE_SUFFIX).unwrap_or(&lowered);
    let replaced = DISALLOWED.replace_all(stem, "_");
    let lead = replaced.trim_start_matches(['_', '-']);
    let body = match lead.strip_prefix(TRAIN_PREFIX) {
        Some(rest) => rest.trim_matches(['_', '-']),
        None => lead.trim_end_matches(['_', '-']),
    };

    let mut name = format!("{}{}", TRAIN_PREFIX, body);

    if name.ends_with('_') {
        name.push('s');
    }
    name
}
