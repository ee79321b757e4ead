//! Canonical file name ordering for enumeration.

use std::cmp::Ordering;

/// Compare two file names in canonical enumeration order.
///
/// Case-insensitive first; names equal ignoring case are ordered
/// ordinally so the ordering is total and stable.
///
/// # Arguments
/// * `a` - First file name
/// * `b` - Second file name
///
/// # Returns
/// Ordering result.
pub fn file_name_compare(a: &str, b: &str) -> Ordering {
    let folded: Ordering = a
        .chars()
        .flat_map(char::to_lowercase)
        .cmp(b.chars().flat_map(char::to_lowercase));

    match folded {
        Ordering::Equal => a.cmp(b),
        other => other,
    }
}

/// Check whether two names address the same entry.
pub fn file_name_eq(a: &str, b: &str) -> bool {
    a.to_lowercase() == b.to_lowercase()
}
