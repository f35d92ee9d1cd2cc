//! Picking the unit a version query should go to among devices that share
//! a vendor/product pair.

/// Returns the candidate whose serial equals `serial`.
///
/// Without an exact match, a lone candidate whose serial could not be read
/// is accepted. A unit that reported a different serial never is.
pub fn select<T>(candidates: Vec<(T, Option<String>)>, serial: &str) -> Option<T> {
    let total = candidates.len();
    let mut unreadable = None;
    for (candidate, reported) in candidates {
        match reported.as_deref().map(str::trim) {
            Some(reported) if reported == serial => return Some(candidate),
            Some(_) => {}
            None => unreadable = Some(candidate),
        }
    }
    if total == 1 {
        unreadable
    } else {
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn serial(value: &str) -> Option<String> {
        Some(value.to_string())
    }

    #[test]
    fn exact_serial_wins() {
        let picked = select(vec![("a", serial("111")), ("b", None), ("c", serial("222"))], "222");
        assert_eq!(picked, Some("c"));
    }

    #[test]
    fn lone_unreadable_unit_is_accepted() {
        assert_eq!(select(vec![("a", None)], "222"), Some("a"));
    }

    #[test]
    fn unit_with_other_serial_is_rejected() {
        assert_eq!(select(vec![("a", serial("111"))], "222"), None);
    }

    #[test]
    fn unreadable_unit_among_several_is_rejected() {
        assert_eq!(select(vec![("a", serial("111")), ("b", None)], "222"), None);
        assert_eq!(select(vec![("a", None), ("b", None)], "222"), None);
    }

    #[test]
    fn no_candidates() {
        assert_eq!(select::<&str>(Vec::new(), "222"), None);
    }
}
