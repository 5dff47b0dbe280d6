//! Identifier types.

/// Job identifier.
///
/// Job ids are ULID strings, so lexicographic order is submission order.
pub type JobId = String;

/// Generates a new job id.
#[must_use]
pub fn new_job_id() -> JobId {
    ulid::Ulid::new().to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ids_sort_in_creation_order() {
        let first = new_job_id();
        std::thread::sleep(std::time::Duration::from_millis(2));
        let second = new_job_id();
        assert!(first < second);
        assert_eq!(first.len(), 26);
    }
}
