use rand::{distributions::Alphanumeric, Rng};
use uuid::Uuid;

pub const FLIGHT_CODE_LEN: usize = 6;
const MAX_CODE_ATTEMPTS: usize = 16;

/// Generate a new connection id.
pub fn generate_connection_id() -> String {
    Uuid::new_v4().to_string()
}

/// Generate a candidate flight code: six uppercase alphanumerics.
pub fn generate_flight_code() -> String {
    rand::thread_rng()
        .sample_iter(&Alphanumeric)
        .map(|c| char::from(c).to_ascii_uppercase())
        .take(FLIGHT_CODE_LEN)
        .collect()
}

/// Draw codes until one is not taken, giving up after `MAX_CODE_ATTEMPTS`.
pub fn generate_unique_flight_code(is_taken: impl Fn(&str) -> bool) -> Option<String> {
    (0..MAX_CODE_ATTEMPTS)
        .map(|_| generate_flight_code())
        .find(|code| !is_taken(code))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::cell::Cell;

    #[test_timeout::timeout]
    fn connection_ids_are_uuids() {
        let id1 = generate_connection_id();
        let id2 = generate_connection_id();
        assert_ne!(id1, id2);
        assert_eq!(id1.len(), 36);
    }

    #[test_timeout::timeout]
    fn flight_codes_are_six_uppercase_alphanumerics() {
        for _ in 0..100 {
            let code = generate_flight_code();
            assert_eq!(code.len(), FLIGHT_CODE_LEN);
            assert!(code
                .chars()
                .all(|c| c.is_ascii_digit() || c.is_ascii_uppercase()));
        }
    }

    #[test_timeout::timeout]
    fn collisions_are_redrawn() {
        let calls = Cell::new(0);
        let code = generate_unique_flight_code(|_| {
            calls.set(calls.get() + 1);
            calls.get() < 3
        });
        assert_eq!(calls.get(), 3);
        assert_eq!(code.unwrap().len(), FLIGHT_CODE_LEN);
    }

    #[test_timeout::timeout]
    fn gives_up_after_bounded_attempts() {
        let calls = Cell::new(0);
        let code = generate_unique_flight_code(|_| {
            calls.set(calls.get() + 1);
            true
        });
        assert_eq!(code, None);
        assert_eq!(calls.get(), MAX_CODE_ATTEMPTS);
    }
}
