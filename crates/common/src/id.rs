//! ID generation utilities.

use ulid::Ulid;
use uuid::Uuid;

/// ID generator for jobs, leases and recipients.
#[derive(Debug, Clone, Default)]
pub struct IdGenerator {
    _private: (),
}

impl IdGenerator {
    /// Create a new ID generator.
    #[must_use]
    pub const fn new() -> Self {
        Self { _private: () }
    }

    /// Generate a new lower-case ULID.
    ///
    /// Used for job ids: sortable by creation time and short enough to log.
    #[must_use]
    pub fn generate(&self) -> String {
        Ulid::new().to_string().to_lowercase()
    }

    /// Generate a new random UUID v4.
    ///
    /// Leases use this so a claim token carries no timing information.
    #[must_use]
    pub fn generate_uuid_v4(&self) -> Uuid {
        Uuid::new_v4()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_generate_ulid() {
        let id_gen = IdGenerator::new();
        let id1 = id_gen.generate();
        let id2 = id_gen.generate();

        assert_eq!(id1.len(), 26);
        assert_ne!(id1, id2);
        assert_eq!(id1, id1.to_lowercase());
    }

    #[test]
    fn test_generate_lease_uuid() {
        let id_gen = IdGenerator::new();

        assert_eq!(id_gen.generate_uuid_v4().get_version_num(), 4);
        assert_ne!(id_gen.generate_uuid_v4(), id_gen.generate_uuid_v4());
    }
}
