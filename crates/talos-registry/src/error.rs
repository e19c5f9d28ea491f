//! Error types for the registry crate.

use thiserror::Error;

/// Result type alias for registry operations.
pub type Result<T> = std::result::Result<T, RegistryError>;

/// Errors that can occur in registry operations.
#[derive(Error, Debug)]
pub enum RegistryError {
    /// No entry for the image.
    #[error("image '{image}' not found in registry '{registry}'")]
    EntryNotFound {
        /// Registry host.
        registry: String,
        /// Image name.
        image: String,
    },

    /// No such tag under the image.
    #[error("tag '{tag}' not found for image '{image}'")]
    TagNotFound {
        /// Image name.
        image: String,
        /// Tag.
        tag: String,
    },
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let err = RegistryError::EntryNotFound {
            registry: "docker.io".to_string(),
            image: "redis".to_string(),
        };
        assert!(err.to_string().contains("redis"));
        assert!(err.to_string().contains("docker.io"));
    }
}
