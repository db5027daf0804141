use thiserror::Error;

use crate::dot::Version;

/// CRDT Result alias to reduce redundency in function return types
pub type Result<T> = std::result::Result<T, Error>;

/// Possible CRDT error codes
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum Error {
    /// A dot was reused for a different write.
    ///
    /// Dots are used exactly once for the lifetime of a CRDT. Seeing the same
    /// actor/version pair carry two different mutations means two writers
    /// shared an actor identity. That is a misuse of the actor contract, not
    /// a CRDT conflict, so it is surfaced instead of resolved.
    #[error("version {version} was already used by a different write for this actor")]
    ConflictingDot {
        /// The version that collided.
        version: Version,
    },
}
