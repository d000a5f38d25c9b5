/// Errors raised while building a module's capability table.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum RegistrationError {
    #[error("module name is empty")]
    EmptyName,

    #[error("{category}: identifier is empty")]
    EmptyIdentifier { category: &'static str },

    #[error("{category}: {identifier} is already registered")]
    Duplicate {
        category: &'static str,
        identifier: String,
    },

    /// A template function's self-test fixture is missing data.
    #[error("templateFunctions: fixture for {identifier} is incomplete: {reason}")]
    IncompleteFixture {
        identifier: String,
        reason: &'static str,
    },
}

pub type Result<T> = std::result::Result<T, RegistrationError>;
