/// Errors surfaced to a caller of a resource view.
///
/// Failures internal to the caches (lister errors, dangling role references) are logged and
/// recovered from; they never reach a caller through this type.
#[derive(Clone, Debug, PartialEq, Eq, thiserror::Error)]
pub enum Error {
    /// The name is not in the caller's visible set. Also returned when the name does not exist at
    /// all so that existence is never leaked.
    #[error("{kind} \"{name}\" is forbidden")]
    Forbidden { kind: &'static str, name: String },

    /// The backing registry has not completed its initial list.
    #[error("{0} cache has not synced")]
    NotSynced(&'static str),

    #[error("invalid label selector: {0}")]
    InvalidSelector(String),
}

impl Error {
    pub fn forbidden(kind: &'static str, name: impl ToString) -> Self {
        Self::Forbidden {
            kind,
            name: name.to_string(),
        }
    }
}
