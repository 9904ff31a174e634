/// Errors raised while parsing or validating a case definition.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum DefinitionError {
    #[error("invalid definition JSON: {message}")]
    Parse { message: String },

    #[error("duplicate activity id '{activity_id}'")]
    DuplicateActivity { activity_id: String },

    #[error("activity '{activity_id}' declares sentry '{sentry_id}' more than once")]
    DuplicateSentry {
        activity_id: String,
        sentry_id: String,
    },

    #[error("activity '{activity_id}': {message}")]
    InvalidActivity {
        activity_id: String,
        message: String,
    },

    #[error("activity '{activity_id}' calls another definition but has no called_element")]
    MissingCalledElement { activity_id: String },

    /// A criterion references a sentry that its sentry scope does not declare.
    #[error("activity '{activity_id}' references unknown sentry '{sentry_id}'")]
    UnknownSentry {
        activity_id: String,
        sentry_id: String,
    },

    /// An on-part source is not a child of the container declaring the sentry.
    #[error("sentry '{sentry_id}' has an on-part with unknown source '{source_id}'")]
    UnknownOnPartSource { sentry_id: String, source_id: String },

    #[error("sentry dependency cycle detected: {path}")]
    SentryCycle { path: String },
}
