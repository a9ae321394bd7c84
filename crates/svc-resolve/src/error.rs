/// Errors raised while resolving requirements.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// No pool offers a candidate for a requirement.
    #[error("no service satisfies {name} (version '{version}', minversion '{minversion}')")]
    UnsatisfiableDependency {
        name: String,
        version: String,
        minversion: String,
    },

    /// The resolved set contains a dependency cycle.
    #[error("dependency cycle among: {}", participants.join(", "))]
    CyclicDependency { participants: Vec<String> },

    #[error(transparent)]
    Meta(#[from] svc_meta::Error),
}

pub type Result<T> = std::result::Result<T, Error>;
