// Domain-layer modules and shared errors/models
pub mod normalizer {
    pub use crate::normalizer::*;
}

pub mod importer {
    pub use crate::importer::*;
}

pub mod reconciler {
    pub use crate::reconciler::*;
}

pub mod sync_service {
    pub use crate::sync_service::*;
}

pub mod models {
    pub use crate::models::*;
}

pub mod errors {
    pub use crate::errors::*;
}
