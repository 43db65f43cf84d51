//! External ERP integrations.

pub mod connectors {
    pub use crate::connectors::*;
}
