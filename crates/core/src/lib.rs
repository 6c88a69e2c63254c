//! Core types, source payload schemas, and validation for the lead pipeline.

pub mod error;
pub mod events;
pub mod features;
pub mod insight;
pub mod ledger;
pub mod limits;
pub mod queue;
pub mod schema;
pub mod source;
pub mod unified;

pub use error::{
    DbErrorCode, Error, NormalizationErrorCode, ProviderErrorCode, Result, ValidationErrorCode,
};
pub use events::*;
pub use features::*;
pub use insight::*;
pub use ledger::*;
pub use queue::*;
pub use source::{ParsedPayload, SessionFields, SourceKind, SourcePayload};
pub use unified::*;
