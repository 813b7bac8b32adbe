//! Registrar CRD Types
//!
//! This crate provides the resource types served by the registrar control plane.
//!
//! # API Group
//!
//! The built-in `Registration` type lives in the `registrar.io/v1` API group.
//! Dynamically registered types live in whatever group their registration names.
//!
//! # Resources
//!
//! - `Registration` - Declares a new API resource type at runtime
//! - `DynamicObject` - An opaque instance of a registered type
//!
//! # Status
//!
//! Registrations carry a keyed set of `Condition`s (`NameConflict`, `Terminating`)
//! written only by the control plane.

pub mod condition;
pub mod dynamic;
pub mod error;
pub mod metadata;
pub mod registration;

pub use condition::*;
pub use dynamic::*;
pub use error::*;
pub use metadata::*;
pub use registration::*;

/// API version for the built-in registration type
pub const API_VERSION: &str = "registrar.io/v1";

/// API group for the built-in registration type
pub const API_GROUP: &str = "registrar.io";

/// API version string
pub const VERSION: &str = "v1";

/// Finalizer attached to a registration while its instances are drained
pub const DRAIN_FINALIZER: &str = "registrar.io/drain-instances";
