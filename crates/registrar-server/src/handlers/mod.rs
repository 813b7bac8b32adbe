//! Built-in resource handlers served by the static chain

pub mod registrations;

pub use registrations::{BUILTIN_OWNER_PREFIX, RegistrationHandler, builtin_owner, registration_type_spec};
