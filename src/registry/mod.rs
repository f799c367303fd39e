//! Backend registry
//!
//! [`validator`] turns a raw key → location document into an immutable,
//! versioned [`RegistrySnapshot`]. [`store`] holds the current snapshot behind an
//! atomic pointer so reloads never expose a half-updated registry.

pub mod store;
pub mod validator;

pub use store::RegistryStore;
pub use validator::{
    validate, BackendKind, RawEntry, RawLocation, RawRegistry, RegistryEntry, RegistryError,
    RegistryIssue, RegistrySnapshot, ALLOWED_SCHEMES,
};
