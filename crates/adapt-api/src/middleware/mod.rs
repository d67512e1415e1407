//! HTTP middleware

pub mod admission;

pub use admission::{
    admission_middleware, public_admission_middleware, request_meta, CapabilityGuard,
};
