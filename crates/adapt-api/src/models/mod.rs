//! Request and response types for the resource routes.

pub mod resource;
pub mod user;

pub use resource::{KnowledgeEntry, Project, Resource, ResourceKind, Stored, Task, TaskStatus};
pub use user::{Credentials, TokenResponse, UserProfile, UserProfileInput};
