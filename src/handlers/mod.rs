//! HTTP handlers for record CRUD and the admin surface.

pub mod admin;
pub mod entity;
