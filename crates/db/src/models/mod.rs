//! Row structs and DTOs.
//!
//! Each submodule contains the `FromRow` entity struct for its table plus
//! the input and outcome types its repository methods take and return.

pub mod admin;
pub mod job;
