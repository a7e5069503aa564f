//! Standard input/output plumbing for user applications.

pub mod stdio;
