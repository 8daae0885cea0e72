//! Custom Resource Definitions for modrule-operator.
//!
//! - `ModRule`: a declarative patch-or-reject admission rule

mod mod_rule;

pub use mod_rule::*;
