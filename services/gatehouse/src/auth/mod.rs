//! Authentication and authorization pipeline.
//!
//! # Purpose
//! Everything between "a bearer token and an original URL came in" and
//! "allow or deny": token verification against rotating Google key sets,
//! the policy-binding projection, conditional-expression evaluation, and
//! the per-request decision that ties them together.
//!
//! # Key invariants
//! - A cached verified subject is only trusted while its token is unexpired.
//! - Policy and key state are never written on the request path.
pub mod decision;
pub mod error;
pub mod expression;
pub mod keys;
pub mod policy;
pub mod token;
pub mod verifier;
