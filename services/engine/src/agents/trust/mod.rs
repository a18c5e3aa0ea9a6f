//! Trust Conditions
//!
//! Compiles GitHub Actions trust policies into IAM conditional-access
//! expressions and validates expressions from any source.
//!
//! ## Example Usage
//!
//! ```
//! use wif_engine::agents::trust::{compile, validate, TrustConditionSpec};
//!
//! let spec = TrustConditionSpec::new("acme/app")
//!     .branch("main")
//!     .require_actor(true);
//!
//! let condition = compile(&spec).unwrap();
//! assert_eq!(condition.title, "repo+branch+actor");
//! assert!(validate(&condition.expression).is_ok());
//! ```

pub mod compiler;
pub mod expr;
pub mod types;
pub mod validator;

pub use compiler::{build_expression, compile, title_for, validate_repository};
pub use expr::{Claim, Expr};
pub use types::*;
pub use validator::validate;
