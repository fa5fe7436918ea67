//! Value objects.

pub mod file_pattern;
pub mod path_expression;
pub mod retry_policy;

pub use file_pattern::FilePattern;
pub use path_expression::{FileContext, PathExpression, with_collision_suffix};
pub use retry_policy::RetryPolicy;
