pub mod git_ops;
pub mod slack;
