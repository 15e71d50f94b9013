pub mod expense;
pub mod rule;
pub mod tenant;
