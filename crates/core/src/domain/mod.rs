pub mod event;
pub mod flow;
pub mod query;
