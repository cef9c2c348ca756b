//! Route metric and ranked route table

pub mod rem;
pub mod table;

pub use rem::{Metric, Rem, Route};
pub use table::{RouteNode, RouteTable, Upsert};
