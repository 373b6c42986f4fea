//! Route discovery, path search and max-flow planning
//!
//! Routing is read-only: it works on a [`Topology`] snapshot collected from
//! the network and never touches a ledger. The coordinator turns the plans
//! it produces into reservations.

pub mod cache;
pub mod discovery;
pub mod flow;
pub mod paths;
pub mod topology;

pub use cache::{RouteCache, RouteKey};
pub use discovery::{discover, refresh_capacities};
pub use flow::{cost, delivered, PathPlan, Planner};
pub use paths::{find_routes, RouteQuery};
pub use topology::{LineCapacity, NodeInfo, Topology};
