pub mod aggregate;
pub mod budget;
pub mod config;
pub mod corpus;
pub mod counters;
pub mod histogram;
pub mod meter;
pub mod operation;
pub mod periodic;
pub mod pool;
pub mod ramp;
pub mod reporter;
pub mod runner;
pub mod sender;
pub mod series;
pub mod session;
pub mod stats;
pub mod upload;

pub use aggregate::*;
pub use budget::*;
pub use config::*;
pub use corpus::*;
pub use counters::*;
pub use histogram::*;
pub use meter::*;
pub use operation::*;
pub use periodic::*;
pub use pool::*;
pub use ramp::*;
pub use reporter::*;
pub use runner::*;
pub use sender::*;
pub use series::*;
pub use session::*;
pub use stats::*;
pub use upload::*;
