pub mod audit;
pub mod auth;
pub mod config;
pub mod engine;
pub mod ledger;
pub mod limits;
pub mod model;
pub mod notify;
pub mod observability;
pub mod protocol;
pub mod reservation;
pub mod sweeper;
pub mod tenant;
pub mod wal;
pub mod wire;
