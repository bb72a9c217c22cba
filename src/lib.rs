
pub mod constants;
pub mod error;
pub mod geodesy;
pub mod propagation;
pub mod events;
pub mod routing;
pub mod pool;
pub mod external;
pub mod net;
pub mod coordinator;
pub mod module;
pub mod config;
