pub mod check;
pub mod config;
pub mod fetch;
pub mod filesystem;
pub mod fix;
pub mod links;
pub mod logging;
pub mod post_map;
pub mod rename;
pub mod resolve;
pub mod rules;
pub mod runtime;
pub mod sanitize;
