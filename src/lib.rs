pub mod archive;
pub mod cleanup;
pub mod config;
pub mod domain;
pub mod error;
pub mod layout;
pub mod marker;
pub mod output;
pub mod pipeline;
pub mod prune;
pub mod remote;
pub mod section;
pub mod stages;
pub mod table;
