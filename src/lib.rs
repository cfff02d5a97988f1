//! Open Draft moderation — photo moderation service for the charity CMS.

pub mod config;
pub mod error;
pub mod llm;
pub mod moderation;
pub mod store;
