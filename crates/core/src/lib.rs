//! Margin Core: tenants, courses and groupings, vendor API clients, content
//! sources, grading and the database layer behind the LMS launch service.

pub mod config;
pub mod connectors;
pub mod content;
pub mod course;
pub mod crypto;
pub mod db;
pub mod error;
pub mod grading;
pub mod grouping;
pub mod http;
pub mod keyed_lock;
pub mod models;
pub mod oauth1;
pub mod oauth2;
pub mod signing;
