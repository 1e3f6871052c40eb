//! A tus 1.0.0 resumable-upload server.
//!
//! The protocol engine lives in [`handlers`], storage behind the
//! [`services::store::DataStore`] trait, and [`routes::routes::app`] ties them
//! into an axum router.

pub mod config;
pub mod errors;
pub mod handlers;
pub mod models;
pub mod routes;
pub mod services;
pub mod state;
