//! Request pipeline of a multi-tenant chat-bot control panel.
//!
//! Every request flows through a fixed chain of stages that attach the cache
//! client, session, identity, active guild and bot permissions to a
//! per-request [`context::RequestContext`]. Handlers are adapted onto routes by
//! [`controller`], which turns their errors into page alerts or JSON envelopes.

pub mod botrest;
pub mod cache;
pub mod config;
pub mod context;
pub mod controller;
pub mod database;
pub mod discord;
pub mod error;
pub mod form;
pub mod guild;
pub mod health;
pub mod identity;
pub mod models;
pub mod oauth;
pub mod session;
pub mod settings;
pub mod telemetry;
pub mod web;

#[cfg(test)]
pub(crate) mod testing;
