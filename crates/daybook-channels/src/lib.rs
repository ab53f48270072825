//! # Daybook Channels
//!
//! Outbound delivery adapters implementing the engine's collaborator
//! traits: SMTP email reports, chat-webhook reminder nudges, and HTTP
//! clients for the polish and render services. Each adapter owns its own
//! transport details; the engine only sees the trait.

pub mod email;
pub mod polish;
pub mod render;
pub mod webhook;

pub use email::SmtpReportSender;
pub use polish::HttpPolisher;
pub use render::HttpRenderer;
pub use webhook::WebhookNotifier;
