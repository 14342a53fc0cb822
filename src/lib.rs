// HTTP surface: webhooks, install flow, organisation API
pub mod api;

// Webhook signatures
pub mod auth;

// Credential broker (Nango)
pub mod broker;

// Event publishing (NATS, in-memory)
pub mod bus;

// Configuration
pub mod config;

// elba API client
pub mod elba;

// Error taxonomy shared by outbound calls
pub mod error;

// Pipeline event model and validation
pub mod event;

// Organisations and their encrypted credentials
pub mod organisation;

// Vendor REST API client
pub mod vendor;
