//! Webhook module for mutating admission requests.
//!
//! The single `/mutate` endpoint runs the full rule pipeline: synthetic-ref
//! injection, tiered Patch rules, then Reject rules against the post-patch
//! document.

mod server;

pub use server::{
    create_webhook_router, run_webhook_server, WebhookError, WebhookState, WEBHOOK_CERT_PATH,
    WEBHOOK_KEY_PATH, WEBHOOK_PORT,
};
