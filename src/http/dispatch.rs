//! Top-level handler selection.
//!
//! Order: `OPTIONS *` goes to the built-in responder unless disabled; then
//! the configured handler; otherwise the server's default registry.

use std::sync::Arc;

use http::Method;

use crate::http::handler::{GlobalOptions, SharedHandler};
use crate::http::request::Request;
use crate::http::response::ResponseWriter;

#[derive(Clone)]
pub(crate) struct Dispatcher {
    handler: Option<SharedHandler>,
    registry: SharedHandler,
    global_options: Option<SharedHandler>,
}

impl Dispatcher {
    pub(crate) fn new(
        handler: Option<SharedHandler>,
        registry: SharedHandler,
        disable_general_options_handler: bool,
    ) -> Self {
        let global_options: Option<SharedHandler> = if disable_general_options_handler {
            None
        } else {
            Some(Arc::new(GlobalOptions))
        };
        Self {
            handler,
            registry,
            global_options,
        }
    }

    pub(crate) fn select(&self, req: &Request) -> &SharedHandler {
        if *req.method() == Method::OPTIONS && req.target() == "*" {
            if let Some(options) = &self.global_options {
                return options;
            }
        }
        self.handler.as_ref().unwrap_or(&self.registry)
    }

    pub(crate) async fn dispatch(&self, w: &mut ResponseWriter<'_>, req: &Request) {
        self.select(req).serve(w, req).await
    }
}
