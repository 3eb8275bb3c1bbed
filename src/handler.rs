use std::sync::Arc;
#[cfg(test)] use mockall::automock;

use crate::context::ContextView;
use crate::endpoint::EndpointRef;

/// The protocol layer riding on a connection. The transport calls these from its scheduler, and
///  always with a reference to the connection's endpoint held, so the handler may call back into
///  the endpoint from any of them.
///
/// Upcalls for a connection are posted in order. `on_connection_closed` is called exactly once,
///  after all data received before the connection went down was delivered. Once protocol code
///  called `close()`, received data not yet delivered is dropped.
#[cfg_attr(test, automock)]
pub trait ProtocolHandler: Send + Sync + 'static {
    fn on_connection_opened(&self) {}

    /// Returning `false` asks the transport to close the connection.
    fn on_bytes_received(&self, buf: &[u8]) -> bool;

    fn on_connection_closed(&self);

    fn on_timer(&self);

    /// target of [crate::endpoint::EndpointGuard::request_callback]
    fn on_callback(&self) {}
}

/// Creates a handler per connection. The handler gets read-only access to the connection's
///  context and a reference to the endpoint it talks to.
pub trait ProtocolHandlerFactory: Send + Sync + 'static {
    fn create(&self, context: ContextView, endpoint: EndpointRef) -> Arc<dyn ProtocolHandler>;
}

impl <F> ProtocolHandlerFactory for F
where F: Fn(ContextView, EndpointRef) -> Arc<dyn ProtocolHandler> + Send + Sync + 'static
{
    fn create(&self, context: ContextView, endpoint: EndpointRef) -> Arc<dyn ProtocolHandler> {
        self(context, endpoint)
    }
}
