/// Router, handlers, auth middleware.
pub mod http;
/// HTTP/WS wire types.
pub mod protocol;
/// Terminal streaming over WebSocket.
pub mod ws;
