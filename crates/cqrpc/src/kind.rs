use std::fmt;

/// Streaming shape of a call.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CallKind {
    /// One request, one response
    Unary,
    /// Many requests, one response
    ClientStreaming,
    /// One request, many responses
    ServerStreaming,
    /// Many requests, many responses
    BidiStreaming,
}

impl CallKind {
    /// Whether the client may send more than one request.
    #[inline]
    pub fn client_streams(&self) -> bool {
        matches!(self, CallKind::ClientStreaming | CallKind::BidiStreaming)
    }

    /// Whether the server may send more than one response.
    #[inline]
    pub fn server_streams(&self) -> bool {
        matches!(self, CallKind::ServerStreaming | CallKind::BidiStreaming)
    }
}

impl fmt::Display for CallKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            CallKind::Unary => "unary",
            CallKind::ClientStreaming => "client-streaming",
            CallKind::ServerStreaming => "server-streaming",
            CallKind::BidiStreaming => "bidi-streaming",
        };
        f.write_str(s)
    }
}
