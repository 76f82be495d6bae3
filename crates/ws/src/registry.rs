//! Opcode dispatch table, built once at startup.

use std::{collections::HashMap, sync::Arc};

use async_trait::async_trait;

use crate::{errors::WsErrorCode, opcodes::Opcode, subs::ClientId};

/// A successfully handled request: the response frame to send.
#[derive(Clone, Debug)]
pub struct HandlerOutcome {
    pub opcode: Opcode,
    pub payload: Vec<u8>,
}

/// A failed request, carrying the id to echo in the error frame.
#[derive(Clone, Copy, Debug)]
pub struct HandlerError {
    pub request_id: i64,
    pub code: WsErrorCode,
}

impl HandlerError {
    pub fn new(request_id: i64, code: WsErrorCode) -> Self {
        Self { request_id, code }
    }
}

/// Request handler: decodes its own payload (including the `request_id`
/// extraction) and produces exactly one response.
#[async_trait]
pub trait RequestHandler: Send + Sync {
    async fn handle(&self, client: ClientId, payload: &[u8])
        -> Result<HandlerOutcome, HandlerError>;
}

struct RegistryEntry {
    response_opcode: Opcode,
    handler: Arc<dyn RequestHandler>,
}

/// Request-opcode dispatch table. Collisions are a programming error and
/// rejected at startup.
#[derive(Default)]
pub struct OpcodeRegistry {
    entries: HashMap<u8, RegistryEntry>,
}

impl std::fmt::Debug for OpcodeRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("OpcodeRegistry")
            .field("opcodes", &self.entries.keys().collect::<Vec<_>>())
            .finish()
    }
}

impl OpcodeRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a handler for a request opcode.
    ///
    /// # Panics
    ///
    /// On opcode collision, on registering a non-request opcode, or on a
    /// response opcode from the request range. These are startup bugs.
    pub fn register(
        &mut self,
        opcode: Opcode,
        response_opcode: Opcode,
        handler: Arc<dyn RequestHandler>,
    ) {
        assert!(opcode.is_request(), "{opcode:?} is not a request opcode");
        assert!(
            !response_opcode.is_request(),
            "{response_opcode:?} is not a response opcode"
        );
        let prev = self.entries.insert(
            u8::from(opcode),
            RegistryEntry {
                response_opcode,
                handler,
            },
        );
        assert!(prev.is_none(), "opcode collision on {opcode:?}");
    }

    pub fn lookup(&self, opcode: Opcode) -> Option<Arc<dyn RequestHandler>> {
        self.entries.get(&u8::from(opcode)).map(|e| e.handler.clone())
    }

    pub fn response_opcode(&self, opcode: Opcode) -> Option<Opcode> {
        self.entries.get(&u8::from(opcode)).map(|e| e.response_opcode)
    }
}
