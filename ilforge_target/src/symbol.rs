//! Deterministic cross-module symbol naming.
//!
//! Methods and token-addressed data share one naming scheme so the
//! linker can resolve references between separately compiled apartments:
//! the apartment id and the raw token, both hex, joined into one
//! identifier-safe string.

use ilforge_cil::token::Token;

/// Symbol name for a token within an apartment.
pub fn token_symbol(apartment: u32, token: Token) -> String {
    format!("ap{:x}_tk{:08x}", apartment, token.raw())
}

/// Symbol name for a synthesized cleanup handler (finally/fault) of a
/// method, keyed by the handler's body offset.
pub fn cleanup_symbol(apartment: u32, method: Token, handler_offset: u32) -> String {
    format!("ap{:x}_tk{:08x}_fin{:x}", apartment, method.raw(), handler_offset)
}
