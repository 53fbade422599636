// =============================================================================
// API layer — thin REST/WebSocket edge over the engine interfaces
// =============================================================================

pub mod rest;
pub mod ws;
