//! Gemini API compatible service module
//!
//! Provides `POST /v1/models/{model}:generateContent`, translating Gemini's
//! `contents[]`/`systemInstruction`/`functionDeclarations` shape into the
//! same Kiro upstream request the other dialects produce.

mod converter;
mod handlers;
mod router;
pub mod types;

pub use router::create_router_with_state;
