use docsmith_core::Converter;

/// Shared application state accessible from all handlers.
pub struct AppState {
    pub converter: Converter,
    /// Accepted bearer tokens; empty disables authentication.
    pub bearer_tokens: Vec<String>,
}
