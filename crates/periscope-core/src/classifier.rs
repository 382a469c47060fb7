//! Session classification predicates.
//!
//! Two questions are asked of every intercepted exchange: does it carry a
//! game API payload, and does it use a secured connection. Both are pure
//! functions over the [`Exchange`] snapshot and are evaluated on the
//! engine's worker threads, so they must never block or fail.

use crate::exchange::Exchange;

/// Path prefix of the game's private API.
pub const API_PATH_PREFIX: &str = "/kcsapi";

/// Content-type the game server uses for API payloads.
pub const API_CONTENT_TYPE: &str = "text/plain";

/// Returns true if the exchange is a game API call.
///
/// Both conditions must hold: the request path starts with
/// [`API_PATH_PREFIX`] and the response content-type equals
/// [`API_CONTENT_TYPE`]. An absent content-type never matches.
pub fn is_api_call(exchange: &Exchange) -> bool {
    exchange.path().starts_with(API_PATH_PREFIX)
        && exchange
            .content_type()
            .is_some_and(|ct| ct == API_CONTENT_TYPE)
}

/// Returns true if the exchange uses a secured connection.
///
/// True if any of: the engine reported the connection as secured, the
/// original URI starts with `https:`, or the original URI contains `:443`.
/// The game has served TLS from addresses like `http://host:443/` where the
/// URI text, not the engine's own flag, is the only reliable signal, so all
/// three checks are tried. The `:443` check is a plain substring match on
/// the whole URI; downstream routing depends on that exact behavior.
pub fn is_secure(exchange: &Exchange) -> bool {
    exchange.secure_flag() || exchange.uri().starts_with("https:") || exchange.uri().contains(":443")
}
