// Bearer-token authentication. Tokens are issued by the account service;
// this backend only verifies them and scopes every request to `sub`.

pub mod jwt;
pub mod middleware;

pub use middleware::AuthUser;
