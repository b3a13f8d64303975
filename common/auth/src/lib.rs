pub mod claims;
pub mod class;
pub mod config;
pub mod error;
pub mod extractors;
pub mod keys;
pub mod verifier;

pub use claims::TokenClaims;
pub use class::{ClassIdentifiers, TokenClass};
pub use config::{JwtConfig, DEFAULT_ISSUER};
pub use error::{AuthError, AuthResult};
pub use extractors::AuthContext;
pub use keys::{KeyPair, KeyStore, RSA_KEY_BITS};
pub use verifier::{RejectionObserver, TokenVerifier};
