// Middleware contract and the bundled reference middlewares.

pub mod alias;
pub mod local_override;
pub mod middleware;

pub use alias::{AliasMiddleware, AliasScope};
pub use local_override::LocalOverrideMiddleware;
pub use middleware::Middleware;
