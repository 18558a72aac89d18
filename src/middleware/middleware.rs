// Middleware contract for the request pipeline.

use async_trait::async_trait;

use crate::http::handler::{Handler, Next};

/// A handler transformer composed at server, domain and subdomain scope.
/// Within one scope middlewares run in registration order, the first
/// registered outermost. A middleware may inspect or mutate the handler,
/// rewrite routing keys before their stage resolves, short-circuit by not
/// running `next`, or wrap the downstream call.
#[async_trait]
pub trait Middleware: Send + Sync {
    async fn handle(&self, h: &mut Handler, next: Next<'_>);
}
