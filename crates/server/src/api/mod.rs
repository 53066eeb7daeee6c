pub mod handlers;
pub mod matches;
pub mod middleware;
pub mod reconciler;
pub mod routes;
pub mod webhooks;

pub use routes::create_router;
