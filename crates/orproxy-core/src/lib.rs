pub mod engine;
pub mod limit;
pub mod pool;
pub mod tracker;
pub mod upstream;

pub use engine::{RouteError, RouterEngine};
pub use limit::{is_permanent_error, is_rate_limit_error, RateLimiter, RateLimiterRegistry};
pub use pool::{display_name, ModelFilter, PoolConfig};
pub use tracker::PermanentFailureTracker;
pub use upstream::{ChatStream, OpenRouterClient, Upstream, UpstreamError};
