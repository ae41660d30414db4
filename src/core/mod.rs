pub mod gateway;
pub mod headers;
pub mod load_balancer;
pub mod pipeline;
pub mod relay;
pub mod vhost;

pub use gateway::GatewayService;
pub use load_balancer::LoadBalancerFactory;
pub use pipeline::{Pipeline, PipelineError, RequestContext, ResponseFilter, RewriteStage};
pub use vhost::VirtualHost;
